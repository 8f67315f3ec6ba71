//! RPC client for the scope server
//!
//! - [`wire`]: request/reply encoding
//! - [`channel`]: the channel traits a [`Connector`] hands out
//! - [`zmq`] and [`mock`]: ZeroMQ and in-process connectors
//! - [`heartbeat`]: liveness monitoring independent of the call path
//! - [`client`]: [`RpcClient`] with timeouts, interrupts and reconnect
//! - [`proxy`]: namespace tree built from the server's procedure catalog
//! - [`transfer`]: fetching packed image buffers

pub mod channel;
pub mod client;
pub mod heartbeat;
pub mod mock;
pub mod proxy;
pub mod transfer;
pub mod wire;
pub mod zmq;

pub use channel::{Connector, HeartbeatFeed, PushChannel, RequestChannel};
pub use client::{proxy_function, proxy_namespace, RpcClient, SharedClient};
pub use heartbeat::{HeartbeatMonitor, HeartbeatState};
pub use proxy::{ArgSpec, Namespace, NamespaceBuilder, ProcedureDescriptor, ProxyFunction};
pub use transfer::{BufferRegistry, ImageBuffer, ImageDescriptor, ImageFetcher, MemoryOrder};
pub use wire::{Kwargs, Reply};
pub use zmq::ZmqConnector;
