//! Microscope control library.
//!
//! Two independent stacks share the error and configuration types:
//!
//! - [`messaging`] and [`device`]: callback-based request/response plumbing
//!   for serial devices such as the Leica stand, where replies may arrive out
//!   of order and mix with status notifications.
//! - [`rpc`]: the client side of the scope server's RPC interface, with
//!   heartbeat monitoring, interrupts, reconnect and a proxy namespace built
//!   from the server's procedure catalog.

pub mod config;
pub mod device;
pub mod error;
pub mod messaging;
pub mod rpc;

pub use config::ScopeConfig;
pub use error::{AppResult, ScopeError};
