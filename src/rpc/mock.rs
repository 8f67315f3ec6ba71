//! In-memory RPC server for tests and offline development
//!
//! [`MockServer`] answers requests with a handler closure and exposes knobs to
//! simulate the failure modes the client has to cope with: a server that
//! stops answering, a dead heartbeat, and calls that only finish once
//! interrupted. Requests and replies go through the real wire encoding.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AppResult, ScopeError};
use crate::rpc::channel::{Connector, HeartbeatFeed, PushChannel, RequestChannel};
use crate::rpc::wire::{self, Kwargs, Multipart, INTERRUPT_PAYLOAD};

/// How the mock answers one request.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Answer with a `value` reply.
    Value(Value),
    /// Answer with an `error` reply.
    Error(Value),
    /// Answer with a `bindata` reply.
    Binary(Bytes),
    /// Swallow the request.
    NoReply,
    /// Hold the reply until an interrupt arrives.
    AfterInterrupt(Box<MockResponse>),
}

type Handler = dyn Fn(&str, &[Value], &Kwargs) -> MockResponse + Send + Sync;

struct MockState {
    handler: Box<Handler>,
    responsive: AtomicBool,
    alive: AtomicBool,
    requests: Mutex<Vec<(String, Vec<Value>, Kwargs)>>,
    interrupts: AtomicUsize,
    connections: AtomicUsize,
    heartbeat_feeds: AtomicUsize,
    refused_feeds: AtomicUsize,
}

/// In-process stand-in for the scope server.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    /// Server answering every request through `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value], &Kwargs) -> MockResponse + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                handler: Box::new(handler),
                responsive: AtomicBool::new(true),
                alive: AtomicBool::new(true),
                requests: Mutex::new(Vec::new()),
                interrupts: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
                heartbeat_feeds: AtomicUsize::new(0),
                refused_feeds: AtomicUsize::new(0),
            }),
        }
    }

    /// When unresponsive, requests are swallowed and the channel that sent
    /// them stays wedged until the client reconnects.
    pub fn set_responsive(&self, responsive: bool) {
        self.state.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Whether heartbeat checks succeed.
    pub fn set_alive(&self, alive: bool) {
        self.state.alive.store(alive, Ordering::SeqCst);
    }

    /// Commands received so far, with their arguments.
    pub fn requests(&self) -> Vec<(String, Vec<Value>, Kwargs)> {
        self.state.requests.lock().clone()
    }

    /// Interrupts received so far.
    pub fn interrupt_count(&self) -> usize {
        self.state.interrupts.load(Ordering::SeqCst)
    }

    /// Request channels opened so far (one per connect/reconnect).
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Heartbeat feeds handed out so far.
    pub fn heartbeat_feed_count(&self) -> usize {
        self.state.heartbeat_feeds.load(Ordering::SeqCst)
    }

    /// Make the next `count` heartbeat subscriptions fail.
    pub fn refuse_heartbeat_feeds(&self, count: usize) {
        self.state.refused_feeds.store(count, Ordering::SeqCst);
    }

    /// Connector whose channels reach this server.
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }
}

/// Connector handing out channels bound to a [`MockServer`].
#[derive(Clone)]
pub struct MockConnector {
    server: MockServer,
}

enum Pending {
    Ready(Multipart),
    AwaitingInterrupt { reply: MockResponse, interrupts_seen: usize },
}

struct MockRequestChannel {
    server: MockServer,
    pending: Option<Pending>,
    wedged: bool,
}

impl MockRequestChannel {
    fn encode(response: MockResponse) -> AppResult<Option<Multipart>> {
        Ok(match response {
            MockResponse::Value(v) => Some(wire::value_reply(&v)?),
            MockResponse::Error(e) => Some(wire::error_reply(&e)?),
            MockResponse::Binary(b) => Some(wire::binary_reply(b)),
            MockResponse::NoReply | MockResponse::AfterInterrupt(_) => None,
        })
    }

    fn take_ready(&mut self) -> AppResult<Option<Multipart>> {
        match self.pending.take() {
            Some(Pending::Ready(frame)) => Ok(Some(frame)),
            Some(Pending::AwaitingInterrupt { reply, interrupts_seen }) => {
                if self.server.interrupt_count() > interrupts_seen {
                    Self::encode(reply)
                } else {
                    self.pending = Some(Pending::AwaitingInterrupt { reply, interrupts_seen });
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RequestChannel for MockRequestChannel {
    async fn send(&mut self, request: Multipart) -> AppResult<()> {
        let payload = request
            .first()
            .ok_or_else(|| ScopeError::Protocol("empty request".into()))?;
        let (command, args, kwargs) = wire::decode_request(payload)?;
        debug!("Mock server received {command}");
        let state = &self.server.state;
        state
            .requests
            .lock()
            .push((command.clone(), args.clone(), kwargs.clone()));

        if self.wedged || !state.responsive.load(Ordering::SeqCst) {
            self.wedged = true;
            self.pending = None;
            return Ok(());
        }

        self.pending = match (state.handler)(&command, &args, &kwargs) {
            MockResponse::AfterInterrupt(reply) => Some(Pending::AwaitingInterrupt {
                reply: *reply,
                interrupts_seen: self.server.interrupt_count(),
            }),
            other => Self::encode(other)?.map(Pending::Ready),
        };
        Ok(())
    }

    async fn recv_timeout(&mut self, wait: Duration) -> AppResult<Option<Multipart>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.take_ready()? {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(5))).await;
        }
    }
}

struct MockPushChannel {
    server: MockServer,
}

#[async_trait]
impl PushChannel for MockPushChannel {
    async fn push(&mut self, payload: &[u8]) -> AppResult<()> {
        if payload == INTERRUPT_PAYLOAD {
            self.server.state.interrupts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockHeartbeatFeed {
    server: MockServer,
}

#[async_trait]
impl HeartbeatFeed for MockHeartbeatFeed {
    async fn check(&mut self, _wait: Duration) -> bool {
        self.server.state.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn request_channel(&self, _addr: &str) -> AppResult<Box<dyn RequestChannel>> {
        self.server.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRequestChannel {
            server: self.server.clone(),
            pending: None,
            wedged: false,
        }))
    }

    async fn push_channel(&self, _addr: &str) -> AppResult<Box<dyn PushChannel>> {
        Ok(Box::new(MockPushChannel {
            server: self.server.clone(),
        }))
    }

    async fn heartbeat_feed(&self, addr: &str) -> AppResult<Box<dyn HeartbeatFeed>> {
        let refused = self
            .server
            .state
            .refused_feeds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ScopeError::Transport(format!("subscribe to {addr} refused")));
        }
        self.server.state.heartbeat_feeds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHeartbeatFeed {
            server: self.server.clone(),
        }))
    }
}
