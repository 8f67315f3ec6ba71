//! ZeroMQ channels
//!
//! Requests go out on a DEALER socket that speaks the REQ envelope with
//! request correlation: `[request-id, "", request...]` out, and the REP server
//! echoes the envelope back as `[request-id, "", tag, payload]`. Replies whose
//! id is not the outstanding one belong to abandoned calls and are dropped, so
//! a new request can go out without waiting for the last one to be answered.
//!
//! Interrupts go out on a PUSH socket. Heartbeats arrive on a SUB socket
//! subscribed to everything.
//!
//! Sockets connect lazily, so a client can be built before the server is up.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};
use zeromq::{
    DealerSocket, PushSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage,
};

use crate::error::{AppResult, ScopeError};
use crate::rpc::channel::{Connector, HeartbeatFeed, PushChannel, RequestChannel};
use crate::rpc::wire::Multipart;

/// Longest a push may block before the interrupt is reported lost.
const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `tcp://host:port` for a bare `host:port`; full endpoints pass through.
pub fn endpoint(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("tcp://{addr}")
    }
}

fn transport_error(action: &str, addr: &str, err: ZmqError) -> ScopeError {
    ScopeError::Transport(format!("{action} {addr} failed: {err}"))
}

/// Build a message from its parts, in order.
pub fn to_message(parts: Multipart) -> Option<ZmqMessage> {
    let mut parts = parts.into_iter();
    let mut message = ZmqMessage::from(parts.next()?);
    for part in parts {
        message.push_back(part);
    }
    Some(message)
}

/// Request id envelope part.
pub fn request_id_part(id: u32) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

/// Parse the request id envelope part.
pub fn parse_request_id(part: &[u8]) -> Option<u32> {
    part.try_into().ok().map(u32::from_be_bytes)
}

/// Request/reply channel with request-id correlation.
pub struct ZmqRequestChannel {
    addr: String,
    socket: Option<DealerSocket>,
    next_id: u32,
    outstanding: Option<u32>,
}

impl ZmqRequestChannel {
    /// Channel to `addr`; nothing connects until the first send.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            socket: None,
            next_id: 1,
            outstanding: None,
        }
    }

    async fn socket(&mut self) -> AppResult<&mut DealerSocket> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let mut socket = DealerSocket::new();
                socket
                    .connect(&endpoint(&self.addr))
                    .await
                    .map_err(|e| transport_error("connect to", &self.addr, e))?;
                debug!("Request socket connected to {}", self.addr);
                socket
            }
        };
        Ok(self.socket.insert(socket))
    }
}

#[async_trait]
impl RequestChannel for ZmqRequestChannel {
    async fn send(&mut self, request: Multipart) -> AppResult<()> {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);

        let mut envelope = vec![request_id_part(id), Bytes::new()];
        envelope.extend(request);
        let message = to_message(envelope)
            .ok_or_else(|| ScopeError::Protocol("empty request".into()))?;

        let socket = self.socket().await?;
        let sent = socket.send(message).await;
        if let Err(e) = sent {
            self.socket = None;
            return Err(transport_error("send to", &self.addr, e));
        }
        self.outstanding = Some(id);
        Ok(())
    }

    async fn recv_timeout(&mut self, wait: Duration) -> AppResult<Option<Multipart>> {
        let deadline = Instant::now() + wait;
        let Some(socket) = self.socket.as_mut() else {
            tokio::time::sleep_until(deadline).await;
            return Ok(None);
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match timeout(remaining, socket.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    let err = transport_error("receive from", &self.addr, e);
                    self.socket = None;
                    return Err(err);
                }
            };

            let mut parts = message.into_vec();
            if parts.len() < 3 || !parts[1].is_empty() {
                trace!("Dropping reply without a request envelope");
                continue;
            }
            let id = parse_request_id(&parts[0]);
            if id.is_some() && id == self.outstanding {
                self.outstanding = None;
                return Ok(Some(parts.split_off(2)));
            }
            trace!("Dropping stale reply with request id {id:?}");
        }
    }
}

/// One-way PUSH channel.
pub struct ZmqPushChannel {
    addr: String,
    socket: Option<PushSocket>,
}

impl ZmqPushChannel {
    /// Channel to `addr`; nothing connects until the first push.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            socket: None,
        }
    }
}

#[async_trait]
impl PushChannel for ZmqPushChannel {
    async fn push(&mut self, payload: &[u8]) -> AppResult<()> {
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let mut socket = PushSocket::new();
                socket
                    .connect(&endpoint(&self.addr))
                    .await
                    .map_err(|e| transport_error("connect to", &self.addr, e))?;
                debug!("Push socket connected to {}", self.addr);
                socket
            }
        };
        let message = ZmqMessage::from(Bytes::copy_from_slice(payload));
        match timeout(PUSH_TIMEOUT, socket.send(message)).await {
            Ok(Ok(())) => {
                self.socket = Some(socket);
                Ok(())
            }
            Ok(Err(e)) => Err(transport_error("push to", &self.addr, e)),
            Err(_) => Err(ScopeError::Transport(format!(
                "push to {} did not complete within {PUSH_TIMEOUT:?}",
                self.addr
            ))),
        }
    }
}

/// Heartbeat feed: the server publishes a message every interval.
///
/// A check succeeds if beats arrived since the previous check or one arrives
/// within the wait.
pub struct ZmqHeartbeatFeed {
    addr: String,
    socket: Option<SubSocket>,
}

impl ZmqHeartbeatFeed {
    /// Feed for `addr`; the subscription is made on the first check.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            socket: None,
        }
    }

    async fn subscribe(addr: &str) -> AppResult<SubSocket> {
        let mut socket = SubSocket::new();
        socket
            .connect(&endpoint(addr))
            .await
            .map_err(|e| transport_error("connect to", addr, e))?;
        socket
            .subscribe("")
            .await
            .map_err(|e| transport_error("subscribe to", addr, e))?;
        debug!("Subscribed to heartbeat at {addr}");
        Ok(socket)
    }
}

#[async_trait]
impl HeartbeatFeed for ZmqHeartbeatFeed {
    async fn check(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        if self.socket.is_none() {
            match timeout(wait, Self::subscribe(&self.addr)).await {
                Ok(Ok(socket)) => self.socket = Some(socket),
                Ok(Err(e)) => {
                    debug!("Heartbeat subscription: {e}");
                    return false;
                }
                Err(_) => return false,
            }
        }
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };

        // beats queued since the last check
        let mut queued = false;
        loop {
            match timeout(Duration::ZERO, socket.recv()).await {
                Ok(Ok(_)) => queued = true,
                Ok(Err(e)) => {
                    debug!("Heartbeat socket for {} failed: {e}", self.addr);
                    self.socket = None;
                    return false;
                }
                Err(_) => break,
            }
        }
        if queued {
            return true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, socket.recv()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Heartbeat socket for {} failed: {e}", self.addr);
                self.socket = None;
                false
            }
            Err(_) => false,
        }
    }
}

/// Creates ZeroMQ channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZmqConnector;

#[async_trait]
impl Connector for ZmqConnector {
    async fn request_channel(&self, addr: &str) -> AppResult<Box<dyn RequestChannel>> {
        Ok(Box::new(ZmqRequestChannel::new(addr)))
    }

    async fn push_channel(&self, addr: &str) -> AppResult<Box<dyn PushChannel>> {
        Ok(Box::new(ZmqPushChannel::new(addr)))
    }

    async fn heartbeat_feed(&self, addr: &str) -> AppResult<Box<dyn HeartbeatFeed>> {
        Ok(Box::new(ZmqHeartbeatFeed::new(addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_round_trip() {
        assert_eq!(parse_request_id(&request_id_part(42)), Some(42));
        assert_eq!(parse_request_id(b"short"), None);
    }

    #[test]
    fn test_endpoint_prefix() {
        assert_eq!(endpoint("127.0.0.1:6000"), "tcp://127.0.0.1:6000");
        assert_eq!(endpoint("ipc:///tmp/scope"), "ipc:///tmp/scope");
    }

    #[test]
    fn test_message_keeps_part_order() {
        let parts = vec![request_id_part(7), Bytes::new(), Bytes::from_static(b"[]")];
        let message = to_message(parts.clone()).unwrap();
        assert_eq!(message.into_vec(), parts);
        assert!(to_message(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_unconnected_channel_waits_out_poll() {
        let mut channel = ZmqRequestChannel::new("127.0.0.1:1");
        let start = Instant::now();
        let reply = channel.recv_timeout(Duration::from_millis(50)).await.unwrap();
        assert!(reply.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_heartbeat_without_server_fails() {
        let mut feed = ZmqHeartbeatFeed::new("127.0.0.1:1");
        assert!(!feed.check(Duration::from_millis(100)).await);
    }
}
