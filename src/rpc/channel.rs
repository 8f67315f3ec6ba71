//! Channel traits for the RPC client
//!
//! The client talks to the server over three independent channels: the
//! request/reply channel, a one-way interrupt channel, and a heartbeat feed.
//! A [`Connector`] creates all three so that `reconnect()` can rebuild them
//! from nothing.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::rpc::wire::Multipart;

/// Strict request/reply channel: one request, then its reply.
#[async_trait]
pub trait RequestChannel: Send {
    /// Send a request frame.
    async fn send(&mut self, request: Multipart) -> AppResult<()>;

    /// Wait up to `wait` for the reply to the last request.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. Must be cancel-safe: a
    /// reply partially received when the future is dropped is not lost.
    async fn recv_timeout(&mut self, wait: Duration) -> AppResult<Option<Multipart>>;
}

/// One-way push channel.
#[async_trait]
pub trait PushChannel: Send {
    /// Send one single-part message.
    async fn push(&mut self, payload: &[u8]) -> AppResult<()>;
}

/// Source of liveness signals from the server.
#[async_trait]
pub trait HeartbeatFeed: Send {
    /// Wait up to `wait` for a sign of life; `true` if one was seen.
    async fn check(&mut self, wait: Duration) -> bool;
}

/// Factory for the channels bound to a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Request/reply channel to `addr`.
    async fn request_channel(&self, addr: &str) -> AppResult<Box<dyn RequestChannel>>;

    /// Push channel to `addr`.
    async fn push_channel(&self, addr: &str) -> AppResult<Box<dyn PushChannel>>;

    /// Heartbeat feed listening on `addr`.
    async fn heartbeat_feed(&self, addr: &str) -> AppResult<Box<dyn HeartbeatFeed>>;
}
