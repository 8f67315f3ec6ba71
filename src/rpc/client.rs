//! RPC client
//!
//! One [`RpcClient`] owns one strict request/reply channel, so it has at most
//! one call in flight. Callers that share a client serialize through
//! [`SharedClient`]; the client itself never queues calls.
//!
//! A call waits for its reply in short polls. Between polls it checks the
//! wall-clock deadline and the heartbeat flag, so a dead server is reported
//! as [`ScopeError::HeartbeatLost`] well before the timeout runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ScopeConfig};
use crate::error::{AppResult, ScopeError};
use crate::rpc::channel::{Connector, PushChannel, RequestChannel};
use crate::rpc::heartbeat::{HeartbeatMonitor, HeartbeatState};
use crate::rpc::proxy::{Namespace, NamespaceBuilder, ProcedureDescriptor, ProxyFunction};
use crate::rpc::wire::{self, Kwargs, Reply, DESCRIBE_COMMAND, INTERRUPT_PAYLOAD};

/// A client shared between tasks; the mutex serializes calls.
pub type SharedClient = Arc<tokio::sync::Mutex<RpcClient>>;

struct InterruptLink {
    addr: String,
    channel: Box<dyn PushChannel>,
}

struct HeartbeatLink {
    addr: String,
    interval: Duration,
    max_missed: u32,
    monitor: HeartbeatMonitor,
}

/// Client for the scope's RPC server.
pub struct RpcClient {
    connector: Arc<dyn Connector>,
    rpc_addr: String,
    timeout: Duration,
    poll_interval: Duration,
    requests: Box<dyn RequestChannel>,
    interrupt: Option<InterruptLink>,
    heartbeat: Option<HeartbeatLink>,
    liveness: HeartbeatState,
}

impl RpcClient {
    /// Open the request channel to `rpc_addr`.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        rpc_addr: impl Into<String>,
        config: &ClientConfig,
    ) -> AppResult<Self> {
        let rpc_addr = rpc_addr.into();
        let requests = connector.request_channel(&rpc_addr).await?;
        info!("RPC client bound to {rpc_addr}");
        Ok(Self {
            connector,
            rpc_addr,
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            requests,
            interrupt: None,
            heartbeat: None,
            liveness: HeartbeatState::new(),
        })
    }

    /// Connect and enable the interrupt and heartbeat channels the
    /// configuration asks for.
    pub async fn from_config(connector: Arc<dyn Connector>, config: &ScopeConfig) -> AppResult<Self> {
        let mut client = Self::connect(connector, config.server.rpc_addr(), &config.client).await?;
        if config.client.interrupt {
            client.enable_interrupt(config.server.interrupt_addr()).await?;
        }
        if let Some(interval) = config.client.heartbeat_interval() {
            client
                .enable_heartbeat(config.server.heartbeat_addr(), interval, config.client.max_missed)
                .await?;
        }
        Ok(client)
    }

    /// Wrap for sharing between tasks.
    pub fn into_shared(self) -> SharedClient {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Address of the request channel.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// Per-call reply deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the heartbeat monitor currently considers the server dead.
    pub fn heartbeat_failed(&self) -> bool {
        self.liveness.is_failed()
    }

    /// Open the out-of-band interrupt channel.
    pub async fn enable_interrupt(&mut self, addr: impl Into<String>) -> AppResult<()> {
        let addr = addr.into();
        let channel = self.connector.push_channel(&addr).await?;
        debug!("Interrupt channel bound to {addr}");
        self.interrupt = Some(InterruptLink { addr, channel });
        Ok(())
    }

    /// Start monitoring the server's heartbeat feed.
    pub async fn enable_heartbeat(
        &mut self,
        addr: impl Into<String>,
        interval: Duration,
        max_missed: u32,
    ) -> AppResult<()> {
        if max_missed == 0 {
            return Err(ScopeError::Configuration("max_missed must be at least 1".into()));
        }
        let addr = addr.into();
        let feed = self.connector.heartbeat_feed(&addr).await?;
        if let Some(old) = self.heartbeat.as_ref() {
            old.monitor.stop();
        }
        let monitor = HeartbeatMonitor::spawn(
            feed,
            interval,
            max_missed,
            self.liveness.clone(),
            None,
            None,
        );
        debug!("Heartbeat monitor on {addr} every {interval:?}");
        self.heartbeat = Some(HeartbeatLink {
            addr,
            interval,
            max_missed,
            monitor,
        });
        Ok(())
    }

    /// Call a remote procedure and wait for its reply.
    pub async fn call(&mut self, command: &str, args: &[Value], kwargs: &Kwargs) -> AppResult<Reply> {
        self.send_request(command, args, kwargs).await?;
        self.wait_reply().await
    }

    /// Like [`call`](Self::call), but when `interrupt` completes first an
    /// interrupt is pushed to the server and the call keeps waiting, with a
    /// fresh deadline, for whatever reply the server then sends. Without an
    /// interrupt channel nothing is pushed and the wait simply goes on.
    pub async fn call_interruptible<F>(
        &mut self,
        command: &str,
        args: &[Value],
        kwargs: &Kwargs,
        interrupt: F,
    ) -> AppResult<Reply>
    where
        F: Future<Output = ()>,
    {
        self.send_request(command, args, kwargs).await?;
        tokio::pin!(interrupt);
        let outcome = tokio::select! {
            reply = self.wait_reply() => Some(reply),
            _ = &mut interrupt => None,
        };
        match outcome {
            Some(reply) => reply,
            None => {
                if self.interrupt.is_some() {
                    info!("Interrupting {command}");
                    self.send_interrupt().await?;
                } else {
                    warn!("No interrupt channel enabled; still waiting for {command}");
                }
                self.wait_reply().await
            }
        }
    }

    /// Ask the server to abort the call in flight.
    pub async fn send_interrupt(&mut self) -> AppResult<()> {
        let Some(link) = self.interrupt.as_mut() else {
            return Err(ScopeError::Configuration("interrupt channel not enabled".into()));
        };
        link.channel.push(INTERRUPT_PAYLOAD).await
    }

    /// Fetch the server's procedure catalog.
    pub async fn describe(&mut self) -> AppResult<Vec<ProcedureDescriptor>> {
        let catalog = self.call(DESCRIBE_COMMAND, &[], &Kwargs::new()).await?.into_value()?;
        ProcedureDescriptor::parse_catalog(catalog)
    }

    /// Drop every channel and open new ones with the same addresses and
    /// heartbeat settings. The liveness flag starts out clear.
    pub async fn reconnect(&mut self) -> AppResult<()> {
        info!("Reconnecting to {}", self.rpc_addr);
        self.requests = self.connector.request_channel(&self.rpc_addr).await?;

        if let Some(link) = self.interrupt.as_mut() {
            link.channel = self.connector.push_channel(&link.addr).await?;
        }

        // the old monitor may still be mid-check, so it gets to keep its own flag
        self.liveness = HeartbeatState::new();
        let settings = self.heartbeat.as_ref().map(|link| {
            link.monitor.stop();
            (link.addr.clone(), link.interval, link.max_missed)
        });
        if let Some((addr, interval, max_missed)) = settings {
            self.enable_heartbeat(addr, interval, max_missed).await?;
        }
        Ok(())
    }

    async fn send_request(&mut self, command: &str, args: &[Value], kwargs: &Kwargs) -> AppResult<()> {
        if self.liveness.is_failed() {
            return Err(ScopeError::HeartbeatLost);
        }
        let payload = wire::encode_request(command, args, kwargs)?;
        debug!("RPC call {command}");
        self.requests.send(vec![payload]).await
    }

    async fn wait_reply(&mut self) -> AppResult<Reply> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.liveness.is_failed() {
                warn!("Abandoning call: heartbeat lost");
                return Err(ScopeError::HeartbeatLost);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ScopeError::Timeout(self.timeout));
            }
            let wait = self.poll_interval.min(deadline - now);
            if let Some(parts) = self.requests.recv_timeout(wait).await? {
                return wire::decode_reply(parts);
            }
        }
    }
}

/// A callable for `command` with no local argument checking.
pub fn proxy_function(client: &SharedClient, command: impl Into<String>) -> ProxyFunction {
    ProxyFunction::permissive(client.clone(), command)
}

/// Build the client-side namespace tree from the server's catalog.
pub async fn proxy_namespace(client: &SharedClient) -> AppResult<Namespace> {
    let descriptors = client.lock().await.describe().await?;
    NamespaceBuilder::new(client.clone()).build(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{MockResponse, MockServer};
    use serde_json::json;

    fn options(timeout_ms: u64, poll_interval_ms: u64) -> ClientConfig {
        ClientConfig {
            timeout_ms,
            poll_interval_ms,
            ..ClientConfig::default()
        }
    }

    fn echo_server() -> MockServer {
        MockServer::new(|command, args, _kwargs| match command {
            "echo" => MockResponse::Value(json!(args)),
            "stall" => MockResponse::NoReply,
            "fail" => MockResponse::Error(json!("ValueError: bad position")),
            "snap" => MockResponse::Binary(bytes::Bytes::from_static(b"\x01\x02\x03")),
            "long_task" => MockResponse::AfterInterrupt(Box::new(MockResponse::Error(json!("Interrupted")))),
            _ => MockResponse::Error(json!(format!("unknown command {command}"))),
        })
    }

    async fn client_for(server: &MockServer, config: &ClientConfig) -> RpcClient {
        RpcClient::connect(Arc::new(server.connector()), "mock", config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_returns_value_and_binary() {
        let server = echo_server();
        let mut client = client_for(&server, &options(1000, 10)).await;

        let reply = client.call("echo", &[json!(1), json!("a")], &Kwargs::new()).await.unwrap();
        assert_eq!(reply, Reply::Value(json!([1, "a"])));

        let reply = client.call("snap", &[], &Kwargs::new()).await.unwrap();
        assert_eq!(&reply.into_binary().unwrap()[..], b"\x01\x02\x03");
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_error_carries_payload() {
        let server = echo_server();
        let mut client = client_for(&server, &options(1000, 10)).await;
        match client.call("fail", &[], &Kwargs::new()).await {
            Err(ScopeError::Remote { message, .. }) => assert_eq!(message, "ValueError: bad position"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let server = echo_server();
        let mut client = client_for(&server, &options(200, 20)).await;
        let start = std::time::Instant::now();
        let result = client.call("stall", &[], &Kwargs::new()).await;
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(ScopeError::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_dead_heartbeat_fails_fast() {
        let server = echo_server();
        let mut client = client_for(&server, &options(10_000, 20)).await;
        client
            .enable_heartbeat("mock-heartbeat", Duration::from_millis(10), 3)
            .await
            .unwrap();

        server.set_alive(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(client.heartbeat_failed());

        let start = std::time::Instant::now();
        let result = client.call("echo", &[], &Kwargs::new()).await;
        assert!(matches!(result, Err(ScopeError::HeartbeatLost)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_heartbeat_loss_aborts_stuck_call() {
        let server = echo_server();
        let mut client = client_for(&server, &options(10_000, 20)).await;
        client
            .enable_heartbeat("mock-heartbeat", Duration::from_millis(10), 2)
            .await
            .unwrap();

        let killer = {
            let server = server.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                server.set_alive(false);
            })
        };
        let start = std::time::Instant::now();
        let result = client.call("stall", &[], &Kwargs::new()).await;
        killer.await.unwrap();
        assert!(matches!(result, Err(ScopeError::HeartbeatLost)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_reconnect_recovers_after_failure() {
        let server = echo_server();
        let mut client = client_for(&server, &options(150, 10)).await;
        client.enable_interrupt("mock-interrupt").await.unwrap();
        client
            .enable_heartbeat("mock-heartbeat", Duration::from_millis(10), 2)
            .await
            .unwrap();

        server.set_responsive(false);
        assert!(matches!(
            client.call("echo", &[json!(1)], &Kwargs::new()).await,
            Err(ScopeError::Timeout(_))
        ));

        // the wedged channel stays dead even once the server is back
        server.set_responsive(true);
        assert!(client.call("echo", &[json!(1)], &Kwargs::new()).await.is_err());

        client.reconnect().await.unwrap();
        assert_eq!(server.connection_count(), 2);
        let reply = client.call("echo", &[json!(1)], &Kwargs::new()).await.unwrap();
        assert_eq!(reply, Reply::Value(json!([1])));

        // interrupt channel survived the reconnect
        client.send_interrupt().await.unwrap();
        assert_eq!(server.interrupt_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_clears_heartbeat_failure() {
        let server = echo_server();
        let mut client = client_for(&server, &options(1000, 10)).await;
        client
            .enable_heartbeat("mock-heartbeat", Duration::from_millis(10), 2)
            .await
            .unwrap();
        server.set_alive(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.heartbeat_failed());

        server.set_alive(true);
        client.reconnect().await.unwrap();
        assert!(!client.heartbeat_failed());
        assert!(client.call("echo", &[], &Kwargs::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_interruptible_call_rewaits_for_reply() {
        let server = echo_server();
        let mut client = client_for(&server, &options(1000, 10)).await;
        client.enable_interrupt("mock-interrupt").await.unwrap();

        let result = client
            .call_interruptible(
                "long_task",
                &[],
                &Kwargs::new(),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(server.interrupt_count(), 1);
        match result {
            Err(ScopeError::Remote { message, .. }) => assert_eq!(message, "Interrupted"),
            other => panic!("expected the server's interrupted reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interruptible_call_without_channel_keeps_waiting() {
        let server = echo_server();
        let mut client = client_for(&server, &options(200, 10)).await;

        let start = std::time::Instant::now();
        let result = client
            .call_interruptible(
                "stall",
                &[],
                &Kwargs::new(),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(ScopeError::Timeout(_))));
        // the wait restarted after the interrupt fired
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(server.interrupt_count(), 0);

        client.reconnect().await.unwrap();
        let reply = client
            .call_interruptible("echo", &[json!(9)], &Kwargs::new(), async {})
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value(json!([9])));
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_heartbeat_settings() {
        let server = echo_server();
        let mut client = client_for(&server, &options(10_000, 10)).await;
        client
            .enable_heartbeat("mock-heartbeat", Duration::from_millis(10), 3)
            .await
            .unwrap();
        assert_eq!(server.heartbeat_feed_count(), 1);

        server.refuse_heartbeat_feeds(1);
        assert!(matches!(client.reconnect().await, Err(ScopeError::Transport(_))));

        client.reconnect().await.unwrap();
        assert_eq!(server.heartbeat_feed_count(), 2);

        server.set_alive(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(client.heartbeat_failed());
    }

    #[tokio::test]
    async fn test_interrupt_requires_channel() {
        let server = echo_server();
        let mut client = client_for(&server, &options(1000, 10)).await;
        assert!(matches!(
            client.send_interrupt().await,
            Err(ScopeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_proxy_function_forwards_everything() {
        let server = echo_server();
        let client = client_for(&server, &options(1000, 10)).await.into_shared();
        let echo = proxy_function(&client, "echo");
        let reply = echo.call(vec![json!(3), json!(4)], Kwargs::new()).await.unwrap();
        assert_eq!(reply, Reply::Value(json!([3, 4])));
    }
}
