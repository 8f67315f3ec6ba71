//! Asynchronous response correlation for out-of-order devices
//!
//! The [`ResponseCorrelator`] owns one background receiver thread per device
//! link. Foreground callers [`submit`](ResponseCorrelator::submit) messages with
//! an optional response key and callback; when the receiver sees a response
//! whose key (derived by the injected [`KeyStrategy`]) matches, it fires the
//! callback on the receiver thread.
//!
//! Two pending tables exist per key:
//!
//! - **grouped** (coalescing): every callback queued under the key fires on the
//!   next matching response. Persistent (`onetime = false`) callbacks are
//!   re-queued afterwards.
//! - **standalone**: one callback is consumed per matching response, in FIFO
//!   order.
//!
//! Both tables are consulted for every response.
//!
//! # Known race
//!
//! If a grouped callback is registered just before the reply to an *earlier*
//! message with the same key is dispatched, the new callback consumes that
//! earlier reply. The device cannot signal that a reply is in flight, so no
//! amount of local locking closes the window; registration and dispatch only
//! hold the table lock long enough to edit the tables, keeping the window as
//! small as possible.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::{AppResult, ScopeError};
use crate::messaging::strategy::{KeyStrategy, ResponseKey};
use crate::messaging::transport::{MessageSink, MessageSource};

/// Callback fired on the receiver thread with the full response text.
pub type ResponseCallback = Box<dyn FnMut(&str) + Send + 'static>;

/// Pause after a transport error before reading again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Options for a callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Fire once, then forget the callback.
    pub onetime: bool,
    /// Queue with other callbacks on the same key so one response retires them all.
    pub coalesce: bool,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            onetime: true,
            coalesce: true,
        }
    }
}

impl Registration {
    /// Grouped callback that stays registered after every response.
    pub fn persistent() -> Self {
        Self {
            onetime: false,
            coalesce: true,
        }
    }

    /// One-shot callback consumed by exactly one response of its own.
    pub fn standalone() -> Self {
        Self {
            onetime: true,
            coalesce: false,
        }
    }

    /// A standalone queue entry is always consumed, so it cannot be persistent.
    pub fn validate(&self) -> AppResult<()> {
        if !self.onetime && !self.coalesce {
            return Err(ScopeError::Configuration(
                "a persistent (onetime=false) callback must coalesce".into(),
            ));
        }
        Ok(())
    }
}

struct GroupedCallback {
    id: u64,
    callback: ResponseCallback,
    onetime: bool,
}

struct StandaloneCallback {
    id: u64,
    callback: ResponseCallback,
}

#[derive(Default)]
struct PendingTables {
    grouped: HashMap<ResponseKey, Vec<GroupedCallback>>,
    standalone: HashMap<ResponseKey, VecDeque<StandaloneCallback>>,
    next_id: u64,
}

impl PendingTables {
    fn insert(&mut self, key: ResponseKey, callback: ResponseCallback, registration: Registration) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if registration.coalesce {
            self.grouped.entry(key).or_default().push(GroupedCallback {
                id,
                callback,
                onetime: registration.onetime,
            });
        } else {
            self.standalone
                .entry(key)
                .or_default()
                .push_back(StandaloneCallback { id, callback });
        }
        id
    }

    /// Remove registration `id` under `key` if it has not fired yet.
    fn remove(&mut self, key: &str, id: u64) -> bool {
        if let Some(group) = self.grouped.get_mut(key) {
            if let Some(pos) = group.iter().position(|entry| entry.id == id) {
                group.remove(pos);
                if group.is_empty() {
                    self.grouped.remove(key);
                }
                return true;
            }
        }
        if let Some(queue) = self.standalone.get_mut(key) {
            if let Some(pos) = queue.iter().position(|entry| entry.id == id) {
                queue.remove(pos);
                if queue.is_empty() {
                    self.standalone.remove(key);
                }
                return true;
            }
        }
        false
    }
}

struct Shared {
    pending: Mutex<PendingTables>,
    running: AtomicBool,
}

/// Correlates asynchronous device responses with the callbacks awaiting them.
pub struct ResponseCorrelator {
    shared: Arc<Shared>,
    sink: Mutex<Box<dyn MessageSink>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl ResponseCorrelator {
    /// Start a correlator with its receiver thread already running.
    pub fn spawn<K, S, R>(strategy: K, sink: S, source: R) -> AppResult<Self>
    where
        K: KeyStrategy,
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        let name = format!("ResponseCorrelator({})", source.name());
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTables::default()),
            running: AtomicBool::new(true),
        });

        let receiver = ReceiverLoop {
            shared: shared.clone(),
            strategy,
            source: Box::new(source),
        };
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || receiver.run())?;

        info!("{name} started");
        Ok(Self {
            shared,
            sink: Mutex::new(Box::new(sink)),
            receiver: Mutex::new(Some(handle)),
            name,
        })
    }

    /// Name used for the receiver thread and in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `message`, first registering `callback` under `key` if both are given.
    ///
    /// An invalid registration (`onetime=false` with `coalesce=false`) is
    /// rejected before anything is sent. If the send fails, the registration
    /// is withdrawn before the error is returned.
    pub fn submit(
        &self,
        message: impl AsRef<[u8]>,
        key: Option<ResponseKey>,
        callback: Option<ResponseCallback>,
        registration: Registration,
    ) -> AppResult<()> {
        registration.validate()?;
        let message = message.as_ref();
        trace!(
            "Sending message {:?} with response key {:?}",
            String::from_utf8_lossy(message),
            key
        );
        let registered = match (key, callback) {
            (Some(key), Some(callback)) => {
                let id = self.shared.pending.lock().insert(key.clone(), callback, registration);
                Some((key, id))
            }
            _ => None,
        };
        let sent = self.send_raw(message);
        if sent.is_err() {
            if let Some((key, id)) = registered {
                if self.shared.pending.lock().remove(&key, id) {
                    debug!("Withdrew callback for {key:?} after failed send");
                }
            }
        }
        sent
    }

    /// Queue a callback without sending anything.
    pub fn register(
        &self,
        key: impl Into<ResponseKey>,
        callback: ResponseCallback,
        registration: Registration,
    ) -> AppResult<()> {
        registration.validate()?;
        self.shared.pending.lock().insert(key.into(), callback, registration);
        Ok(())
    }

    /// Drop every callback pending under `key`; returns how many were removed.
    pub fn discard(&self, key: &str) -> usize {
        let mut pending = self.shared.pending.lock();
        let grouped = pending.grouped.remove(key).map_or(0, |v| v.len());
        let standalone = pending.standalone.remove(key).map_or(0, |v| v.len());
        grouped + standalone
    }

    /// Number of callbacks waiting under `key` (grouped, standalone).
    pub fn pending_count(&self, key: &str) -> (usize, usize) {
        let pending = self.shared.pending.lock();
        (
            pending.grouped.get(key).map_or(0, Vec::len),
            pending.standalone.get(key).map_or(0, VecDeque::len),
        )
    }

    /// Write bytes to the device without touching the pending tables.
    pub fn send_raw(&self, message: &[u8]) -> AppResult<()> {
        self.sink.lock().send(message)
    }

    /// Whether the receiver has not been told to stop.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Ask the receiver to stop after its current read returns.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    /// Stop the receiver and wait for its thread to exit.
    ///
    /// Latency is bounded by the source's read timeout.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                error!("{} receiver thread panicked", self.name);
            }
        }
        info!("{} stopped", self.name);
    }
}

impl Drop for ResponseCorrelator {
    fn drop(&mut self) {
        // Detach rather than join: the thread notices on its next read timeout.
        self.stop();
    }
}

struct ReceiverLoop<K> {
    shared: Arc<Shared>,
    strategy: K,
    source: Box<dyn MessageSource>,
}

impl<K: KeyStrategy> ReceiverLoop<K> {
    fn run(mut self) {
        while self.shared.running.load(Ordering::Relaxed) {
            match self.source.receive() {
                Ok(Some(response)) => self.dispatch(&response),
                Ok(None) => {}
                Err(ScopeError::Protocol(msg)) => {
                    error!("Discarding malformed message: {msg}");
                }
                Err(e) => {
                    error!("Receive failed on {}: {e}", self.source.name());
                    std::thread::sleep(RECEIVE_ERROR_BACKOFF);
                }
            }
        }
        debug!("Receiver loop for {} exiting", self.source.name());
    }

    fn dispatch(&mut self, response: &str) {
        let key = self.strategy.response_key(response);
        trace!("Received response {response:?} with response key {key:?}");

        // Take callbacks out under the lock but run them without it, so a
        // callback may itself submit or register.
        let (grouped, standalone) = {
            let mut pending = self.shared.pending.lock();
            let grouped = pending.grouped.remove(&key);
            let standalone = match pending.standalone.get_mut(&key) {
                Some(queue) => {
                    let first = queue.pop_front();
                    if queue.is_empty() {
                        pending.standalone.remove(&key);
                    }
                    first
                }
                None => None,
            };
            (grouped, standalone)
        };

        let handled = grouped.is_some() || standalone.is_some();

        if let Some(callbacks) = grouped {
            let mut requeue = Vec::new();
            for mut entry in callbacks {
                (entry.callback)(response);
                if !entry.onetime {
                    requeue.push(entry);
                }
            }
            if !requeue.is_empty() {
                let mut pending = self.shared.pending.lock();
                let slot = pending.grouped.entry(key.clone()).or_default();
                // Persistent callbacks keep their place ahead of anything
                // registered while they ran.
                requeue.append(slot);
                *slot = requeue;
            }
        }

        if let Some(mut entry) = standalone {
            (entry.callback)(response);
        }

        if !handled {
            self.strategy.handle_unmatched(response, &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::{self, SimulatedDevice};
    use crate::messaging::strategy::{EchoStrategy, LeicaStrategy};
    use std::sync::mpsc;

    fn leica() -> (ResponseCorrelator, SimulatedDevice) {
        let (sink, source, device) = memory::link(b"\r", Duration::from_millis(10));
        let correlator = ResponseCorrelator::spawn(LeicaStrategy::new(), sink, source).unwrap();
        (correlator, device)
    }

    fn recorder(tag: &'static str, tx: &mpsc::Sender<(String, String)>) -> ResponseCallback {
        let tx = tx.clone();
        Box::new(move |response: &str| {
            let _ = tx.send((tag.to_string(), response.to_string()));
        })
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_grouped_onetime_callbacks_fire_together() {
        let (correlator, device) = leica();
        let (tx, rx) = mpsc::channel();

        let key = LeicaStrategy::command_key("70029");
        correlator
            .submit("70029 1\r", Some(key.clone()), Some(recorder("a", &tx)), Registration::default())
            .unwrap();
        correlator
            .submit("70029 2\r", Some(key.clone()), Some(recorder("b", &tx)), Registration::default())
            .unwrap();
        assert_eq!(correlator.pending_count(&key), (2, 0));

        device.reply("70029").unwrap();
        let mut fired = vec![rx.recv_timeout(WAIT).unwrap().0, rx.recv_timeout(WAIT).unwrap().0];
        fired.sort();
        assert_eq!(fired, vec!["a", "b"]);

        // neither fires again
        device.reply("70029").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(correlator.pending_count(&key), (0, 0));
    }

    #[test]
    fn test_persistent_callback_is_requeued() {
        let (correlator, device) = leica();
        let (tx, rx) = mpsc::channel();

        let key = LeicaStrategy::event_key("70028");
        correlator
            .register(key.clone(), recorder("event", &tx), Registration::persistent())
            .unwrap();

        device.reply("$70028 3").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, "$70028 3");
        device.reply("$70028 5").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, "$70028 5");
        assert_eq!(correlator.pending_count(&key), (1, 0));
    }

    #[test]
    fn test_standalone_callbacks_consumed_in_order() {
        let (correlator, device) = leica();
        let (tx, rx) = mpsc::channel();

        let key = LeicaStrategy::command_key("81022");
        for tag in ["c1", "c2"] {
            correlator
                .submit("81022 1\r", Some(key.clone()), Some(recorder(tag, &tx)), Registration::standalone())
                .unwrap();
        }

        device.reply("81022").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, "c1");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(correlator.pending_count(&key), (0, 1));

        device.reply("81022").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, "c2");
        assert_eq!(correlator.pending_count(&key), (0, 0));
    }

    #[test]
    fn test_response_satisfies_both_tables() {
        let (correlator, device) = leica();
        let (tx, rx) = mpsc::channel();

        let key = LeicaStrategy::command_key("70028");
        correlator
            .register(key.clone(), recorder("grouped", &tx), Registration::default())
            .unwrap();
        correlator
            .register(key, recorder("standalone", &tx), Registration::standalone())
            .unwrap();

        device.reply("70028 3").unwrap();
        let mut fired = vec![rx.recv_timeout(WAIT).unwrap().0, rx.recv_timeout(WAIT).unwrap().0];
        fired.sort();
        assert_eq!(fired, vec!["grouped", "standalone"]);
    }

    #[test]
    fn test_persistent_standalone_rejected_before_send() {
        let (correlator, mut device) = leica();
        let (tx, _rx) = mpsc::channel();

        let bad = Registration {
            onetime: false,
            coalesce: false,
        };
        let result = correlator.submit("70028\r", Some("7028".into()), Some(recorder("x", &tx)), bad);

        assert!(matches!(result, Err(ScopeError::Configuration(_))));
        assert_eq!(device.next_sent(Duration::from_millis(100)), None);
        assert_eq!(correlator.pending_count("7028"), (0, 0));
    }

    #[test]
    fn test_unmatched_response_does_not_stop_loop() {
        let (sink, source, device) = memory::link(b"\r", Duration::from_millis(10));
        let correlator = ResponseCorrelator::spawn(EchoStrategy, sink, source).unwrap();
        let (tx, rx) = mpsc::channel();

        device.reply("nobody asked").unwrap();
        device.write_raw(b"\xff\r".to_vec()).unwrap();
        correlator
            .register("PONG", recorder("pong", &tx), Registration::default())
            .unwrap();
        device.reply("PONG").unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, "PONG");
    }

    #[test]
    fn test_callback_may_submit_from_receiver_thread() {
        let (sink, source, mut device) = memory::link(b"\r", Duration::from_millis(10));
        let correlator = Arc::new(ResponseCorrelator::spawn(EchoStrategy, sink, source).unwrap());

        let inner = correlator.clone();
        correlator
            .register(
                "READY",
                Box::new(move |_: &str| {
                    let _ = inner.send_raw(b"GO\r");
                }),
                Registration::default(),
            )
            .unwrap();
        device.reply("READY").unwrap();

        assert_eq!(device.next_sent(WAIT).as_deref(), Some("GO"));
    }

    #[test]
    fn test_shutdown_joins_receiver() {
        let (correlator, _device) = leica();
        assert!(correlator.is_running());
        correlator.shutdown();
        assert!(!correlator.is_running());
    }

    /// Sink that refuses its first `failures` sends.
    struct FlakySink {
        failures: usize,
    }

    impl MessageSink for FlakySink {
        fn send(&mut self, _message: &[u8]) -> AppResult<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ScopeError::Serial("port unplugged".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_send_withdraws_callback() {
        let (_, source, device) = memory::link(b"\r", Duration::from_millis(10));
        let correlator =
            ResponseCorrelator::spawn(LeicaStrategy::new(), FlakySink { failures: 2 }, source).unwrap();
        let (tx, rx) = mpsc::channel();
        let key = LeicaStrategy::command_key("70028");

        let result = correlator.submit("70028\r", Some(key.clone()), Some(recorder("lost", &tx)), Registration::default());
        assert!(matches!(result, Err(ScopeError::Serial(_))));
        let result = correlator.submit("70028\r", Some(key.clone()), Some(recorder("lost", &tx)), Registration::standalone());
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(&key), (0, 0));

        correlator
            .submit("70028\r", Some(key.clone()), Some(recorder("kept", &tx)), Registration::standalone())
            .unwrap();
        device.reply("70028 3").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, "kept");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_discard() {
        let (correlator, _device) = leica();
        let (tx, _rx) = mpsc::channel();
        correlator.register("9999", recorder("a", &tx), Registration::standalone()).unwrap();
        correlator.register("9999", recorder("b", &tx), Registration::default()).unwrap();
        assert_eq!(correlator.discard("9999"), 2);
        assert_eq!(correlator.pending_count("9999"), (0, 0));
    }
}
