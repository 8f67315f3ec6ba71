//! Leica stand command layer
//!
//! Commands to the DM6000B / DMi8 are five-digit codes (two-digit function
//! unit, three-digit command id) followed by space-separated parameters and a
//! carriage return. Responses echo the code with the first command digit
//! replaced by an error code (`0` = success), followed by the response body.
//! Status notifications are the same shape prefixed with `$`.
//!
//! [`LeicaDevice`] is a thin caller of the [`ResponseCorrelator`]: every
//! command registers a callback under the key the [`LeicaStrategy`] will derive
//! from its response.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use scope_control::device::leica::LeicaDevice;
//! # fn example(correlator: Arc<scope_control::messaging::ResponseCorrelator>) -> scope_control::error::AppResult<()> {
//! let stand = LeicaDevice::new(correlator, Duration::from_secs(2));
//! let method = stand.query::<u32>(70028, &[], "get active microscopy method")?;
//! println!("active method index: {}", method.body);
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{AppResult, ScopeError};
use crate::messaging::correlator::{Registration, ResponseCorrelator};
use crate::messaging::strategy::{LeicaStrategy, LEICA_STATUS_SENTINEL};

/// Terminator for Leica commands and responses.
pub const LEICA_TERMINATOR: &[u8] = b"\r";

/// A parsed response or status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeicaResponse {
    /// Header as received, without the `$` of a notification.
    pub header: String,
    /// Error digit of a command response; `'0'` for notifications.
    pub error_code: char,
    /// Text after the header, if any.
    pub body: String,
    /// True for a `$` status notification.
    pub is_event: bool,
}

impl LeicaResponse {
    /// Parse one response line, terminator already stripped.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let (is_event, rest) = match raw.strip_prefix(LEICA_STATUS_SENTINEL) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (header, body) = rest.split_once(' ').unwrap_or((rest, ""));
        if header.len() < 5 || !header.is_ascii() {
            return Err(ScopeError::Protocol(format!(
                "malformed Leica response {raw:?}"
            )));
        }
        let error_code = if is_event {
            '0'
        } else {
            header.chars().nth(2).unwrap_or('0')
        };
        Ok(Self {
            header: header.to_string(),
            error_code,
            body: body.to_string(),
            is_event,
        })
    }

    /// Whether the error digit reports a failure.
    pub fn is_error(&self) -> bool {
        self.error_code != '0'
    }

    /// Turn an error response into `ScopeError::Instrument` naming `intent`.
    pub fn check(self, intent: &str) -> AppResult<Self> {
        if self.is_error() {
            return Err(ScopeError::Instrument(format!(
                "could not {intent}: error code {} in response {} {}",
                self.error_code, self.header, self.body
            )));
        }
        Ok(self)
    }
}

/// Format a command: zero-padded five-digit code, parameters, terminator.
pub fn encode_command<P: Display>(code: u32, params: &[P]) -> String {
    let mut message = format!("{code:05}");
    for param in params {
        message.push(' ');
        message.push_str(&param.to_string());
    }
    message.push('\r');
    message
}

#[derive(Default)]
struct Outstanding {
    count: usize,
    first_error: Option<ScopeError>,
}

/// A Leica function unit (stand, stage, condensers, ...) sharing one serial link.
#[derive(Clone)]
pub struct LeicaDevice {
    correlator: Arc<ResponseCorrelator>,
    timeout: Duration,
    outstanding: Arc<(Mutex<Outstanding>, Condvar)>,
}

impl LeicaDevice {
    /// Function unit on `correlator`; `timeout` bounds `query` and `wait`.
    pub fn new(correlator: Arc<ResponseCorrelator>, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
            outstanding: Arc::new((Mutex::new(Outstanding::default()), Condvar::new())),
        }
    }

    /// The shared correlator.
    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    /// Send a command and block until its response arrives.
    pub fn query<P: Display>(&self, code: u32, params: &[P], intent: &str) -> AppResult<LeicaResponse> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(code, params, move |raw: &str| {
            let _ = tx.try_send(raw.to_string());
        })?;

        let raw = rx.recv_timeout(self.timeout).map_err(|_| {
            ScopeError::Instrument(format!(
                "timed out after {:?} waiting to {intent} (command {code:05})",
                self.timeout
            ))
        })?;
        debug!("Leica {code:05} ({intent}) -> {raw:?}");
        LeicaResponse::parse(&raw)?.check(intent)
    }

    /// Send a command without waiting; [`wait`](Self::wait) blocks until every
    /// command sent this way has been answered.
    pub fn send<P: Display>(&self, code: u32, params: &[P], intent: &str) -> AppResult<()> {
        let outstanding = self.outstanding.clone();
        let intent = intent.to_string();
        outstanding.0.lock().count += 1;

        // whichever of the response and a failed send comes first retires the count
        let settled = Arc::new(AtomicBool::new(false));
        let callback_settled = settled.clone();
        let callback_outstanding = outstanding.clone();
        let result = self.submit(code, params, move |raw: &str| {
            if callback_settled.swap(true, Ordering::SeqCst) {
                return;
            }
            let checked = LeicaResponse::parse(raw).and_then(|r| r.check(&intent));
            let (lock, done) = &*callback_outstanding;
            let mut state = lock.lock();
            if let Err(e) = checked {
                warn!("Async Leica command failed: {e}");
                state.first_error.get_or_insert(e);
            }
            state.count = state.count.saturating_sub(1);
            done.notify_all();
        });

        if result.is_err() && !settled.swap(true, Ordering::SeqCst) {
            let (lock, done) = &*outstanding;
            let mut state = lock.lock();
            state.count = state.count.saturating_sub(1);
            done.notify_all();
        }
        result
    }

    /// Block until all commands from [`send`](Self::send) have been answered.
    ///
    /// Returns the first error response seen since the last `wait`.
    pub fn wait(&self) -> AppResult<()> {
        let (lock, done) = &*self.outstanding;
        let deadline = Instant::now() + self.timeout;
        let mut state = lock.lock();
        while state.count > 0 {
            if done.wait_until(&mut state, deadline).timed_out() {
                return Err(ScopeError::Instrument(format!(
                    "{} command(s) still unanswered after {:?}",
                    state.count, self.timeout
                )));
            }
        }
        match state.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of commands sent with [`send`](Self::send) still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.outstanding.0.lock().count
    }

    /// Call `callback` on every status notification for `code`.
    ///
    /// The stand only emits notifications that have been subscribed to with
    /// the unit's event-subscription command.
    pub fn subscribe_events<F>(&self, code: u32, mut callback: F) -> AppResult<()>
    where
        F: FnMut(LeicaResponse) + Send + 'static,
    {
        let key = LeicaStrategy::event_key(&format!("{code:05}"));
        self.correlator.register(
            key,
            Box::new(move |raw: &str| match LeicaResponse::parse(raw) {
                Ok(event) => callback(event),
                Err(e) => warn!("Dropping notification: {e}"),
            }),
            Registration::persistent(),
        )
    }

    fn submit<P, F>(&self, code: u32, params: &[P], callback: F) -> AppResult<()>
    where
        P: Display,
        F: FnMut(&str) + Send + 'static,
    {
        let code_str = format!("{code:05}");
        self.correlator.submit(
            encode_command(code, params),
            Some(LeicaStrategy::command_key(&code_str)),
            Some(Box::new(callback)),
            Registration::default(),
        )
    }
}
