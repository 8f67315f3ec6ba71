//! Response-key policies
//!
//! A [`KeyStrategy`] tells the correlator how to turn an incoming message into
//! the key its callbacks were registered under, and what to do with messages
//! nobody is waiting for.

use tracing::{debug, trace, warn};

/// Key under which pending callbacks are registered.
pub type ResponseKey = String;

/// Policy injected into a [`ResponseCorrelator`](super::ResponseCorrelator).
pub trait KeyStrategy: Send + Sync + 'static {
    /// Derive the response key for an incoming message.
    ///
    /// Messages belonging to the same logical exchange must map to the same key.
    fn response_key(&self, response: &str) -> ResponseKey;

    /// Called for a response that matched no pending callback.
    fn handle_unmatched(&self, response: &str, key: &str) {
        debug!("Unprompted response {:?} (key {:?})", response, key);
    }
}

/// The whole response is its own key.
///
/// Useful for loopback links and devices that echo the command back verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoStrategy;

impl KeyStrategy for EchoStrategy {
    fn response_key(&self, response: &str) -> ResponseKey {
        response.to_string()
    }
}

/// First character of a Leica status notification.
pub const LEICA_STATUS_SENTINEL: char = '$';

/// Routing for the Leica DM6000B / DMi8 serial API.
///
/// Command responses have the shape `FF E CC ...`: a two-digit function unit,
/// one error-code digit, then the last two digits of the command id. The
/// error digit is skipped when keying so that success and error responses to
/// the same command reach the same callback. Status notifications start with
/// `$` and key on the full six-character function id.
#[derive(Debug, Clone)]
pub struct LeicaStrategy {
    quiet_notifications: Vec<String>,
}

impl Default for LeicaStrategy {
    fn default() -> Self {
        // The stand broadcasts $83023 constantly once any other software has
        // subscribed to it since the last power cycle.
        Self {
            quiet_notifications: vec!["$83023".to_string()],
        }
    }
}

impl LeicaStrategy {
    /// Strategy with the default quiet notifications.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notification keys whose unmatched arrivals are logged at trace level only.
    pub fn with_quiet_notifications<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            quiet_notifications: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Key for the response to a command whose five-digit code is `code`.
    pub fn command_key(code: &str) -> ResponseKey {
        format!("{}{}", char_slice(code, 0, 2), char_slice(code, 3, 5))
    }

    /// Key for status notifications about the function `code`.
    pub fn event_key(code: &str) -> ResponseKey {
        let mut key = String::with_capacity(6);
        key.push(LEICA_STATUS_SENTINEL);
        key.push_str(char_slice(code, 0, 5));
        key
    }
}

impl KeyStrategy for LeicaStrategy {
    fn response_key(&self, response: &str) -> ResponseKey {
        if response.starts_with(LEICA_STATUS_SENTINEL) {
            char_slice(response, 0, 6).to_string()
        } else {
            Self::command_key(response)
        }
    }

    fn handle_unmatched(&self, response: &str, key: &str) {
        if response.starts_with(LEICA_STATUS_SENTINEL) {
            if self.quiet_notifications.iter().any(|quiet| quiet == key) {
                trace!("Unexpected notification from Leica device: {response:?} (key {key:?})");
            } else {
                debug!("Unexpected notification from Leica device: {response:?} (key {key:?})");
            }
        } else {
            // A command response nobody is waiting for means its originator has
            // lost its handler.
            warn!("Unprompted command response from Leica device: {response:?} (key {key:?})");
        }
    }
}

/// Character-range slice clamped to the string length, like Python slicing.
fn char_slice(s: &str, start: usize, end: usize) -> &str {
    let byte_at = |idx: usize| s.char_indices().nth(idx).map_or(s.len(), |(b, _)| b);
    let start = byte_at(start);
    let end = byte_at(end).max(start);
    &s[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_command_response_skips_error_digit() {
        let leica = LeicaStrategy::new();
        assert_eq!(leica.response_key("1H001"), "1H01");
        // success and error responses to 70028 share one key
        assert_eq!(leica.response_key("70028 3"), "7028");
        assert_eq!(leica.response_key("70928"), "7028");
        assert_eq!(LeicaStrategy::command_key("70028"), "7028");
    }

    #[test]
    fn test_status_notification_keys_on_six_chars() {
        let leica = LeicaStrategy::new();
        assert_eq!(leica.response_key("$83023X"), "$83023");
        assert_eq!(leica.response_key("$81023 1"), "$81023");
        assert_eq!(LeicaStrategy::event_key("70028"), "$70028");
    }

    #[test]
    fn test_short_and_empty_messages() {
        let leica = LeicaStrategy::new();
        assert_eq!(leica.response_key(""), "");
        assert_eq!(leica.response_key("99"), "99");
        assert_eq!(leica.response_key("$8"), "$8");
    }

    #[test]
    fn test_echo_strategy() {
        assert_eq!(EchoStrategy.response_key("PING 1"), "PING 1");
    }

    #[test]
    #[traced_test]
    fn test_unprompted_command_response_is_warned() {
        LeicaStrategy::new().handle_unmatched("70028 3", "7028");
        assert!(logs_contain("Unprompted command response"));
    }

    #[test]
    #[traced_test]
    fn test_unexpected_notification_is_not_warned() {
        LeicaStrategy::new().handle_unmatched("$81023 1", "$81023");
        assert!(logs_contain("Unexpected notification"));
        assert!(!logs_contain("WARN"));
    }
}
