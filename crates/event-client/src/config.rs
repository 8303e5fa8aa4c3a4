use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-subscriber delivery policy used by every `publish*` path in the
/// dispatcher.
///
/// Rather than overload the sign of a single duration field the way the
/// upstream client's `eventConsumerTimeout` does, the three modes it
/// selects are spelled out here as variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum DeliveryTimeout {
    /// Attempt a single send; drop the event for that subscriber if the
    /// channel is full.
    NonBlocking,
    /// Wait indefinitely until the subscriber accepts. Can stall the
    /// dispatcher; only safe when every subscriber is guaranteed to drain
    /// its channel promptly.
    Blocking,
    /// Race the send against a timer; drop for that subscriber on timeout.
    Bounded(#[serde(with = "duration_millis")] Duration),
}

impl Default for DeliveryTimeout {
    fn default() -> Self {
        Self::Bounded(Duration::from_secs(5))
    }
}

/// Configuration for a [`Dispatcher`].
///
/// [`Dispatcher`]: crate::dispatcher::Dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Capacity of the dispatcher's inbox, and of each subscriber's
    /// outbound channel.
    pub event_consumer_buffer_size: usize,
    /// Per-subscriber delivery policy (see [`DeliveryTimeout`]).
    pub event_consumer_timeout: DeliveryTimeout,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { event_consumer_buffer_size: 256, event_consumer_timeout: DeliveryTimeout::default() }
    }
}

/// Configuration for a [`Client`].
///
/// [`Client`]: crate::client::Client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum number of attempts for the initial `connect`. `1` means no
    /// retry; `0` means unbounded.
    pub max_conn_attempts: u32,
    /// Maximum number of attempts per reconnect cycle. Same convention as
    /// `max_conn_attempts`.
    pub max_reconn_attempts: u32,
    /// Sleep between failed connect attempts. Clamped to at least one
    /// second by [`Client::connect_with_retry`].
    ///
    /// [`Client::connect_with_retry`]: crate::client::Client::connect_with_retry
    #[serde(with = "duration_millis")]
    pub time_between_conn_attempts: Duration,
    /// Delay before the first attempt of a reconnect cycle.
    #[serde(with = "duration_millis")]
    pub reconn_initial_delay: Duration,
    /// Bound on how long `Close` waits for a `Disconnect` reply when an
    /// `after_connect` hook has failed.
    #[serde(with = "duration_millis")]
    pub resp_timeout: Duration,
    /// Whether a failed connection is automatically retried.
    pub reconn: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_conn_attempts: 1,
            max_reconn_attempts: 0,
            time_between_conn_attempts: Duration::from_secs(1),
            reconn_initial_delay: Duration::from_secs(1),
            resp_timeout: Duration::from_secs(5),
            reconn: true,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_default_matches_spec() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_conn_attempts, 1);
        assert!(cfg.reconn);
    }

    #[test]
    fn delivery_timeout_round_trips_through_json() {
        for mode in [
            DeliveryTimeout::NonBlocking,
            DeliveryTimeout::Blocking,
            DeliveryTimeout::Bounded(Duration::from_millis(250)),
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: DeliveryTimeout = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
    }
}
