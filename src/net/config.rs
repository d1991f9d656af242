//! Every tunable knob in the network core, with documented defaults (§6).

use std::time::Duration;

/// Configuration for a `NetworkManager` instance.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Cap on simultaneous outgoing + incoming connections.
    pub maximum_connections: usize,
    /// Floor on outgoing connections the auto-connect loop tries to keep up.
    pub minimum_outgoing_connections: usize,
    /// How often the auto-connect loop checks whether it needs more peers.
    pub auto_connect_interval: Duration,
    /// Size of the bounded recent-keys FIFO used to suppress redundant
    /// `KeyResponse` fan-out (§4.4).
    pub recent_key_window_size: usize,
    /// Timeout waiting for a `Hello` to complete the handshake.
    pub handshake_timeout: Duration,
    /// Idle-connection timeout before a liveness check is sent.
    pub idle_timeout: Duration,
    /// Chance [0,1] a blocklisted peer is retried anyway (§4.1).
    pub bad_peer_rehabilitation_chance: f64,
    /// Minimum interval between connection attempts to the same peer.
    pub reconnect_interval: Duration,
    /// Cap on concurrent outgoing connections sharing one netgroup.
    pub max_outgoing_per_netgroup: usize,
    /// Base/cap for the outgoing-dial exponential backoff.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a `CubeRequest` waits before the scheduler retries on
    /// another peer (§4.6).
    pub request_timeout: Duration,
    /// Maximum in-flight individual cube requests before batching kicks in.
    pub max_batch_size: usize,
    /// How often queued single-key requests are flushed into a batched
    /// `CubeRequest`/`KeyRequest` message.
    pub batch_flush_interval: Duration,
    /// Subscription lease duration granted in `SubscriptionConfirmation`.
    pub subscription_duration: Duration,
    /// How long before a subscription's expiry the holder renews it.
    pub subscription_renewal_margin: Duration,
    /// Whether a request timeout closes the connection outright, rather
    /// than just marking that one request failed (§4.3, §7).
    pub close_on_timeout: bool,
    /// Whether incoming connections are accepted at all.
    pub accept_incoming_connections: bool,
    /// Whether learned peer addresses are gossiped onward via
    /// `PeerRequest`/`PeerResponse`.
    pub peer_exchange: bool,
    /// Whether the auto-connect loop runs at all.
    pub auto_connect: bool,
    /// Whether this node announces itself to the BitTorrent bootstrap
    /// trackers.
    pub announce_to_trackers: bool,
    /// Whether this node is a light node: it never stores a cube it did
    /// not itself request (§4.3 CubeResponse handler).
    pub light_node: bool,
    /// Delay before retrying a dial that failed synchronously.
    pub connect_retry_interval: Duration,
    /// Delay before the auto-connect loop tries for another peer after a
    /// successful connection.
    pub new_peer_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            maximum_connections: 32,
            minimum_outgoing_connections: 8,
            auto_connect_interval: Duration::from_secs(10),
            recent_key_window_size: 1000,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            bad_peer_rehabilitation_chance: 0.1,
            reconnect_interval: Duration::from_secs(60),
            max_outgoing_per_netgroup: 2,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(5),
            max_batch_size: 256,
            batch_flush_interval: Duration::from_millis(200),
            subscription_duration: Duration::from_secs(600),
            subscription_renewal_margin: Duration::from_secs(60),
            close_on_timeout: false,
            accept_incoming_connections: true,
            peer_exchange: true,
            auto_connect: true,
            announce_to_trackers: false,
            light_node: false,
            connect_retry_interval: Duration::from_secs(5),
            new_peer_interval: Duration::from_millis(500),
        }
    }
}

impl NetConfig {
    /// The request-scale-factor denominator, clamped so a peer set larger
    /// than `maximum_connections` doesn't dilute per-peer request share
    /// below a useful floor (open question (a): clamped at 0.25 of
    /// `maximum_connections`).
    pub fn request_scale_denominator(&self, online_peer_count: usize) -> usize {
        let floor = ((self.maximum_connections as f64) * 0.25).ceil() as usize;
        online_peer_count.max(floor.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_denominator_floors_at_quarter_of_max_connections() {
        let cfg = NetConfig {
            maximum_connections: 32,
            ..NetConfig::default()
        };
        assert_eq!(cfg.request_scale_denominator(100), 100);
        assert_eq!(cfg.request_scale_denominator(2), 8);
    }
}
