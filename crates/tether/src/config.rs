//! Session configuration.

use std::time::Duration;

/// How a session's [`Sender`](crate::Sender) moves messages from application
/// threads to the network worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderMode {
    /// Every call is submitted to the network worker immediately. Total
    /// order across all calling threads, at the cost of per-call contention.
    #[default]
    Direct,
    /// Calls accumulate in a buffer owned by the application thread and are
    /// submitted as one batch on flush or when the buffer reaches
    /// [`SessionConfig::flush_threshold`].
    Buffered,
    /// Buffered, but any use from a thread other than the owner fails
    /// immediately instead of silently racing.
    Unsharable,
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval of the network worker's housekeeping tick.
    pub tick_interval: Duration,
    /// Buffered senders auto-flush once this many tasks accumulate.
    pub flush_threshold: usize,
    /// Deadline applied to `call`/`sync` when the caller does not pass one.
    pub default_rpc_timeout: Duration,
    /// Refuse new RPC calls once this many are outstanding.
    pub max_pending_rpc: usize,
    /// Capacity of the committed-event channel to the application thread.
    pub commit_capacity: usize,
    /// Which sender strategy the session hands out.
    pub sender_mode: SenderMode,
    /// Send an ACK_PING when the session has written nothing for this long.
    pub heartbeat_interval: Duration,
    /// Close the session when nothing has been read for this long.
    pub session_timeout: Duration,
    /// Advisory deadline attached to each sent-but-unacked message.
    pub ack_timeout: Duration,
    /// Whether an expired ack deadline closes the session (fail-fast) or is
    /// only logged.
    pub close_on_ack_timeout: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            flush_threshold: 32,
            default_rpc_timeout: Duration::from_millis(env_u64(
                "TETHER_DEFAULT_RPC_TIMEOUT_MS",
                15_000,
            )),
            max_pending_rpc: env_u64("TETHER_MAX_PENDING_RPC", 8192) as usize,
            commit_capacity: 1024,
            sender_mode: SenderMode::Direct,
            heartbeat_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(120),
            ack_timeout: Duration::from_secs(15),
            close_on_ack_timeout: true,
        }
    }
}

impl SessionConfig {
    pub fn with_sender_mode(mut self, mode: SenderMode) -> Self {
        self.sender_mode = mode;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_default_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.default_rpc_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SessionConfig::default();
        assert!(config.flush_threshold > 0);
        assert!(config.default_rpc_timeout > Duration::ZERO);
        assert_eq!(config.sender_mode, SenderMode::Direct);
    }

    #[test]
    fn flush_threshold_never_zero() {
        let config = SessionConfig::default().with_flush_threshold(0);
        assert_eq!(config.flush_threshold, 1);
    }
}
