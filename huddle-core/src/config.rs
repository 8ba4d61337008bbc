use chrono::Duration;

/// The configuration of the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How many live sessions a single user may hold at once
    pub max_sessions_per_user: usize,
    /// How long after sending a message it can still be recalled, in seconds
    pub recall_window_in_seconds: i64,
    /// How long a file transfer offer stays open before it expires, in seconds
    pub offer_timeout_in_seconds: i64,
    /// How long a screen session may sit without activity before it is ended, in seconds
    pub idle_screen_timeout_in_seconds: i64,
    /// How often the background sweeper runs, in seconds
    pub sweep_interval_in_seconds: u64,
    /// The length of generated screen session access codes
    pub access_code_length: usize,
    /// How many times a durable store write is attempted before giving up
    pub store_retry_attempts: u32,
}

impl HubConfig {
    /// The window in which a sender can recall a message
    pub fn recall_window(&self) -> Duration {
        Duration::seconds(self.recall_window_in_seconds)
    }

    /// The time an unresolved file offer is allowed to live
    pub fn offer_timeout(&self) -> Duration {
        Duration::seconds(self.offer_timeout_in_seconds)
    }

    /// The time an inactive screen session is allowed to live
    pub fn idle_screen_timeout(&self) -> Duration {
        Duration::seconds(self.idle_screen_timeout_in_seconds)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            // Enough for a handful of open tabs, low enough to stop runaway clients
            max_sessions_per_user: 8,
            // Two minutes matches what users expect from recall in other chat apps
            recall_window_in_seconds: 120,
            // Five minutes to accept or reject a file before it lapses
            offer_timeout_in_seconds: 300,
            // Screen sessions without any traffic are reaped after ten minutes
            idle_screen_timeout_in_seconds: 600,
            sweep_interval_in_seconds: 30,
            // Six characters is enough to avoid collisions among active sessions
            access_code_length: 6,
            store_retry_attempts: 3,
        }
    }
}
