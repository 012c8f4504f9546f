//! Runtime configuration for a replica node.

use std::path::PathBuf;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 400;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 1400;
/// Default leader heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_PERIOD: u64 = 100;
/// Default idle disconnect threshold for peer connections, in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT: u64 = 3500;

/// The runtime configuration for a replica node.
///
/// Build instances with the builder: `Config::build().validate()?`. All
/// fields have defaults suitable for a small LAN cluster; tests typically
/// shrink the compaction thresholds and drive ticks explicitly.
#[derive(Clone, Debug)]
pub struct Config {
    /// If set, an internal thread drives `tick`; else the embedder calls it.
    pub auto_tick: bool,
    /// Capacity of the bounded command submission queue. Overflow fails the
    /// submission synchronously with `FailReason::QueueFull`.
    pub commands_queue_size: usize,
    /// If a submission arrives on a non-leader, forward it to the best-known
    /// leader instead of failing with `FailReason::NotLeader`.
    pub forward_to_leader: bool,
    /// If set, the leader packs multiple entries into one AppendEntries.
    pub append_entries_use_batch: bool,
    /// Upper bound on entries per AppendEntries when batching.
    pub max_batch_entries: u64,
    /// Minimum live-log length before compaction is considered.
    pub log_compaction_min_entries: usize,
    /// Minimum wall-clock gap between two compactions.
    pub log_compaction_min_time: Duration,
    /// Path of the durable dump file. Absence disables persistence.
    pub full_dump_file: Option<PathBuf>,
    /// Minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// Maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// Leader heartbeat interval per peer.
    pub heartbeat_period: Duration,
    /// A peer connection with no inbound bytes for this long is dead.
    pub connection_timeout: Duration,
    /// Kernel send buffer size for peer sockets, in bytes.
    pub send_buffer_size: usize,
    /// Kernel receive buffer size for peer sockets, in bytes.
    pub recv_buffer_size: usize,
}

impl Config {
    /// Start building a new `Config` instance.
    pub fn build() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Generate a new random election timeout within the configured bounds.
    ///
    /// The result should be cached, and a new value generated each time the
    /// election deadline is reset.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let millis = thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_tick: true,
            commands_queue_size: 10_000,
            forward_to_leader: true,
            append_entries_use_batch: true,
            max_batch_entries: 64,
            log_compaction_min_entries: 5000,
            log_compaction_min_time: Duration::from_secs(300),
            full_dump_file: None,
            election_timeout_min: DEFAULT_ELECTION_TIMEOUT_MIN,
            election_timeout_max: DEFAULT_ELECTION_TIMEOUT_MAX,
            heartbeat_period: Duration::from_millis(DEFAULT_HEARTBEAT_PERIOD),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT),
            send_buffer_size: 1 << 13,
            recv_buffer_size: 1 << 13,
        }
    }
}

/// A builder for the `Config` type.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn auto_tick(mut self, val: bool) -> Self {
        self.config.auto_tick = val;
        self
    }

    pub fn commands_queue_size(mut self, val: usize) -> Self {
        self.config.commands_queue_size = val;
        self
    }

    pub fn forward_to_leader(mut self, val: bool) -> Self {
        self.config.forward_to_leader = val;
        self
    }

    pub fn append_entries_use_batch(mut self, val: bool) -> Self {
        self.config.append_entries_use_batch = val;
        self
    }

    pub fn max_batch_entries(mut self, val: u64) -> Self {
        self.config.max_batch_entries = val;
        self
    }

    pub fn log_compaction_min_entries(mut self, val: usize) -> Self {
        self.config.log_compaction_min_entries = val;
        self
    }

    pub fn log_compaction_min_time(mut self, val: Duration) -> Self {
        self.config.log_compaction_min_time = val;
        self
    }

    pub fn full_dump_file(mut self, val: impl Into<PathBuf>) -> Self {
        self.config.full_dump_file = Some(val.into());
        self
    }

    pub fn election_timeout_min(mut self, millis: u64) -> Self {
        self.config.election_timeout_min = millis;
        self
    }

    pub fn election_timeout_max(mut self, millis: u64) -> Self {
        self.config.election_timeout_max = millis;
        self
    }

    pub fn heartbeat_period(mut self, val: Duration) -> Self {
        self.config.heartbeat_period = val;
        self
    }

    pub fn connection_timeout(mut self, val: Duration) -> Self {
        self.config.connection_timeout = val;
        self
    }

    pub fn send_buffer_size(mut self, val: usize) -> Self {
        self.config.send_buffer_size = val;
        self
    }

    pub fn recv_buffer_size(mut self, val: usize) -> Self {
        self.config.recv_buffer_size = val;
        self
    }

    /// Validate the state of this builder and produce the final `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = self.config;
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeouts);
        }
        if config.max_batch_entries == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if config.commands_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        if config.heartbeat_period >= Duration::from_millis(config.election_timeout_min) {
            return Err(ConfigError::InvalidHeartbeatPeriod);
        }
        Ok(config)
    }
}
