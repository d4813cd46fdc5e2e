use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Settings for the keyspan balance policy.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Upper bound on keyspans moved by a single rebalance round.
    pub max_moves_per_round: usize,
    /// A capture is considered overloaded when it holds more than
    /// `ceil(total / captures) + tolerance` keyspans.
    pub tolerance: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            max_moves_per_round: 16,
            tolerance: 0,
        }
    }
}

/// Owner-side scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Version string announced to processors for compatibility checks.
    pub owner_version: String,
    /// Interval between scheduler ticks.
    pub tick_interval_ms: u64,
    /// How long to wait for a sync report after announcing before the capture
    /// is treated as having reported nothing.
    pub reconcile_timeout_ms: u64,
    pub balance: BalanceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owner_version: env!("CARGO_PKG_VERSION").to_string(),
            tick_interval_ms: 100,
            reconcile_timeout_ms: 10_000,
            balance: BalanceConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_reconcile_timeout_ms(mut self, ms: u64) -> Self {
        self.reconcile_timeout_ms = ms;
        self
    }

    pub fn with_owner_version(mut self, version: impl Into<String>) -> Self {
        self.owner_version = version.into();
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "tick interval must be positive".to_string(),
            ));
        }
        if self.reconcile_timeout_ms < self.tick_interval_ms {
            return Err(SchedulerError::Config(format!(
                "reconcile timeout ({}ms) must be at least one tick ({}ms)",
                self.reconcile_timeout_ms, self.tick_interval_ms
            )));
        }
        if self.balance.max_moves_per_round == 0 {
            return Err(SchedulerError::Config(
                "max moves per rebalance round must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Processor-side agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Version string reported in sync messages.
    pub processor_version: String,
    /// Interval between agent ticks (acknowledgement polling).
    pub tick_interval_ms: u64,
    /// Interval between watermark reports to the owner.
    pub checkpoint_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            processor_version: env!("CARGO_PKG_VERSION").to_string(),
            tick_interval_ms: 50,
            checkpoint_interval_ms: 500,
        }
    }
}

impl AgentConfig {
    pub fn with_checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.checkpoint_interval_ms = ms;
        self
    }

    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Settings for one capture process: its processor agent and, when it wins
/// the election, its owner.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub capture_id: String,
    pub changefeed: String,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    /// Buffered owner-bound messages kept while this capture is not the owner.
    pub owner_inbox_capacity: usize,
}

impl CaptureConfig {
    pub fn new(capture_id: impl Into<String>, changefeed: impl Into<String>) -> Self {
        Self {
            capture_id: capture_id.into(),
            changefeed: changefeed.into(),
            scheduler: SchedulerConfig::default(),
            agent: AgentConfig::default(),
            owner_inbox_capacity: 1024,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture_id.is_empty() {
            return Err(SchedulerError::Config("capture id must not be empty".to_string()));
        }
        if self.changefeed.is_empty() {
            return Err(SchedulerError::Config("changefeed must not be empty".to_string()));
        }
        if self.owner_inbox_capacity == 0 {
            return Err(SchedulerError::Config(
                "owner_inbox_capacity must be positive".to_string(),
            ));
        }
        if self.agent.tick_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "agent tick_interval_ms must be positive".to_string(),
            ));
        }
        self.scheduler.validate()
    }
}
