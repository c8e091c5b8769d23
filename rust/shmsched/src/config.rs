use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SchedError};
use crate::pool::CommandPool;
use crate::wake::WakeMode;

pub const DEFAULT_SLOTS: u32 = 256;
pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PLACEHOLDER_LIFETIME: Duration = Duration::from_secs(600);

/// Settings fixed when a region is created and its driver started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of command slots in the region.
    pub slots: u32,
    /// Shell that runs each command as `<shell> -c <code>`.
    pub shell: PathBuf,
    pub wake: WakeMode,
    /// Delay before a failed fork is retried.
    pub retry_interval: Duration,
    /// How long a placeholder child sleeps before exiting on its own.
    pub placeholder_lifetime: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            shell: PathBuf::from(DEFAULT_SHELL),
            wake: WakeMode::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            placeholder_lifetime: DEFAULT_PLACEHOLDER_LIFETIME,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        CommandPool::required_size(self.slots)?;
        if self.shell.as_os_str().is_empty() {
            return Err(SchedError::Config("shell path is empty".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(SchedError::Config("retry interval must be non-zero".into()));
        }
        if self.placeholder_lifetime.is_zero() {
            return Err(SchedError::Config(
                "placeholder lifetime must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert_eq!(config.slots, 256);
        assert_eq!(config.wake, WakeMode::Signal);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let config = SchedulerConfig {
            slots: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));

        let config = SchedulerConfig {
            shell: PathBuf::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));

        let config = SchedulerConfig {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
