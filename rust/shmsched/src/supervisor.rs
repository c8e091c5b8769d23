//! The driver's supervisory loop.
//!
//! ```text
//! loop {
//!     drain STARTUP
//!     sweep: start every ready command
//!     stop if the region's shutdown condition holds
//!     sleep until a child exits or a client wakes us
//!     record completions
//! }
//! ```

use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::driver::{Launcher, ShellLauncher, complete};
use crate::error::Result;
use crate::layout::{CommandState, RegionState};
use crate::pool::CommandPool;
use crate::region::SharedRegion;
use crate::scheduler::{Sweep, sweep};
use crate::sysv::{Semaphore, SemaphoreSet};
use crate::wake::{ChildExit, PlaceholderWake, SignalWake, WakeMode, WakeSource};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// TERMINATING, and nothing was left waiting to start.
    Terminated,
    /// DRAINING, and every command had completed.
    Drained,
    /// Shutdown was requested but the waiting commands can never start.
    Stalled { waiting: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopExit {
    pub reason: ExitReason,
    pub sweeps: u64,
    pub completed: u64,
}

/// Decide whether the loop should stop after `sweep`, given the region
/// `state` read after it.
pub fn exit_reason(sweep: &Sweep, state: RegionState) -> Option<ExitReason> {
    let terminating = matches!(state, RegionState::Terminating | RegionState::Terminated);

    if sweep.pending_init {
        if state.is_closing() && sweep.stalled() {
            return Some(ExitReason::Stalled {
                waiting: sweep.waiting,
            });
        }
        return None;
    }
    if terminating {
        return Some(ExitReason::Terminated);
    }
    if sweep.pending_term {
        return None;
    }
    if state == RegionState::Draining {
        return Some(ExitReason::Drained);
    }
    None
}

pub struct Supervisor<'a, L, W> {
    pool: &'a CommandPool,
    launcher: L,
    wake: W,
    startup: Option<&'a SemaphoreSet>,
    retry_interval: Duration,
}

impl<'a, L: Launcher, W: WakeSource> Supervisor<'a, L, W> {
    pub fn new(pool: &'a CommandPool, launcher: L, wake: W) -> Self {
        Self {
            pool,
            launcher,
            wake,
            startup: None,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Drain STARTUP from `semaphores` on every iteration.
    pub fn with_startup(mut self, semaphores: &'a SemaphoreSet) -> Self {
        self.startup = Some(semaphores);
        self
    }

    /// How long to sleep before retrying after a failed launch.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run until the region's shutdown condition holds.
    ///
    /// The wake source is armed before the first sweep and disarmed on the
    /// way out, whatever the outcome.
    pub fn run(&mut self) -> Result<LoopExit> {
        self.wake.arm(self.pool.header())?;
        let result = self.run_armed();
        self.wake.disarm(self.pool.header());
        result
    }

    fn run_armed(&mut self) -> Result<LoopExit> {
        let mut sweeps = 0;
        let mut completed = 0;

        loop {
            self.drain_startup();

            let found = sweep(self.pool, &mut self.launcher);
            sweeps += 1;

            let state = self.pool.state();
            if let Some(reason) = exit_reason(&found, state) {
                match reason {
                    ExitReason::Stalled { waiting } => {
                        error!(waiting, %state, "remaining commands can never start, giving up")
                    }
                    _ => info!(?reason, sweeps, completed, "driver loop finished"),
                }
                return Ok(LoopExit {
                    reason,
                    sweeps,
                    completed,
                });
            }

            let timeout = (found.launch_failures > 0).then_some(self.retry_interval);
            for exit in self.wake.wait(self.pool.header(), timeout)? {
                if record_exit(self.pool, exit) {
                    completed += 1;
                }
            }
        }
    }

    fn drain_startup(&self) {
        let Some(semaphores) = self.startup else {
            return;
        };
        match semaphores.drain(Semaphore::Startup) {
            Ok(0) => {}
            Ok(posts) => trace!(posts, "startup drained"),
            Err(errno) => warn!(error = %errno, "failed to drain startup semaphore"),
        }
    }
}

/// Mark the running command with pid `exit.pid` complete.
///
/// Returns false for children that are not commands of this pool.
pub fn record_exit(pool: &CommandPool, exit: ChildExit) -> bool {
    let found = pool
        .commands()
        .find(|cmd| cmd.state() == CommandState::Active && cmd.pid() == Some(exit.pid));
    match found {
        Some(cmd) => {
            complete(&cmd, exit.code);
            true
        }
        None => {
            debug!(pid = %exit.pid, code = exit.code, "reaped a child that is not a command");
            false
        }
    }
}

/// Body of the driver process: run the loop over `region`, then mark it
/// TERMINATED and post TERMINATOR so waiting clients can collect it.
///
/// The region itself is left for the client that requested shutdown.
pub fn run_driver(region: &SharedRegion, config: &SchedulerConfig) -> Result<LoopExit> {
    let result = ShellLauncher::new(&config.shell).and_then(|launcher| match config.wake {
        WakeMode::Signal => Supervisor::new(region.pool(), launcher, SignalWake::new())
            .with_startup(region.semaphores())
            .with_retry_interval(config.retry_interval)
            .run(),
        WakeMode::Placeholder => Supervisor::new(
            region.pool(),
            launcher,
            PlaceholderWake::new(config.placeholder_lifetime),
        )
        .with_startup(region.semaphores())
        .with_retry_interval(config.retry_interval)
        .run(),
    });

    if let Err(err) = &result {
        error!(error = %err, "driver loop failed");
    }

    region.header().set_state(RegionState::Terminated);
    if let Err(errno) = region.semaphores().post(Semaphore::Terminator) {
        error!(error = %errno, "failed to post terminator semaphore");
    }
    result
}
