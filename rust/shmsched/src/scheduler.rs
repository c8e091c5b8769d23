//! Dependency-ordered scheduling.
//!
//! A command may start once every command it depends on has completed.
//! Dependencies name commands, not slots: if several commands share a name,
//! all of them must be complete, not just the most recently enqueued one. A
//! command never counts towards its own dependencies, so depending on your
//! own name does not block. A name nobody has enqueued never blocks, and
//! unnamed (`.`) commands cannot be depended on.

use nix::unistd::Pid;

use crate::command::CommandView;
use crate::driver::{Launcher, drive};
use crate::layout::CommandState;
use crate::pool::CommandPool;

/// True if every dependency of `command` is satisfied.
pub fn is_ready(pool: &CommandPool, command: &CommandView<'_>) -> bool {
    command
        .dependencies()
        .all(|dep| !is_blocking(pool, command, dep))
}

/// True if some other command named `dep` has not completed.
fn is_blocking(pool: &CommandPool, command: &CommandView<'_>, dep: &[u8]) -> bool {
    pool.commands().any(|other| {
        other.offset() != command.offset()
            && other.is_named()
            && other.name() == dep
            && other.state() != CommandState::Complete
    })
}

/// Outcome of trying to start one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Started(Pid),
    Blocked,
    /// Ready, but the launch failed; the command is WAITING again.
    LaunchFailed,
}

/// Start `command` if it is ready.
pub fn schedule<L: Launcher + ?Sized>(
    pool: &CommandPool,
    command: &CommandView<'_>,
    launcher: &mut L,
) -> Scheduled {
    if !is_ready(pool, command) {
        trace!(name = %command.name_lossy(), "blocked on dependencies");
        return Scheduled::Blocked;
    }
    match drive(command, launcher) {
        Ok(pid) => Scheduled::Started(pid),
        Err(_) => Scheduled::LaunchFailed,
    }
}

/// What one pass over the active list found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Some command is still waiting after this sweep.
    pub pending_init: bool,
    /// Some command is waiting or running after this sweep.
    pub pending_term: bool,
    pub started: usize,
    pub launch_failures: usize,
    /// Commands left waiting.
    pub waiting: usize,
    /// Commands that were already running when the sweep saw them.
    pub running: usize,
    pub complete: usize,
}

impl Sweep {
    /// Nothing is running, nothing was started, and nothing can be: the
    /// remaining commands wait on each other.
    pub fn stalled(&self) -> bool {
        self.waiting > 0 && self.running == 0 && self.started == 0 && self.launch_failures == 0
    }
}

/// One pass over every published command, starting each one that is ready.
///
/// Commands started earlier in the same pass count as running for the
/// commands after them.
pub fn sweep<L: Launcher + ?Sized>(pool: &CommandPool, launcher: &mut L) -> Sweep {
    let mut sweep = Sweep::default();

    for command in pool.commands() {
        match command.state() {
            CommandState::Reset | CommandState::Waiting => {
                sweep.pending_term = true;
                match schedule(pool, &command, launcher) {
                    Scheduled::Started(_) => sweep.started += 1,
                    Scheduled::Blocked => {
                        sweep.pending_init = true;
                        sweep.waiting += 1;
                    }
                    Scheduled::LaunchFailed => {
                        sweep.pending_init = true;
                        sweep.waiting += 1;
                        sweep.launch_failures += 1;
                    }
                }
            }
            CommandState::Active => {
                sweep.pending_term = true;
                sweep.running += 1;
            }
            CommandState::Complete => sweep.complete += 1,
        }
    }

    trace!(?sweep, "sweep finished");
    sweep
}
