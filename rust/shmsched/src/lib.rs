//! A command scheduler shared between processes.
//!
//! One process boots a region named by a token (a path or an IPC key). The
//! region holds a fixed pool of command slots in System V shared memory. Any
//! process may then enqueue shell commands, each with a name and a list of
//! dependency names. A driver process forked at boot starts every command
//! whose dependencies have completed, records exit codes, and shuts down on
//! request: immediately (`terminate`), or once all work is done (`drain`).
//!
//! The shared structures are lock-free lists of offsets, see
//! [`shmsched_primitives`].

#[macro_use]
mod macros;

pub mod client;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod layout;
pub mod logging;
pub mod pool;
pub mod region;
pub mod scheduler;
pub mod supervisor;
pub mod sysv;
pub mod token;
pub mod wake;

pub use client::{Action, Launched, Shutdown};
pub use command::{CommandSpec, CommandView};
pub use config::SchedulerConfig;
pub use error::{Result, SchedError};
pub use layout::{CommandState, RegionState};
pub use pool::{CommandPool, CommandReport};
pub use region::SharedRegion;
pub use supervisor::{ExitReason, LoopExit};
pub use token::RegionToken;
pub use wake::WakeMode;
