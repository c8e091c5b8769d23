use nix::errno::Errno;

use crate::layout::RegionState;

/// Everything that can go wrong while creating, driving or talking to a
/// scheduler region.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("no scheduler is running for {token}")]
    NotFound { token: String },

    #[error("a scheduler is already running for {token}")]
    AlreadyExists { token: String },

    #[error("shared segment does not hold a scheduler region: {reason}")]
    Corrupt { reason: &'static str },

    #[error("out of shared storage: {detail}")]
    ResourceExhausted { detail: String },

    #[error("unable to create child process: {0}")]
    ForkFailed(#[source] Errno),

    #[error("cannot execute {shell}: {source}")]
    ExecFailed {
        shell: String,
        #[source]
        source: Errno,
    },

    #[error("scheduler is {state} and no longer accepts commands")]
    Closed { state: RegionState },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("command text needs {needed} bytes, a slot holds {capacity}")]
    TooLarge { needed: usize, capacity: usize },

    #[error("invalid token {token:?}: {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: Errno,
    },
}

impl SchedError {
    pub(crate) fn os(op: &'static str, source: Errno) -> Self {
        Self::Os { op, source }
    }

    /// True for errors that mean the region is simply not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = SchedError> = std::result::Result<T, E>;
