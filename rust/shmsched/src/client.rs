//! What a single invocation does: create a region and its driver, submit a
//! command, or shut a scheduler down and collect its report.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use nix::unistd::{ForkResult, Pid, dup2, fork, getpid};
use shmsched_primitives::Offset;

use crate::command::CommandSpec;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::layout::RegionState;
use crate::pool::CommandReport;
use crate::region::SharedRegion;
use crate::supervisor::{LoopExit, run_driver};
use crate::token::RegionToken;

/// How often `-init` re-checks a region that is shutting down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// One invocation's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create the region and start its driver.
    Boot,
    /// Like `Boot`, but joining a live region is not an error.
    Init,
    /// Stop starting commands, then tear down.
    Terminate,
    /// Let every command finish, then tear down.
    Wait,
    Status,
    /// Remove the IPC objects whatever state they are in.
    Purge,
    Submit(CommandSpec),
}

impl Action {
    /// Interpret the words after the token.
    ///
    /// A leading `-word` is a switch; anything else is a command submission.
    /// `-verify` is accepted anywhere and ignored.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let args: Vec<&str> = args
            .iter()
            .map(AsRef::as_ref)
            .filter(|arg| *arg != "-verify" && !arg.starts_with("-verify="))
            .collect();

        let Some((&first, rest)) = args.split_first() else {
            return Err(SchedError::InvalidCommand("no command specified".into()));
        };

        let Some(switch) = first.strip_prefix('-') else {
            return CommandSpec::from_args(&args).map(Self::Submit);
        };

        let action = match switch {
            "boot" => Self::Boot,
            "init" => Self::Init,
            "term" => Self::Terminate,
            "wait" => Self::Wait,
            "status" => Self::Status,
            "purge" => Self::Purge,
            _ => {
                return Err(SchedError::InvalidCommand(format!(
                    "invalid switch {first:?}"
                )));
            }
        };
        if let Some(extra) = rest.first() {
            return Err(SchedError::InvalidCommand(format!(
                "{extra:?} not expected after {first}"
            )));
        }
        Ok(action)
    }
}

/// Which side of the driver fork a boot returned on.
#[derive(Debug)]
pub enum Launched {
    /// This process created the region; the driver runs as `driver`.
    Started { driver: Pid },
    /// `-init` found a live region and left it to its driver.
    Joined,
    /// This process is the driver, and its loop has finished.
    Driver(Result<LoopExit>),
}

/// Create the region for `token` and fork its driver.
pub fn boot(token: &RegionToken, config: &SchedulerConfig) -> Result<Launched> {
    config.validate()?;
    let region = SharedRegion::create(token, config.slots)?;
    announce(&region, RegionState::Booted);
    spawn_driver(region, config)
}

/// Make sure a scheduler is running for `token`.
///
/// Joins a live region. A region that is shutting down is waited out and
/// then replaced.
pub fn init(token: &RegionToken, config: &SchedulerConfig) -> Result<Launched> {
    config.validate()?;
    loop {
        match SharedRegion::create(token, config.slots) {
            Ok(region) => {
                announce(&region, RegionState::Inited);
                return spawn_driver(region, config);
            }
            Err(SchedError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        match SharedRegion::attach(token) {
            Ok(region) if !region.state().is_closing() => {
                debug!(%token, state = %region.state(), "joining running scheduler");
                return Ok(Launched::Joined);
            }
            Ok(region) => {
                trace!(%token, state = %region.state(), "waiting for previous scheduler to finish");
                drop(region);
                thread::sleep(SHUTDOWN_POLL);
            }
            // Torn down between our create and attach: try creating again.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
}

/// Move a freshly created region out of `Reset`. A shutdown client may
/// already have attached and closed it; the driver is started either way so
/// that it posts TERMINATOR for that client.
fn announce(region: &SharedRegion, state: RegionState) {
    let now = region.header().open(state);
    if now != state {
        debug!(token = %region.token(), state = %now, "shutdown requested before boot finished");
    }
}

fn spawn_driver(region: SharedRegion, config: &SchedulerConfig) -> Result<Launched> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            info!(token = %region.token(), driver = %child, "driver started");
            Ok(Launched::Started { driver: child })
        }
        Ok(ForkResult::Child) => {
            let span = tracing::info_span!("driver", pid = %getpid());
            let _guard = span.enter();
            redirect_stdin();
            Ok(Launched::Driver(run_driver(&region, config)))
        }
        Err(errno) => {
            let _ = region.destroy();
            Err(SchedError::ForkFailed(errno))
        }
    }
}

/// Commands must not compete for the terminal that booted the scheduler.
fn redirect_stdin() {
    let Ok(null) = File::open("/dev/null") else {
        return;
    };
    if let Err(errno) = dup2(null.as_raw_fd(), libc::STDIN_FILENO) {
        debug!(error = %errno, "could not redirect stdin");
    }
}

/// Enqueue `spec` on the scheduler for `token` and wake its driver.
pub fn submit(token: &RegionToken, spec: &CommandSpec) -> Result<Offset> {
    let region = SharedRegion::attach(token)?;
    let offset = region.enqueue(spec)?;
    region.notify();
    Ok(offset)
}

/// How a scheduler should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop once nothing is waiting to start; running commands carry on.
    Terminate,
    /// Stop once every command has completed.
    Drain,
}

impl Shutdown {
    fn target(self) -> RegionState {
        match self {
            Self::Terminate => RegionState::Terminating,
            Self::Drain => RegionState::Draining,
        }
    }
}

/// Ask the driver for `token` to stop, wait until it has, then destroy the
/// region. Returns the final report.
pub fn shutdown(token: &RegionToken, how: Shutdown) -> Result<Vec<CommandReport>> {
    let region = SharedRegion::attach(token)?;
    // `Reset` stays open: its creator is about to fork a driver, and
    // `RegionHeader::open` will not undo this request.
    let open = [RegionState::Reset, RegionState::Booted, RegionState::Inited];

    match region.header().transition(&open, how.target()) {
        Ok(previous) => debug!(%token, %previous, target = %how.target(), "shutdown requested"),
        Err(current) => debug!(%token, %current, "shutdown already under way"),
    }

    if region.state() != RegionState::Terminated {
        region.notify();
        if !region.wait_terminated()? {
            // Someone else collected and destroyed it while we waited.
            debug!(%token, "region removed while waiting");
            return Ok(Vec::new());
        }
    }

    let report = region.report();
    region.destroy()?;
    Ok(report)
}

/// Report on the scheduler for `token` without changing anything.
pub fn status(token: &RegionToken) -> Result<(RegionState, Vec<CommandReport>)> {
    let region = SharedRegion::attach(token)?;
    Ok((region.state(), region.report()))
}

pub fn purge(token: &RegionToken) -> Result<bool> {
    SharedRegion::purge(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Action> {
        Action::parse(args)
    }

    #[test]
    fn switches() {
        assert_eq!(parse(&["-boot"]).unwrap(), Action::Boot);
        assert_eq!(parse(&["-init"]).unwrap(), Action::Init);
        assert_eq!(parse(&["-term"]).unwrap(), Action::Terminate);
        assert_eq!(parse(&["-wait"]).unwrap(), Action::Wait);
        assert_eq!(parse(&["-status"]).unwrap(), Action::Status);
        assert_eq!(parse(&["-purge"]).unwrap(), Action::Purge);
    }

    #[test]
    fn verify_is_ignored() {
        assert_eq!(parse(&["-verify", "-wait"]).unwrap(), Action::Wait);
        assert_eq!(parse(&["-boot", "-verify=1"]).unwrap(), Action::Boot);
        assert!(parse(&["-verify"]).is_err());
    }

    #[test]
    fn submissions() {
        let action = parse(&["b=exit 0", "a"]).unwrap();
        assert_eq!(
            action,
            Action::Submit(CommandSpec::new("b", "exit 0").with_deps(["a"]))
        );
    }

    #[test]
    fn rejects_unknown_and_trailing() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-explode"]).is_err());
        assert!(parse(&["-boot", "extra"]).is_err());
    }

    #[test]
    fn shutdown_targets() {
        assert_eq!(Shutdown::Terminate.target(), RegionState::Terminating);
        assert_eq!(Shutdown::Drain.target(), RegionState::Draining);
    }
}
