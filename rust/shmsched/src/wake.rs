//! How the driver sleeps, and how clients wake it.
//!
//! The driver has two things to wait for: a child exiting, and a client
//! having enqueued a command (or requested shutdown). Both must interrupt the
//! same wait.
//!
//! - [`SignalWake`] blocks `SIGCHLD` and `SIGUSR1` and waits for either with
//!   `sigwait`. Clients send `SIGUSR1` to the published pid.
//! - [`PlaceholderWake`] keeps a sleeping child around and blocks in
//!   `wait(2)`. Clients wake the driver by killing that child; the driver
//!   respawns it on every wake.
//!
//! In both modes the driver publishes its notification pid before its first
//! sweep, and clients push their command before reading the pid. A client
//! either sees the pid and wakes the driver, or pushed early enough for the
//! sweep to find the command.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, wait, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};

use crate::error::{Result, SchedError};
use crate::layout::RegionHeader;
use crate::pool::CommandPool;

/// Which wake mechanism a driver uses. Chosen at boot, recorded in the
/// region header so clients know how to notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeMode {
    #[default]
    Signal,
    Placeholder,
}

impl WakeMode {
    pub(crate) fn to_raw(self) -> u32 {
        match self {
            Self::Signal => 1,
            Self::Placeholder => 2,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Signal),
            2 => Some(Self::Placeholder),
            _ => None,
        }
    }
}

impl fmt::Display for WakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signal => "signal",
            Self::Placeholder => "placeholder",
        })
    }
}

impl FromStr for WakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(Self::Signal),
            "placeholder" => Ok(Self::Placeholder),
            other => Err(format!(
                "unknown wake mode {other:?} (expected \"signal\" or \"placeholder\")"
            )),
        }
    }
}

/// A reaped child and its completion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    /// Exit status, or 128 + signal number when killed by a signal.
    pub code: i32,
}

impl ChildExit {
    /// Completion for a terminal wait status; `None` for stop/continue
    /// notifications.
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self { pid, code }),
            WaitStatus::Signaled(pid, signal, _) => Some(Self {
                pid,
                code: 128 + signal as i32,
            }),
            _ => None,
        }
    }
}

/// The driver's side of a wake mechanism.
pub trait WakeSource {
    /// Become notifiable. Called once, before the first sweep.
    fn arm(&mut self, header: &RegionHeader) -> Result<()>;

    /// Sleep until a child exits or a client wakes us, then return every
    /// child that has exited. May return an empty list.
    ///
    /// `timeout` bounds the sleep where the mechanism supports it.
    fn wait(&mut self, header: &RegionHeader, timeout: Option<Duration>) -> Result<Vec<ChildExit>>;

    /// Stop being notifiable. Called once, after the loop ends.
    fn disarm(&mut self, header: &RegionHeader);
}

/// Wake the driver of `pool`, if one is armed.
///
/// Returns false when no driver was notified.
pub fn notify_driver(pool: &CommandPool) -> Result<bool> {
    let header = pool.header();
    match header.wake_mode() {
        Some(WakeMode::Signal) => {
            let Some(pid) = header.driver_pid() else {
                return Ok(false);
            };
            deliver(pid, Signal::SIGUSR1)
        }
        Some(WakeMode::Placeholder) => {
            // Whoever swaps the pid out owns the kill; the driver republishes
            // after respawning.
            let Some(pid) = header.take_driver_pid() else {
                return Ok(false);
            };
            deliver(pid, Signal::SIGKILL)
        }
        None => Ok(false),
    }
}

fn deliver(pid: Pid, signal: Signal) -> Result<bool> {
    match kill(pid, signal) {
        Ok(()) => {
            trace!(%pid, ?signal, "woke driver");
            Ok(true)
        }
        // Driver or placeholder already gone; the driver sweeps again anyway.
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(SchedError::os("kill", errno)),
    }
}

/// Put `SIGCHLD` back to its default disposition.
///
/// An ignored `SIGCHLD` survives fork and exec, and makes the kernel reap
/// children itself: their exit codes would never reach `waitpid`.
pub fn keep_zombies() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let previous = unsafe { sigaction(Signal::SIGCHLD, &default) }
        .map_err(|errno| SchedError::os("sigaction", errno))?;
    if previous.handler() != SigHandler::SigDfl {
        debug!(previous = ?previous.handler(), "SIGCHLD disposition reset");
    }
    Ok(())
}

const ANY_CHILD: Pid = Pid::from_raw(-1);

/// Reap every child that has already exited, without blocking.
pub fn reap_exited() -> Result<Vec<ChildExit>> {
    let mut exits = Vec::new();
    loop {
        match waitpid(ANY_CHILD, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => exits.extend(ChildExit::from_status(status)),
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(SchedError::os("waitpid", errno)),
        }
    }
    Ok(exits)
}

/// Wake mechanism built on a blocked signal mask.
pub struct SignalWake {
    set: SigSet,
}

impl SignalWake {
    pub fn new() -> Self {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        set.add(Signal::SIGUSR1);
        Self { set }
    }

    /// Block until one of our signals is pending, or `timeout` passes.
    fn sleep(&self, timeout: Option<Duration>) -> Result<()> {
        let signal = match timeout {
            None => match self.set.wait() {
                Ok(signal) => Some(signal as i32),
                Err(Errno::EINTR) => None,
                Err(errno) => return Err(SchedError::os("sigwait", errno)),
            },
            Some(timeout) => timed_wait(&self.set, timeout)?,
        };
        trace!(?signal, "driver woke");

        // Coalesce whatever else is already pending into this wake.
        while timed_wait(&self.set, Duration::ZERO)?.is_some() {}
        Ok(())
    }
}

impl Default for SignalWake {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSource for SignalWake {
    fn arm(&mut self, header: &RegionHeader) -> Result<()> {
        keep_zombies()?;
        // Signals stay blocked for the rest of the driver's life: a late
        // SIGUSR1 from a client must never reach the default handler.
        self.set
            .thread_block()
            .map_err(|errno| SchedError::os("pthread_sigmask", errno))?;
        let pid = getpid();
        header.publish_driver(pid, WakeMode::Signal);
        debug!(%pid, "signal wake armed");
        Ok(())
    }

    fn wait(&mut self, _header: &RegionHeader, timeout: Option<Duration>) -> Result<Vec<ChildExit>> {
        // Children that exited before we got here have a SIGCHLD pending, so
        // the sleep returns at once for them.
        self.sleep(timeout)?;
        reap_exited()
    }

    fn disarm(&mut self, header: &RegionHeader) {
        header.take_driver_pid();
    }
}

/// Returns the signal taken, or `None` on timeout or interruption.
#[cfg(target_os = "linux")]
fn timed_wait(set: &SigSet, timeout: Duration) -> Result<Option<i32>> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let ret = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &ts) };
    if ret >= 0 {
        return Ok(Some(ret));
    }
    match Errno::last() {
        Errno::EAGAIN | Errno::EINTR => Ok(None),
        errno => Err(SchedError::os("sigtimedwait", errno)),
    }
}

/// Without `sigtimedwait` a bounded wait degrades to an unbounded one, and
/// pending signals are not coalesced.
#[cfg(not(target_os = "linux"))]
fn timed_wait(set: &SigSet, timeout: Duration) -> Result<Option<i32>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    set.wait()
        .map(|signal| Some(signal as i32))
        .map_err(|errno| SchedError::os("sigwait", errno))
}

/// Wake mechanism built on a sacrificial child process.
pub struct PlaceholderWake {
    lifetime: Duration,
    current: Option<Pid>,
}

impl PlaceholderWake {
    /// `lifetime` is how long a placeholder sleeps before exiting on its own.
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            current: None,
        }
    }

    fn spawn(&mut self, header: &RegionHeader) -> Result<()> {
        let lifetime = self.lifetime;
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                trace!(placeholder = %child, "placeholder spawned");
                self.current = Some(child);
                header.publish_driver(child, WakeMode::Placeholder);
                Ok(())
            }
            Ok(ForkResult::Child) => {
                std::thread::sleep(lifetime);
                unsafe { libc::_exit(0) }
            }
            Err(errno) => Err(SchedError::ForkFailed(errno)),
        }
    }
}

impl WakeSource for PlaceholderWake {
    fn arm(&mut self, header: &RegionHeader) -> Result<()> {
        keep_zombies()?;
        self.spawn(header)
    }

    fn wait(&mut self, header: &RegionHeader, _timeout: Option<Duration>) -> Result<Vec<ChildExit>> {
        loop {
            let status = match wait() {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Nothing left to wait on, not even a placeholder.
                    self.spawn(header)?;
                    return Ok(Vec::new());
                }
                Err(errno) => return Err(SchedError::os("wait", errno)),
            };

            if status.pid().is_some() && status.pid() == self.current {
                self.current = None;
                self.spawn(header)?;
                return Ok(Vec::new());
            }
            if let Some(exit) = ChildExit::from_status(status) {
                return Ok(vec![exit]);
            }
        }
    }

    fn disarm(&mut self, header: &RegionHeader) {
        header.take_driver_pid();
        if let Some(pid) = self.current.take() {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}
