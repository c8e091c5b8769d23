//! Starting commands as child processes.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::Ordering;

use nix::sys::signal::SigSet;
use nix::unistd::{ForkResult, Pid, execv, fork};

use crate::command::CommandView;
use crate::error::{Result, SchedError};
use crate::layout::CommandState;

/// Exit status of a child whose `exec` failed, as shells use.
pub const EXEC_FAILED_STATUS: libc::c_int = 127;

/// Something that can turn a command into a running process.
pub trait Launcher {
    /// Start `command` and return the new process's pid. Must not block on
    /// the child.
    fn launch(&mut self, command: &CommandView<'_>) -> Result<Pid>;
}

/// Start `command`: ACTIVE first, then launch, then record the pid.
///
/// If the launch fails the command goes back to WAITING so a later sweep
/// retries it.
pub fn drive<L: Launcher + ?Sized>(command: &CommandView<'_>, launcher: &mut L) -> Result<Pid> {
    let record = command.record();
    record.set_state(CommandState::Active);

    match launcher.launch(command) {
        Ok(pid) => {
            record.pid.store(pid.as_raw(), Ordering::Release);
            debug!(name = %command.name_lossy(), %pid, "command started");
            Ok(pid)
        }
        Err(err) => {
            record.set_state(CommandState::Waiting);
            warn!(name = %command.name_lossy(), error = %err, "command start failed");
            Err(err)
        }
    }
}

/// Record that `command` finished with `code`.
pub fn complete(command: &CommandView<'_>, code: i32) {
    let record = command.record();
    record.completion.store(code, Ordering::Release);
    record.set_state(CommandState::Complete);
    debug!(name = %command.name_lossy(), code, "command complete");
}

/// Runs commands as `<shell> -c <code>` in a forked child.
pub struct ShellLauncher {
    shell: CString,
    arg0: CString,
}

impl ShellLauncher {
    pub fn new(shell: &Path) -> Result<Self> {
        let shell = CString::new(shell.as_os_str().as_bytes())
            .map_err(|_| SchedError::Config(format!("shell path {shell:?} contains a NUL byte")))?;
        let arg0 = match shell.as_bytes().rsplit(|&b| b == b'/').next() {
            Some(name) if !name.is_empty() => CString::new(name).unwrap_or_else(|_| shell.clone()),
            _ => shell.clone(),
        };
        Ok(Self { shell, arg0 })
    }

    pub fn shell(&self) -> &CStr {
        &self.shell
    }
}

impl Launcher for ShellLauncher {
    fn launch(&mut self, command: &CommandView<'_>) -> Result<Pid> {
        // Everything the child needs is built before forking.
        let code = command.code().to_owned();
        let argv = [self.arg0.as_c_str(), c"-c", code.as_c_str()];

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => exec_child(&self.shell, &argv),
            Err(errno) => Err(SchedError::ForkFailed(errno)),
        }
    }
}

fn exec_child(shell: &CStr, argv: &[&CStr]) -> ! {
    // The driver may have SIGCHLD/SIGUSR1 blocked; commands start clean.
    let _ = SigSet::empty().thread_set_mask();

    let errno = match execv(shell, argv) {
        Err(errno) => errno,
        Ok(never) => match never {},
    };
    let err = SchedError::ExecFailed {
        shell: shell.to_string_lossy().into_owned(),
        source: errno,
    };
    eprintln!("shmsched: {err}");
    unsafe { libc::_exit(EXEC_FAILED_STATUS) }
}
