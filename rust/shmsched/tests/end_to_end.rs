//! Whole-program scenarios against the built binary.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use shmsched::{RegionToken, SharedRegion};
use tempfile::NamedTempFile;

const BIN: &str = env!("CARGO_BIN_EXE_shmsched");
const DEADLINE: Duration = Duration::from_secs(30);

struct Scheduler {
    file: NamedTempFile,
    token: RegionToken,
}

impl Scheduler {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let file = NamedTempFile::new().unwrap();
        let token = RegionToken::from_path(file.path()).unwrap();
        SharedRegion::purge(&token).unwrap();
        Self { file, token }
    }

    fn command(&self, flags: &[&str], args: &[&str]) -> Command {
        let mut cmd = Command::new(BIN);
        cmd.env_remove("SHMSCHED_SLOTS")
            .env_remove("SHMSCHED_SHELL")
            .env_remove("SHMSCHED_WAKE")
            .env("SHMSCHED_LOG", "warn")
            .args(flags)
            .arg(self.file.path())
            .args(args);
        cmd
    }

    /// Boot with the driver detached from our pipes: it outlives the
    /// booting process and would otherwise hold them open.
    fn boot_with(&self, flags: &[&str]) {
        let mut cmd = self.command(flags, &["-boot"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = finish(cmd.spawn().unwrap()).status;
        assert!(status.success(), "-boot failed: {status}");
    }

    fn boot_ignoring_sigchld(&self) {
        self.boot_ignoring_sigchld_with(&[]);
    }

    /// Boot from a parent that ignores `SIGCHLD`, which the driver inherits.
    fn boot_ignoring_sigchld_with(&self, flags: &[&str]) {
        let mut cmd = self.command(flags, &["-boot"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                libc::signal(libc::SIGCHLD, libc::SIG_IGN);
                Ok(())
            });
        }
        let status = finish(cmd.spawn().unwrap()).status;
        assert!(status.success(), "-boot failed: {status}");
    }

    fn boot(&self) {
        self.boot_with(&[]);
    }

    fn run(&self, args: &[&str]) -> Output {
        self.run_with(&[], args)
    }

    fn run_with(&self, flags: &[&str], args: &[&str]) -> Output {
        let mut cmd = self.command(flags, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        finish(cmd.spawn().unwrap())
    }

    fn submit(&self, args: &[&str]) {
        let out = self.run(args);
        assert!(out.status.success(), "submit {args:?}: {}", stderr(&out));
    }

    /// `-wait --report`, split into lines of tab-separated fields.
    fn drain_report(&self) -> Vec<Vec<String>> {
        let out = self.run_with(&["--report"], &["-wait"]);
        assert!(out.status.success(), "-wait failed: {}", stderr(&out));
        report_lines(&out)
    }

    /// Poll `-status` until `accept` holds for its report.
    fn status_until(&self, accept: impl Fn(&[Vec<String>]) -> bool) -> Vec<Vec<String>> {
        let start = Instant::now();
        loop {
            let out = self.run(&["-status"]);
            assert!(out.status.success(), "-status failed: {}", stderr(&out));
            let lines: Vec<Vec<String>> = report_lines(&out).into_iter().skip(1).collect();
            if accept(&lines) {
                return lines;
            }
            assert!(start.elapsed() < DEADLINE, "status never matched: {lines:?}");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = SharedRegion::purge(&self.token);
    }
}

/// Wait for `child`, killing it if it runs past the deadline.
fn finish(mut child: Child) -> Output {
    let start = Instant::now();
    while child.try_wait().unwrap().is_none() {
        if start.elapsed() > DEADLINE {
            let _ = child.kill();
            panic!("shmsched did not finish within {DEADLINE:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    child.wait_with_output().unwrap()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn report_lines(out: &Output) -> Vec<Vec<String>> {
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|line| line.split('\t').map(str::to_owned).collect())
        .collect()
}

fn alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[test]
fn single_command_runs_to_completion() {
    let sched = Scheduler::new();
    sched.boot();
    sched.submit(&["A=exit 0"]);

    let report = sched.drain_report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0][0], "A");
    assert_eq!(report[0][1], "complete");
    assert_eq!(report[0][3], "0");

    // The region is gone afterwards.
    let out = sched.run(&["-status"]);
    assert!(!out.status.success());
}

#[test]
fn dependency_runs_first_whatever_the_enqueue_order() {
    let sched = Scheduler::new();
    let marker = tempfile::tempdir().unwrap();
    let log = marker.path().join("order");
    let log = log.to_str().unwrap();

    sched.boot();
    // Holds both back until they are enqueued: a name nobody has enqueued
    // yet does not block.
    sched.submit(&["gate=sleep 1"]);
    // B is enqueued first and must still run after A.
    sched.submit(&[&format!("B=echo B >> {log}"), "A", "gate"]);
    sched.submit(&[&format!("A=echo A >> {log}"), "gate"]);

    let report = sched.drain_report();
    assert!(report.iter().all(|line| line[1] == "complete"), "{report:?}");
    assert_eq!(std::fs::read_to_string(log).unwrap(), "A\nB\n");
}

#[test]
fn exit_status_is_recorded() {
    let sched = Scheduler::new();
    sched.boot();
    sched.submit(&["seven", "exit 7"]);
    sched.submit(&["killed=kill -9 $$"]);

    let report = sched.drain_report();
    let code = |name: &str| {
        report
            .iter()
            .find(|line| line[0] == name)
            .map(|line| line[3].clone())
            .unwrap()
    };
    assert_eq!(code("seven"), "7");
    assert_eq!(code("killed"), (128 + libc::SIGKILL).to_string());
}

#[test]
fn terminate_leaves_running_commands_alone() {
    let sched = Scheduler::new();
    sched.boot();
    sched.submit(&["slow=sleep 5"]);

    let lines = sched.status_until(|lines| lines.iter().any(|line| line[1] == "active"));
    let pid: i32 = lines[0][2].parse().unwrap();

    let start = Instant::now();
    let out = sched.run(&["-term"]);
    assert!(out.status.success(), "-term failed: {}", stderr(&out));
    assert!(start.elapsed() < Duration::from_secs(3), "-term waited for the command");

    assert!(alive(pid), "running command was killed");
    unsafe { libc::kill(pid, libc::SIGKILL) };
}

#[test]
fn concurrent_clients_each_command_runs_once() {
    const CLIENTS: usize = 2;
    const PER_CLIENT: usize = 50;

    let sched = Scheduler::new();
    sched.boot();

    thread::scope(|scope| {
        for c in 0..CLIENTS {
            let sched = &sched;
            scope.spawn(move || {
                for i in 0..PER_CLIENT {
                    sched.submit(&[&format!("c{c}-{i}=true")]);
                }
            });
        }
    });

    let report = sched.drain_report();
    assert_eq!(report.len(), CLIENTS * PER_CLIENT);
    assert!(
        report
            .iter()
            .all(|line| line[1] == "complete" && line[3] == "0"),
        "{report:?}"
    );
}

#[test]
fn dependency_cycle_does_not_hang_wait() {
    let sched = Scheduler::new();
    sched.boot();
    sched.submit(&["gate=sleep 1"]);
    sched.submit(&["a=true", "b", "gate"]);
    sched.submit(&["b=true", "a", "gate"]);

    let report = sched.drain_report();
    assert_eq!(report.len(), 3);
    assert_eq!(report[0][1], "complete");
    assert!(report[1..].iter().all(|line| line[1] == "waiting"), "{report:?}");
}

#[test]
fn placeholder_wake_runs_commands() {
    let sched = Scheduler::new();
    sched.boot_with(&["--wake", "placeholder"]);
    sched.submit(&["first=true"]);
    sched.submit(&["second=exit 3", "first"]);

    let report = sched.drain_report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[1][0], "second");
    assert_eq!(report[1][3], "3");
}

#[test]
fn boot_twice_fails_and_init_joins() {
    let sched = Scheduler::new();
    sched.boot();

    let out = sched.run(&["-boot"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("already running"), "{}", stderr(&out));

    let out = sched.run(&["-init"]);
    assert!(out.status.success(), "-init failed: {}", stderr(&out));

    let out = sched.run(&["-term"]);
    assert!(out.status.success());
}

#[test]
fn submit_without_scheduler_fails() {
    let sched = Scheduler::new();
    let out = sched.run(&["A=true"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).starts_with("shmsched: "), "{}", stderr(&out));
}

#[test]
fn bad_arguments_are_rejected() {
    let sched = Scheduler::new();
    assert_eq!(sched.run(&["-explode"]).status.code(), Some(1));
    assert_eq!(sched.run(&["-boot", "extra"]).status.code(), Some(1));

    let out = Command::new(BIN).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn inherited_ignored_sigchld_still_records_exits() {
    let sched = Scheduler::new();
    sched.boot_ignoring_sigchld();
    sched.submit(&["A=exit 7"]);

    let report = sched.drain_report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0][1], "complete");
    assert_eq!(report[0][3], "7");
}

#[test]
fn inherited_ignored_sigchld_with_placeholder_wake() {
    let sched = Scheduler::new();
    sched.boot_ignoring_sigchld_with(&["--wake", "placeholder"]);
    sched.submit(&["A=exit 5"]);

    let report = sched.drain_report();
    assert_eq!(report[0][3], "5");
}
