//! `shmsched <token> <action>`
//!
//! Run with `shmsched --help` for the list of actions.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use shmsched::client::{self, Action, Launched, Shutdown};
use shmsched::config::{DEFAULT_SHELL, DEFAULT_SLOTS};
use shmsched::logging::{self, DEFAULT_FILTER, LOG_ENV};
use shmsched::{RegionToken, Result, SchedError, SchedulerConfig, WakeMode};

const ACTIONS: &str = "\
Actions:
  -boot                        create the region and start its driver
  -init                        like -boot, but join a running scheduler
  -term                        stop starting commands, wait for the driver, tear down
  -wait                        let every command finish, then tear down
  -status                      print one line per command
  -purge                       remove the region's IPC objects
  NAME=COMMAND [DEP...]        enqueue COMMAND, run after every DEP completes
  NAME COMMAND [DEP...]        same, with the command as its own argument

A NAME of \".\" makes the command unnamed: nothing can depend on it.";

#[derive(Parser)]
#[command(name = "shmsched")]
#[command(about = "Run shell commands in dependency order, shared between processes")]
#[command(version)]
#[command(after_help = ACTIONS)]
struct Cli {
    /// Number of command slots when creating a region
    #[arg(long, env = "SHMSCHED_SLOTS", default_value_t = DEFAULT_SLOTS)]
    slots: u32,

    /// Shell that runs each command as `<shell> -c <command>`
    #[arg(long, env = "SHMSCHED_SHELL", default_value = DEFAULT_SHELL)]
    shell: PathBuf,

    /// How the driver is woken: signal or placeholder
    #[arg(long, env = "SHMSCHED_WAKE", default_value_t = WakeMode::Signal)]
    wake: WakeMode,

    /// Seconds before a failed fork is retried
    #[arg(long, default_value_t = 1.0)]
    retry_secs: f64,

    /// With -term or -wait, print every command's final state
    #[arg(long)]
    report: bool,

    /// Log filter, in tracing-subscriber's EnvFilter syntax
    #[arg(long, env = LOG_ENV, default_value = DEFAULT_FILTER)]
    log: String,

    /// A path (turned into an IPC key with ftok) or a raw `0x` key
    token: String,

    /// What to do
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    action: Vec<String>,
}

impl Cli {
    fn config(&self) -> Result<SchedulerConfig> {
        let retry_interval = Duration::try_from_secs_f64(self.retry_secs).map_err(|err| {
            SchedError::Config(format!("retry interval {}: {err}", self.retry_secs))
        })?;
        let config = SchedulerConfig {
            slots: self.slots,
            shell: self.shell.clone(),
            wake: self.wake,
            retry_interval,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(Some(&cli.log));

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("shmsched: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let token = RegionToken::parse(&cli.token)?;
    let action = Action::parse(&cli.action)?;

    match action {
        Action::Boot => launched(client::boot(&token, &cli.config()?)?),
        Action::Init => launched(client::init(&token, &cli.config()?)?),
        Action::Terminate => shut_down(cli, &token, Shutdown::Terminate),
        Action::Wait => shut_down(cli, &token, Shutdown::Drain),
        Action::Status => {
            let (state, report) = client::status(&token)?;
            println!("{token}: {state}");
            for line in report {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Action::Purge => {
            if !client::purge(&token)? {
                tracing::info!(%token, "nothing to purge");
            }
            Ok(ExitCode::SUCCESS)
        }
        Action::Submit(spec) => {
            client::submit(&token, &spec)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Both sides of the driver fork come back through here.
fn launched(launched: Launched) -> Result<ExitCode> {
    match launched {
        Launched::Started { .. } | Launched::Joined => Ok(ExitCode::SUCCESS),
        Launched::Driver(result) => result.map(|_| ExitCode::SUCCESS),
    }
}

fn shut_down(cli: &Cli, token: &RegionToken, how: Shutdown) -> Result<ExitCode> {
    let report = client::shutdown(token, how)?;
    if cli.report {
        for line in report {
            println!("{line}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
