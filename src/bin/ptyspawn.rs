//! ptyspawn - run a program on a fresh PTY
//!
//! Relays stdin to the PTY master and the master's output to stdout until
//! the terminal reports EOF, then prints how the child ended and exits with
//! its status (128 + signal number when it was killed). Interrupt,
//! termination, hangup and quit signals sent to ptyspawn are forwarded to
//! the child.

use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use nix::sys::signal::Signal;
use ptyspawn::config::{CliArgs, Config, ReportFormat};
use ptyspawn::{open_pty, ChildProcess, Notifier, NotifierMode, PtyMaster, TerminationReport};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ptyspawn: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(&config, &args.command) {
        Ok(child) => {
            print_report(&child, config.report);
            let status = child.state().shell_status().unwrap_or(1);
            ExitCode::from(u8::try_from(status).unwrap_or(u8::MAX))
        }
        Err(e) => {
            eprintln!("ptyspawn: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config, command: &[String]) -> ptyspawn::Result<ChildProcess> {
    let (master, slave_path) = open_pty()?.into_parts();
    let request = config.spawn_request(command, slave_path)?;

    let notifier = Notifier::new(NotifierMode::Listener)?;
    let child = notifier.spawn(&request)?;
    tracing::info!(
        "Spawned {} as pid {} on {}",
        command.join(" "),
        child.pid(),
        request.controlling_tty()
    );

    let forwarder = SignalForwarder::start(child)?;

    let master = Arc::new(master);
    let input = Arc::clone(&master);
    // Detached: a blocking read on stdin cannot be interrupted
    thread::spawn(move || relay_input(&input));

    relay_output(&master)?;
    let done = notifier.wait(child.pid());
    forwarder.stop();
    done
}

/// Relays signals aimed at ptyspawn to the child while it runs
struct SignalForwarder {
    handle: Handle,
    thread: thread::JoinHandle<()>,
}

impl SignalForwarder {
    fn start(child: ChildProcess) -> ptyspawn::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("ptyspawn-forward".to_string())
            .spawn(move || {
                for raw in signals.forever() {
                    let Ok(signal) = Signal::try_from(raw) else {
                        continue;
                    };
                    match child.signal(signal) {
                        Ok(()) => tracing::debug!("Forwarded {} to pid {}", signal, child.pid()),
                        Err(e) => tracing::warn!("Failed to forward {}: {}", signal, e),
                    }
                }
            })?;
        Ok(Self { handle, thread })
    }

    fn stop(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}

fn relay_input(master: &PtyMaster) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if master.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Copy terminal output to stdout until every slave handle is closed
fn relay_output(master: &PtyMaster) -> io::Result<()> {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match master.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn print_report(child: &ChildProcess, format: ReportFormat) {
    let report = TerminationReport::from(child);
    match format {
        ReportFormat::Text => eprintln!("ptyspawn: child {} {}", report.pid, report.state),
        ReportFormat::Json => match serde_json::to_string(&report) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("ptyspawn: failed to encode report: {}", e),
        },
    }
}
