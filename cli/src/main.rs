use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use overseer_core::DEFAULT_TAIL_CHARS;
use overseer_core::InterruptCoordinator;
use overseer_core::InterruptDecision;
use overseer_core::ProcessRecord;
use overseer_core::RunRequest;
use overseer_core::RunResult;
use overseer_core::Supervisor;
use overseer_core::clip_tail;
use tracing::info;

#[derive(Parser)]
#[command(name = "overseer", about = "Run, track, and watch background processes", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a command; promotes to background tracking if it outlives the
    /// synchronous window.
    Run(RunArgs),
    /// List tracked processes, newest first.
    Ps,
    /// Attach a live key-driven view to a process (most recent by default).
    Watch {
        /// Simple id or pid.
        reference: Option<String>,
    },
    /// Terminate a process (most recent by default).
    Kill {
        /// Simple id or pid.
        reference: Option<String>,
        /// Skip the polite termination attempt.
        #[arg(long)]
        force: bool,
    },
    /// Send a line of input to an interactive process.
    Send {
        /// Simple id or pid.
        reference: String,
        text: String,
    },
    /// Drop a finished process's record and log, or sweep stale ones.
    Purge {
        /// Simple id or pid.
        reference: Option<String>,
        /// Apply the retention policy to all terminal records.
        #[arg(long)]
        sweep: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Working directory for the command.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Skip the synchronous wait and background immediately.
    #[arg(long)]
    long_running: bool,
    /// Run on an interactive surface with stdin forwarding.
    #[arg(short, long)]
    interactive: bool,
    /// Seconds to wait before promoting to the background.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    /// Kill the process after this many seconds.
    #[arg(long)]
    hard_timeout: Option<u64>,
    /// The shell command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let supervisor = Supervisor::open_default()?;

    match cli.command {
        Command::Run(args) => run_command(&supervisor, args).await,
        Command::Ps => {
            print_table(&supervisor.registry().list());
            Ok(())
        }
        Command::Watch { reference } => {
            let record = supervisor.resolve(reference.as_deref())?;
            overseer_tui::run_watch(&supervisor, record.simple_id).await
        }
        Command::Kill { reference, force } => {
            let record = supervisor.resolve(reference.as_deref())?;
            supervisor.kill(record.simple_id, force).await?;
            println!("{} terminated", record.simple_id);
            Ok(())
        }
        Command::Send { reference, text } => {
            let record = supervisor.resolve(Some(&reference))?;
            supervisor.bridge().send_line(record.simple_id, &text).await?;
            Ok(())
        }
        Command::Purge { reference, sweep } => {
            if sweep {
                let removed = supervisor.sweep();
                println!("swept {removed} record(s)");
                return Ok(());
            }
            let Some(reference) = reference else {
                anyhow::bail!("purge needs a process reference or --sweep");
            };
            let record = supervisor.resolve(Some(&reference))?;
            let purged = supervisor.purge(record.simple_id)?;
            println!("{} purged", purged.simple_id);
            Ok(())
        }
    }
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_command(supervisor: &Supervisor, args: RunArgs) -> anyhow::Result<()> {
    let mut request = RunRequest::new(args.command.join(" "));
    request.cwd = args.cwd;
    request.is_long_running = args.long_running;
    request.interactive = args.interactive;
    request.sync_timeout = Duration::from_secs(args.timeout);
    request.hard_timeout = args.hard_timeout.map(Duration::from_secs);

    // First Ctrl-C cancels the launch, a quick second one exits.
    let stamp_path = supervisor.home().join("autosave.stamp");
    let coordinator = Arc::new(InterruptCoordinator::new(move || {
        if let Err(err) = std::fs::write(&stamp_path, chrono::Utc::now().to_rfc3339()) {
            info!("autosave stamp failed: {err}");
        }
    }));
    let step = coordinator.begin_step();
    tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                match coordinator.on_interrupt() {
                    InterruptDecision::CancelStep => {
                        eprintln!("interrupted; press Ctrl-C again to exit");
                    }
                    InterruptDecision::ExitApplication => std::process::exit(130),
                }
            }
        }
    });

    let result = tokio::select! {
        result = supervisor.run(request) => result?,
        _ = step.cancelled() => {
            eprintln!("launch cancelled");
            return Ok(());
        }
    };

    match result {
        RunResult::Completed {
            exit_code,
            captured_text,
        } => {
            print!("{}", completed_excerpt(&captured_text));
            let code = exit_code.unwrap_or(-1);
            if code != 0 {
                std::process::exit(code.clamp(1, 255));
            }
            Ok(())
        }
        RunResult::Running {
            simple_id,
            captured_text,
        } => {
            print!("{}", clip_tail(&captured_text, DEFAULT_TAIL_CHARS, simple_id));
            if !captured_text.ends_with('\n') && !captured_text.is_empty() {
                println!();
            }
            println!("[{simple_id}] running in the background; `overseer watch {simple_id}` to follow");
            Ok(())
        }
        RunResult::Interactive { simple_id } => {
            println!("[{simple_id}] interactive; attaching monitor");
            overseer_tui::run_watch(supervisor, simple_id).await
        }
    }
}

fn print_table(records: &[ProcessRecord]) {
    if records.is_empty() {
        println!("no tracked processes");
        return;
    }
    println!("{:<6} {:<8} {:<10} {:<12} COMMAND", "ID", "PID", "ELAPSED", "STATUS");
    for record in records {
        let elapsed = chrono::Utc::now()
            .signed_duration_since(record.start_time)
            .num_seconds()
            .max(0);
        println!(
            "{:<6} {:<8} {:<10} {:<12} {}",
            record.simple_id,
            record.native_pid,
            format_elapsed(elapsed),
            record.status.label(),
            record.preview,
        );
    }
}

/// Bound how much of a completed command's output is echoed back. The
/// record and log are gone by now, so there is no watch target to point at,
/// just a note about what was cut.
fn completed_excerpt(captured: &str) -> String {
    let total = captured.chars().count();
    if total <= DEFAULT_TAIL_CHARS {
        return captured.to_string();
    }
    let omitted = total - DEFAULT_TAIL_CHARS;
    let tail: String = captured.chars().skip(omitted).collect();
    format!("[{omitted} earlier characters omitted]\n{tail}")
}

fn format_elapsed(seconds: i64) -> String {
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {:02}s", s / 60, s % 60),
        s => format!("{}h {:02}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn elapsed_rounds_to_largest_unit() {
        assert_eq!(format_elapsed(12), "12s");
        assert_eq!(format_elapsed(185), "3m 05s");
        assert_eq!(format_elapsed(4320), "1h 12m");
    }

    #[test]
    fn completed_output_is_clipped_to_the_tail() {
        assert_eq!(completed_excerpt("short output\n"), "short output\n");

        let long = "x".repeat(DEFAULT_TAIL_CHARS + 25);
        let clipped = completed_excerpt(&long);
        assert!(clipped.starts_with("[25 earlier characters omitted]\n"));
        assert!(clipped.ends_with(&"x".repeat(DEFAULT_TAIL_CHARS)));
    }
}
