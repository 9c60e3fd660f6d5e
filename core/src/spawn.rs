use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::simple_id::SimpleId;

/// Environment marker stamped into every spawned process so self-invocations
/// can be detected down the tree.
pub(crate) const PROC_ID_ENV_VAR: &str = "OVERSEER_PROC_ID";

const READ_CHUNK_SIZE: usize = 8192;

/// Handle over a spawned process, uniform across the piped and PTY paths.
/// `output_rx` and `stdin_tx` are `None` when the platform surface cannot
/// capture or forward (detached console on Windows).
pub(crate) struct SurfaceChild {
    pub pid: u32,
    pub output_rx: Option<mpsc::Receiver<Vec<u8>>>,
    pub stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub wait: JoinHandle<Option<i32>>,
    #[cfg(unix)]
    pub killer: Option<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
}

fn shell_command(command_text: &str) -> Command {
    #[cfg(unix)]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_text);
        command
    }
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_text);
        command
    }
}

/// Spawn `command_text` through the platform shell with all three standard
/// streams piped. stdout and stderr feed a single aggregated channel so the
/// drain task observes one ordered stream.
pub(crate) fn spawn_piped(
    command_text: &str,
    cwd: &Path,
    simple_id: SimpleId,
) -> Result<SurfaceChild> {
    let mut command = shell_command(command_text);
    command
        .current_dir(cwd)
        .env(PROC_ID_ENV_VAR, simple_id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    // The shell forks for most commands; lead a fresh process group so
    // termination signals reach the whole tree, not just the shell.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|error| SupervisorError::spawn(command_text, error))?;
    let pid = child.id().unwrap_or(0);
    trace!("spawned `{command_text}` as pid {pid}");

    let (agg_tx, agg_rx) = mpsc::channel::<Vec<u8>>(128);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_reader(stdout, agg_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_reader(stderr, agg_tx.clone()));
    }
    drop(agg_tx);

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(128);
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(bytes) = stdin_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });
    }

    let wait = tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(_) => None,
        }
    });

    Ok(SurfaceChild {
        pid,
        output_rx: Some(agg_rx),
        stdin_tx: Some(stdin_tx),
        wait,
        #[cfg(unix)]
        killer: None,
    })
}

async fn pump_reader<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Spawn `command_text` on an interactive surface. On unix this is a PTY
/// with captured output and forwarded input; on Windows the process gets its
/// own console and runs uncaptured.
#[cfg(unix)]
pub(crate) fn spawn_interactive(
    command_text: &str,
    cwd: &Path,
    simple_id: SimpleId,
) -> Result<SurfaceChild> {
    use portable_pty::CommandBuilder;
    use portable_pty::PtySize;
    use portable_pty::native_pty_system;
    use std::io::ErrorKind;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    fn as_spawn_error<E: std::fmt::Display>(command_text: &str) -> impl Fn(E) -> SupervisorError + '_ {
        move |err| SupervisorError::spawn(command_text, std::io::Error::other(err.to_string()))
    }
    let as_spawn_error = as_spawn_error(command_text);

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(&as_spawn_error)?;

    let mut builder = CommandBuilder::new("sh");
    builder.arg("-c");
    builder.arg(command_text);
    builder.cwd(cwd);
    builder.env(PROC_ID_ENV_VAR, simple_id.to_string());

    let mut child = pair.slave.spawn_command(builder).map_err(&as_spawn_error)?;
    let pid = child.process_id().unwrap_or(0);
    let killer = child.clone_killer();

    let (agg_tx, agg_rx) = mpsc::channel::<Vec<u8>>(128);
    let mut reader = pair.master.try_clone_reader().map_err(&as_spawn_error)?;
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if agg_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let writer = pair.master.take_writer().map_err(&as_spawn_error)?;
    let writer = Arc::new(StdMutex::new(writer));
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(128);
    tokio::spawn(async move {
        // The master half must stay open for the writer's lifetime.
        let _master = pair.master;
        while let Some(bytes) = stdin_rx.recv().await {
            let writer = Arc::clone(&writer);
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = writer.lock() {
                    use std::io::Write;
                    let _ = guard.write_all(&bytes);
                    let _ = guard.flush();
                }
            })
            .await;
        }
    });

    let wait = tokio::task::spawn_blocking(move || {
        child
            .wait()
            .ok()
            .map(|status| status.exit_code() as i32)
    });

    Ok(SurfaceChild {
        pid,
        output_rx: Some(agg_rx),
        stdin_tx: Some(stdin_tx),
        wait,
        killer: Some(killer),
    })
}

/// Windows interactive surface: a fresh console window and no capture, so
/// the process owns its own input and display.
#[cfg(windows)]
pub(crate) fn spawn_interactive(
    command_text: &str,
    cwd: &Path,
    simple_id: SimpleId,
) -> Result<SurfaceChild> {
    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

    let mut command = shell_command(command_text);
    command
        .current_dir(cwd)
        .env(PROC_ID_ENV_VAR, simple_id.to_string())
        .creation_flags(CREATE_NEW_CONSOLE);

    let mut child = command
        .spawn()
        .map_err(|error| SupervisorError::spawn(command_text, error))?;
    let pid = child.id().unwrap_or(0);

    let wait = tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(_) => None,
        }
    });

    Ok(SurfaceChild {
        pid,
        output_rx: None,
        stdin_tx: None,
        wait,
    })
}

/// Tracked children lead their own process group (piped spawns via
/// `process_group(0)`, PTY spawns via the pty's setsid), so signal the
/// group to reach forked grandchildren; fall back to the bare pid when the
/// group is already gone.
#[cfg(unix)]
fn signal_tree(pid: u32, signal: libc::c_int) {
    let pgid = pid as libc::pid_t;
    if unsafe { libc::killpg(pgid, signal) } != 0 {
        unsafe {
            libc::kill(pgid, signal);
        }
    }
}

/// Ask `pid`'s tree to exit. SIGTERM on unix, plain `taskkill` on Windows.
#[cfg(unix)]
pub(crate) fn terminate_graceful(pid: u32) {
    signal_tree(pid, libc::SIGTERM);
}

#[cfg(windows)]
pub(crate) fn terminate_graceful(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

/// Force-kill `pid`'s tree. SIGKILL on unix; `taskkill /F /T` on Windows so
/// the whole console tree goes down with it.
#[cfg(unix)]
pub(crate) fn terminate_forced(pid: u32) {
    signal_tree(pid, libc::SIGKILL);
}

#[cfg(windows)]
pub(crate) fn terminate_forced(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output();
}
