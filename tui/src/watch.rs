use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossterm::event::Event;
use crossterm::event::KeyCode;
use crossterm::event::KeyEventKind;
use crossterm::event::KeyModifiers;
use crossterm::terminal::disable_raw_mode;
use crossterm::terminal::enable_raw_mode;
use overseer_core::ControlCode;
use overseer_core::SimpleId;
use overseer_core::Supervisor;
use tokio::sync::mpsc;
use tracing::debug;

const MIN_REFRESH: Duration = Duration::from_millis(250);
const MAX_REFRESH: Duration = Duration::from_secs(5);
const REFRESH_STEP: Duration = Duration::from_millis(250);
const DEFAULT_REFRESH: Duration = Duration::from_secs(1);

/// Whether the monitor is streaming, holding, or done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Active,
    Paused,
    Terminated,
}

/// What the render loop should do in response to a keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    None,
    ClearViewport,
    StatusSnapshot,
    Kill { force: bool },
    EnterInteractive,
    Exit,
}

/// Pure keyboard dispatch for the watch view. Kept free of terminal I/O so
/// the bindings are testable.
pub struct WatchController {
    state: WatchState,
    refresh_interval: Duration,
    target_interactive: bool,
}

impl WatchController {
    pub fn new(target_interactive: bool) -> Self {
        Self {
            state: WatchState::Active,
            refresh_interval: DEFAULT_REFRESH,
            target_interactive,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn handle_key(&mut self, key: char) -> WatchAction {
        if self.state == WatchState::Terminated {
            return WatchAction::None;
        }
        match key {
            'p' => {
                self.state = match self.state {
                    WatchState::Active => WatchState::Paused,
                    WatchState::Paused | WatchState::Terminated => WatchState::Active,
                };
                WatchAction::None
            }
            'c' => WatchAction::ClearViewport,
            't' => WatchAction::StatusSnapshot,
            // Requesting a kill ends the watch session too.
            'k' => {
                self.state = WatchState::Terminated;
                WatchAction::Kill { force: false }
            }
            'f' => {
                self.state = WatchState::Terminated;
                WatchAction::Kill { force: true }
            }
            // Faster refresh.
            '+' | '=' => {
                self.refresh_interval =
                    (self.refresh_interval.saturating_sub(REFRESH_STEP)).max(MIN_REFRESH);
                WatchAction::None
            }
            // Slower refresh.
            '-' | '_' => {
                self.refresh_interval = (self.refresh_interval + REFRESH_STEP).min(MAX_REFRESH);
                WatchAction::None
            }
            'i' if self.target_interactive => WatchAction::EnterInteractive,
            'q' => {
                self.state = WatchState::Terminated;
                WatchAction::Exit
            }
            _ => WatchAction::None,
        }
    }
}

/// A keystroke as the watch loop sees it, decoupled from crossterm types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyIn {
    Char(char),
    Ctrl(char),
    Enter,
    Backspace,
}

struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> anyhow::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn spawn_key_reader(stop: Arc<AtomicBool>) -> mpsc::Receiver<KeyIn> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match crossterm::event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break,
            }
            let Ok(Event::Key(key)) = crossterm::event::read() else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let mapped = match key.code {
                KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    Some(KeyIn::Ctrl(c))
                }
                KeyCode::Char(c) => Some(KeyIn::Char(c)),
                KeyCode::Enter => Some(KeyIn::Enter),
                KeyCode::Backspace => Some(KeyIn::Backspace),
                _ => None,
            };
            if let Some(key) = mapped {
                if tx.blocking_send(key).is_err() {
                    break;
                }
            }
        }
    });
    rx
}

/// Raw-mode output: normalize bare line feeds so columns stay aligned.
fn write_chunk(out: &mut impl Write, bytes: &[u8]) {
    let mut start = 0;
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'\n' && (idx == 0 || bytes[idx - 1] != b'\r') {
            let _ = out.write_all(&bytes[start..idx]);
            let _ = out.write_all(b"\r\n");
            start = idx + 1;
        }
    }
    let _ = out.write_all(&bytes[start..]);
    let _ = out.flush();
}

fn statusline(out: &mut impl Write, text: &str) {
    let _ = write!(out, "\r\n[overseer] {text}\r\n");
    let _ = out.flush();
}

/// Attach a live, key-driven view to a tracked process. Streams new output
/// as it lands, and returns once the process reaches a terminal status or
/// the user quits.
pub async fn run_watch(supervisor: &Supervisor, simple_id: SimpleId) -> anyhow::Result<()> {
    let record = supervisor.resolve(Some(&simple_id.to_string()))?;
    let log = supervisor
        .log(simple_id)
        .ok_or_else(|| anyhow::anyhow!("no output log for {simple_id}"))?;
    let bridge = supervisor.bridge();
    let mut controller = WatchController::new(record.is_interactive);

    let _raw = RawModeGuard::enter()?;
    let stop = Arc::new(AtomicBool::new(false));
    let mut keys = spawn_key_reader(Arc::clone(&stop));

    let mut out = std::io::stdout();
    statusline(
        &mut out,
        &format!(
            "watching {simple_id} (pid {}): p pause, c clear, t status, k kill, f force-kill, +/- speed{}, q quit",
            record.native_pid,
            if record.is_interactive { ", i interact" } else { "" },
        ),
    );

    let mut offset = 0u64;
    // Replay everything captured so far before going live.
    let (backlog, next) = log.read_since(offset);
    for chunk in &backlog {
        write_chunk(&mut out, &chunk.bytes);
    }
    offset = next;

    // One interval for the whole session so keystrokes do not reset the
    // refresh clock; rebuilt only when +/- changes the period.
    let mut tick_period = controller.refresh_interval();
    let mut ticker = tokio::time::interval(tick_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick(), if controller.state() == WatchState::Active => {
                let (fresh, next) = log.read_since(offset);
                for chunk in &fresh {
                    write_chunk(&mut out, &chunk.bytes);
                }
                offset = next;

                if let Some(current) = supervisor.registry().get(simple_id) {
                    if current.status.is_terminal() {
                        // Drain whatever landed between the read and the
                        // status flip, then summarize.
                        let (last, _) = log.read_since(offset);
                        for chunk in &last {
                            write_chunk(&mut out, &chunk.bytes);
                        }
                        statusline(&mut out, &format!("{simple_id} {}", current.status.label()));
                        break;
                    }
                } else {
                    statusline(&mut out, &format!("{simple_id} is no longer tracked"));
                    break;
                }
            }
            key = keys.recv() => {
                let Some(key) = key else { break };
                let action = match key {
                    KeyIn::Char(c) => controller.handle_key(c),
                    KeyIn::Ctrl('c') => WatchAction::Exit,
                    _ => WatchAction::None,
                };
                match action {
                    WatchAction::None => {}
                    WatchAction::ClearViewport => {
                        use crossterm::ExecutableCommand;
                        let _ = out.execute(crossterm::terminal::Clear(
                            crossterm::terminal::ClearType::All,
                        ));
                        let _ = out.execute(crossterm::cursor::MoveTo(0, 0));
                    }
                    WatchAction::StatusSnapshot => {
                        if let Some(current) = supervisor.registry().get(simple_id) {
                            let elapsed = chrono::Utc::now()
                                .signed_duration_since(current.start_time)
                                .num_seconds();
                            statusline(&mut out, &format!(
                                "{simple_id} pid {} {} for {elapsed}s: {}",
                                current.native_pid,
                                current.status.label(),
                                current.preview,
                            ));
                        }
                    }
                    WatchAction::Kill { force } => {
                        statusline(&mut out, if force { "force-killing" } else { "killing" });
                        if let Err(err) = supervisor.kill(simple_id, force).await {
                            statusline(&mut out, &format!("kill failed: {err}"));
                        }
                        // The session is over; show what arrived and the
                        // final status before dropping out.
                        let (last, _) = log.read_since(offset);
                        for chunk in &last {
                            write_chunk(&mut out, &chunk.bytes);
                        }
                        if let Some(current) = supervisor.registry().get(simple_id) {
                            statusline(&mut out, &format!("{simple_id} {}", current.status.label()));
                        }
                        break;
                    }
                    WatchAction::EnterInteractive => {
                        statusline(
                            &mut out,
                            "interactive: type to send, Enter submits, Ctrl-] detaches",
                        );
                        interactive_loop(&bridge, simple_id, &log, &mut offset, &mut keys, &mut out)
                            .await;
                        statusline(&mut out, "detached");
                    }
                    WatchAction::Exit => {
                        statusline(&mut out, "stopped watching");
                        break;
                    }
                }
                if controller.refresh_interval() != tick_period {
                    tick_period = controller.refresh_interval();
                    ticker = tokio::time::interval(tick_period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    debug!("watch over {simple_id} ended");
    Ok(())
}

/// Line-buffered input loop layered over the live view. Keystrokes echo
/// locally, Enter submits the line, control chords forward as control bytes,
/// Ctrl-] drops back to the watch bindings.
async fn interactive_loop(
    bridge: &overseer_core::InteractiveBridge,
    simple_id: SimpleId,
    log: &Arc<overseer_core::ProcessLog>,
    offset: &mut u64,
    keys: &mut mpsc::Receiver<KeyIn>,
    out: &mut impl Write,
) {
    let mut line = String::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(MIN_REFRESH) => {
                let (fresh, next) = log.read_since(*offset);
                for chunk in &fresh {
                    write_chunk(out, &chunk.bytes);
                }
                *offset = next;
            }
            key = keys.recv() => {
                let Some(key) = key else { return };
                match key {
                    KeyIn::Ctrl(']') => return,
                    KeyIn::Ctrl('c') => {
                        let _ = bridge.send_control(simple_id, ControlCode::Interrupt).await;
                        line.clear();
                    }
                    KeyIn::Ctrl('d') => {
                        let _ = bridge.send_control(simple_id, ControlCode::Eof).await;
                    }
                    KeyIn::Ctrl('z') => {
                        let _ = bridge.send_control(simple_id, ControlCode::Suspend).await;
                    }
                    KeyIn::Ctrl(_) => {}
                    KeyIn::Enter => {
                        let _ = out.write_all(b"\r\n");
                        let _ = out.flush();
                        if bridge.send_line(simple_id, &line).await.is_err() {
                            return;
                        }
                        line.clear();
                    }
                    KeyIn::Backspace => {
                        if line.pop().is_some() {
                            let _ = out.write_all(b"\x08 \x08");
                            let _ = out.flush();
                        }
                    }
                    KeyIn::Char(c) => {
                        line.push(c);
                        let mut buf = [0u8; 4];
                        let _ = out.write_all(c.encode_utf8(&mut buf).as_bytes());
                        let _ = out.flush();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pause_toggles_and_holds_rendering() {
        let mut controller = WatchController::new(false);
        assert_eq!(controller.state(), WatchState::Active);
        assert_eq!(controller.handle_key('p'), WatchAction::None);
        assert_eq!(controller.state(), WatchState::Paused);
        assert_eq!(controller.handle_key('p'), WatchAction::None);
        assert_eq!(controller.state(), WatchState::Active);
    }

    #[test]
    fn refresh_interval_is_bounded() {
        let mut controller = WatchController::new(false);
        for _ in 0..50 {
            controller.handle_key('+');
        }
        assert_eq!(controller.refresh_interval(), MIN_REFRESH);
        for _ in 0..50 {
            controller.handle_key('-');
        }
        assert_eq!(controller.refresh_interval(), MAX_REFRESH);
    }

    #[test]
    fn kill_keys_map_to_escalation_levels_and_end_the_session() {
        let mut controller = WatchController::new(false);
        assert_eq!(controller.handle_key('k'), WatchAction::Kill { force: false });
        assert_eq!(controller.state(), WatchState::Terminated);

        let mut forced = WatchController::new(false);
        assert_eq!(forced.handle_key('f'), WatchAction::Kill { force: true });
        assert_eq!(forced.state(), WatchState::Terminated);
    }

    #[test]
    fn interactive_binding_requires_interactive_target() {
        let mut plain = WatchController::new(false);
        assert_eq!(plain.handle_key('i'), WatchAction::None);
        let mut interactive = WatchController::new(true);
        assert_eq!(interactive.handle_key('i'), WatchAction::EnterInteractive);
    }

    #[test]
    fn quit_terminates_and_ignores_further_keys() {
        let mut controller = WatchController::new(false);
        assert_eq!(controller.handle_key('q'), WatchAction::Exit);
        assert_eq!(controller.state(), WatchState::Terminated);
        assert_eq!(controller.handle_key('k'), WatchAction::None);
    }
}
