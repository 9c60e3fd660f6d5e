use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::launcher::SupervisorInner;
use crate::simple_id::SimpleId;

/// Control bytes that can be injected into an interactive process, mirroring
/// what a terminal would send for the corresponding keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-D.
    Eof,
    /// Ctrl-Z.
    Suspend,
}

impl ControlCode {
    fn byte(self) -> u8 {
        match self {
            ControlCode::Interrupt => 0x03,
            ControlCode::Eof => 0x04,
            ControlCode::Suspend => 0x1a,
        }
    }
}

/// Input side of an interactive process: lines and control bytes flow in,
/// the output channel carries everything that comes back.
#[derive(Clone)]
pub struct InteractiveBridge {
    inner: Arc<SupervisorInner>,
}

impl InteractiveBridge {
    pub(crate) fn new(inner: Arc<SupervisorInner>) -> Self {
        Self { inner }
    }

    fn stdin_of(&self, simple_id: SimpleId) -> Result<tokio::sync::mpsc::Sender<Vec<u8>>> {
        let record = self
            .inner
            .registry
            .get(simple_id)
            .ok_or_else(|| SupervisorError::not_found(simple_id.to_string()))?;
        if record.status.is_terminal() || !record.is_interactive {
            return Err(SupervisorError::NotInteractive { simple_id });
        }
        self.inner
            .live_child(simple_id)
            .and_then(|live| live.stdin_tx.clone())
            .ok_or(SupervisorError::NotInteractive { simple_id })
    }

    /// Send one line of input. Any trailing newline in `text` is normalized
    /// to a single `\n` so callers cannot double-submit.
    pub async fn send_line(&self, simple_id: SimpleId, text: &str) -> Result<()> {
        let stdin = self.stdin_of(simple_id)?;
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let mut bytes = trimmed.as_bytes().to_vec();
        bytes.push(b'\n');
        debug!("forwarding {} byte(s) to {simple_id}", bytes.len());
        stdin
            .send(bytes)
            .await
            .map_err(|_| SupervisorError::NotInteractive { simple_id })
    }

    /// Send raw bytes with no newline handling.
    pub async fn send_raw(&self, simple_id: SimpleId, bytes: Vec<u8>) -> Result<()> {
        let stdin = self.stdin_of(simple_id)?;
        stdin
            .send(bytes)
            .await
            .map_err(|_| SupervisorError::NotInteractive { simple_id })
    }

    /// Inject a single control byte.
    pub async fn send_control(&self, simple_id: SimpleId, code: ControlCode) -> Result<()> {
        self.send_raw(simple_id, vec![code.byte()]).await
    }
}
