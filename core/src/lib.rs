//! Process supervision for an interactive assistant: launch commands, promote
//! slow ones to tracked background processes, mirror their output into durable
//! append-only logs, and expose watch/kill/stdin surfaces over simple IDs.

mod bridge;
mod error;
mod interrupt;
mod launcher;
mod output;
mod registry;
mod simple_id;
mod spawn;

pub use bridge::ControlCode;
pub use bridge::InteractiveBridge;
pub use error::Result;
pub use error::SupervisorError;
pub use interrupt::DEFAULT_GRACE_WINDOW;
pub use interrupt::InterruptCoordinator;
pub use interrupt::InterruptDecision;
pub use launcher::DEFAULT_SYNC_TIMEOUT;
pub use launcher::RunRequest;
pub use launcher::RunResult;
pub use launcher::Supervisor;
pub use output::DEFAULT_TAIL_CHARS;
pub use output::OutputChannel;
pub use output::OutputChunk;
pub use output::ProcessLog;
pub use output::clip_tail;
pub use registry::ProcessRecord;
pub use registry::ProcessRegistry;
pub use registry::ProcessStatus;
pub use simple_id::SimpleId;
