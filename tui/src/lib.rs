//! Terminal front end for supervised processes: a key-driven live view over
//! a process's output stream, with pause, kill, and interactive hand-off.

mod watch;

pub use watch::WatchAction;
pub use watch::WatchController;
pub use watch::WatchState;
pub use watch::run_watch;
