use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Window after a first interrupt during which a second one exits the
/// application instead of cancelling another step.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(1500);

/// What the caller should do with an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDecision {
    /// Cancel the current step and keep the application alive.
    CancelStep,
    /// Second interrupt inside the grace window: shut down.
    ExitApplication,
}

struct InterruptState {
    armed_at: Option<Instant>,
    step: CancellationToken,
}

/// Double-interrupt coordinator: the first Ctrl-C cancels the in-flight
/// step, a second one within the grace window exits. The autosave hook runs
/// on every interrupt so no state is lost either way.
pub struct InterruptCoordinator {
    state: StdMutex<InterruptState>,
    grace: Duration,
    autosave: Box<dyn Fn() + Send + Sync>,
}

impl InterruptCoordinator {
    pub fn new(autosave: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_grace(DEFAULT_GRACE_WINDOW, autosave)
    }

    pub fn with_grace(grace: Duration, autosave: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: StdMutex::new(InterruptState {
                armed_at: None,
                step: CancellationToken::new(),
            }),
            grace,
            autosave: Box::new(autosave),
        }
    }

    fn locked(&self) -> MutexGuard<'_, InterruptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new step, returning its cancellation token. Any prior step
    /// token is superseded.
    pub fn begin_step(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.locked().step = token.clone();
        token
    }

    /// Handle one interrupt and say what the caller should do. The armed
    /// window is evaluated lazily, so an interrupt long after the previous
    /// one counts as a first interrupt again.
    pub fn on_interrupt(&self) -> InterruptDecision {
        let decision = {
            let mut state = self.locked();
            let within_grace = state
                .armed_at
                .is_some_and(|armed| armed.elapsed() <= self.grace);
            if within_grace {
                state.armed_at = None;
                InterruptDecision::ExitApplication
            } else {
                state.armed_at = Some(Instant::now());
                state.step.cancel();
                InterruptDecision::CancelStep
            }
        };
        match decision {
            InterruptDecision::CancelStep => debug!("interrupt: cancelling current step"),
            InterruptDecision::ExitApplication => warn!("second interrupt: shutting down"),
        }
        (self.autosave)();
        decision
    }

    /// Whether a first interrupt is still pending confirmation.
    pub fn is_armed(&self) -> bool {
        self.locked()
            .armed_at
            .is_some_and(|armed| armed.elapsed() <= self.grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn coordinator_with_counter(grace: Duration) -> (InterruptCoordinator, Arc<AtomicUsize>) {
        let saves = Arc::new(AtomicUsize::new(0));
        let hook_saves = Arc::clone(&saves);
        let coordinator = InterruptCoordinator::with_grace(grace, move || {
            hook_saves.fetch_add(1, Ordering::SeqCst);
        });
        (coordinator, saves)
    }

    #[test]
    fn first_interrupt_cancels_step_and_arms() {
        let (coordinator, saves) = coordinator_with_counter(Duration::from_secs(5));
        let token = coordinator.begin_step();
        assert!(!token.is_cancelled());

        assert_eq!(coordinator.on_interrupt(), InterruptDecision::CancelStep);
        assert!(token.is_cancelled());
        assert!(coordinator.is_armed());
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_interrupt_within_grace_exits() {
        let (coordinator, saves) = coordinator_with_counter(Duration::from_secs(5));
        coordinator.begin_step();
        assert_eq!(coordinator.on_interrupt(), InterruptDecision::CancelStep);
        assert_eq!(
            coordinator.on_interrupt(),
            InterruptDecision::ExitApplication
        );
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_armed());
    }

    #[test]
    fn stale_arm_reverts_to_first_interrupt() {
        let (coordinator, _) = coordinator_with_counter(Duration::from_millis(10));
        coordinator.begin_step();
        assert_eq!(coordinator.on_interrupt(), InterruptDecision::CancelStep);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!coordinator.is_armed());
        assert_eq!(coordinator.on_interrupt(), InterruptDecision::CancelStep);
    }

    #[test]
    fn begin_step_supersedes_previous_token() {
        let (coordinator, _) = coordinator_with_counter(Duration::from_secs(5));
        let first = coordinator.begin_step();
        let second = coordinator.begin_step();
        coordinator.on_interrupt();
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
