// Process-wide circuit breaker gating forward saga traffic

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Traffic is admitted
    Closed,
    /// Traffic is short-circuited
    Open,
    /// Probing: the next task decides whether to close or re-open
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures tolerated in `Closed` before the circuit opens
    pub max_consecutive_fails: u32,
    /// How long the circuit stays `Open` before probing with `HalfOpen`
    pub open_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_fails: 5,
            open_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    fails: u32,
}

/// Shared failure counter and state machine.
///
/// All mutation happens under one mutex. The transition out of `Open` is
/// driven by a dedicated watcher task: every transition into `Open` sends one
/// arming signal on a capacity-1 channel (duplicates are dropped, never
/// queued), the watcher sleeps `open_interval`, then moves the circuit to
/// `HalfOpen` and resets the counter.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    open_tx: mpsc::Sender<()>,
}

impl CircuitBreaker {
    /// Create a breaker and spawn its open-watcher task.
    ///
    /// Must be called from within a tokio runtime. The watcher exits once the
    /// breaker is dropped.
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        let (open_tx, open_rx) = mpsc::channel(1);

        let breaker = Arc::new(Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                fails: 0,
            }),
            open_tx,
        });

        tokio::spawn(open_watcher(Arc::downgrade(&breaker), open_rx));

        breaker
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Best-effort snapshot of the current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn fails(&self) -> u32 {
        self.inner.lock().expect("breaker mutex poisoned").fails
    }

    pub fn max_consecutive_fails(&self) -> u32 {
        self.config.max_consecutive_fails
    }

    /// Post-hook for a handler that completed without error.
    ///
    /// A success while `Open` is a short-circuited task, not a recovery
    /// signal, and leaves the circuit untouched.
    pub fn on_task_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == BreakerState::Open {
            return;
        }
        if inner.state == BreakerState::HalfOpen {
            info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.fails = 0;
    }

    /// Post-hook for a handler that returned an error.
    pub fn on_task_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.fail_locked(&mut inner);
    }

    /// Count a downstream failure observed outside the handler result
    /// (archived or expired forward task). Crossing the threshold opens the
    /// circuit atomically with the increment.
    pub fn increment_fails(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.fail_locked(&mut inner);
    }

    fn fail_locked(&self, inner: &mut BreakerInner) {
        match inner.state {
            // Tasks fail through while open; the watcher owns the exit.
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                warn!("circuit breaker re-opened: probe task failed");
                inner.state = BreakerState::Open;
                self.arm_open_watcher();
            }
            BreakerState::Closed => {
                inner.fails += 1;
                if inner.fails >= self.config.max_consecutive_fails {
                    warn!(
                        fails = inner.fails,
                        threshold = self.config.max_consecutive_fails,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    self.arm_open_watcher();
                }
            }
        }
    }

    fn arm_open_watcher(&self) {
        // try_send drops the signal when one is already pending; exactly one
        // timer per transition into Open.
        let _ = self.open_tx.try_send(());
    }
}

async fn open_watcher(breaker: Weak<CircuitBreaker>, mut open_rx: mpsc::Receiver<()>) {
    while open_rx.recv().await.is_some() {
        let Some(breaker) = breaker.upgrade() else {
            break;
        };
        tokio::time::sleep(breaker.config.open_interval).await;

        let mut inner = breaker.inner.lock().expect("breaker mutex poisoned");
        inner.state = BreakerState::HalfOpen;
        inner.fails = 0;
        info!("circuit breaker half-open, admitting probe traffic");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn fast_breaker(max_fails: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(CircuitBreakerConfig {
            max_consecutive_fails: max_fails,
            open_interval: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_starts_closed_with_zero_fails() {
        let cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.fails(), 0);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = fast_breaker(3);

        cb.on_task_failure();
        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.fails(), 2);

        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = fast_breaker(3);

        cb.on_task_failure();
        cb.on_task_failure();
        assert_eq!(cb.fails(), 2);

        cb.on_task_success();
        assert_eq!(cb.fails(), 0);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_while_open_leaves_state_unchanged() {
        let cb = fast_breaker(1);

        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        cb.on_task_success();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_after_open_interval() {
        let cb = fast_breaker(1);

        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.fails(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = fast_breaker(1);

        cb.on_task_failure();
        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // the re-open armed the watcher again
        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = fast_breaker(1);

        cb.on_task_failure();
        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.on_task_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.fails(), 0);
    }

    #[tokio::test]
    async fn test_watch_increment_crosses_threshold() {
        let cb = fast_breaker(2);

        cb.increment_fails();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.increment_fails();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_failures_while_open_do_not_stack_timers() {
        let cb = fast_breaker(1);

        cb.on_task_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // fail-throughs while open: no state change, no extra arming
        cb.on_task_failure();
        cb.on_task_failure();

        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // a single interval later the watcher must not fire again
        cb.on_task_success();
        sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
