//! Connection liveness timers: connect timeout, heartbeat and backoff-bounded
//! reconnection scheduling.
//!
//! [`ConnectionReliability`] does no transport I/O. It is driven by callables
//! the caller injects ("am I connected", "send a probe", "try to reconnect"),
//! so the timing logic can be exercised without a network. Each timer kind has
//! at most one live task; starting a timer aborts its same-kind predecessor.
//!
//! All `start_*` methods spawn onto the current tokio runtime.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::HandlerError;
use crate::registry::Service;

/// Smallest heartbeat period accepted; tokio rejects a zero interval.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Delay before reconnection attempt `attempt` (1-based):
/// `min(base * 2^(attempt - 1), max)`.
///
/// Attempt 0 is treated as attempt 1. Overflow saturates at `max`.
///
/// ```
/// use std::time::Duration;
/// use round_client::reliability::backoff_delay;
///
/// let base = Duration::from_millis(1000);
/// let max = Duration::from_millis(30_000);
/// assert_eq!(backoff_delay(5, base, max), Duration::from_millis(16_000));
/// assert_eq!(backoff_delay(6, base, max), max);
/// ```
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Reconnection backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed before giving up. Enforced by the caller.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }

    /// Returns `true` if `attempt` (1-based) is within `max_attempts`.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// A cancellable timer slot holding at most one task.
#[derive(Default)]
struct TimerSlot(Mutex<Option<AbortHandle>>);

impl TimerSlot {
    /// Abort the current task, if any, and install the one `spawn` returns.
    fn replace(&self, spawn: impl FnOnce() -> AbortHandle) {
        let mut slot = self.0.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(spawn());
    }

    fn cancel(&self) {
        if let Some(previous) = self.0.lock().take() {
            previous.abort();
        }
    }

    fn is_pending(&self) -> bool {
        self.0
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Owner of the connection timers and the connection runtime bookkeeping.
#[derive(Default)]
pub struct ConnectionReliability {
    connected: AtomicBool,
    recovery_attempt: AtomicU32,
    timeout: TimerSlot,
    heartbeat: TimerSlot,
    recovery: TimerSlot,
}

impl ConnectionReliability {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connection timeout ──────────────────────────────────────────

    /// Call `on_timeout` once after `delay` unless cleared first.
    pub fn start_connection_timeout<F>(&self, delay: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timeout.replace(|| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                debug!(?delay, "reliability: connection timeout fired");
                on_timeout();
            })
            .abort_handle()
        });
    }

    pub fn clear_connection_timeout(&self) {
        self.timeout.cancel();
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    /// Every `interval`, call `emit_ping` if `is_connected` says so.
    ///
    /// The first tick happens one full interval after starting. Ticks while
    /// disconnected are skipped without error.
    pub fn start_heartbeat<C, P>(&self, interval: Duration, is_connected: C, emit_ping: P)
    where
        C: Fn() -> bool + Send + 'static,
        P: Fn() + Send + 'static,
    {
        let period = interval.max(MIN_HEARTBEAT_INTERVAL);
        self.heartbeat.replace(|| {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if is_connected() {
                        trace!("reliability: heartbeat");
                        emit_ping();
                    } else {
                        trace!("reliability: heartbeat skipped while disconnected");
                    }
                }
            })
            .abort_handle()
        });
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.cancel();
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Schedule `attempt_reconnect` after the backoff delay for `attempt`.
    ///
    /// If `is_connected` reports a live connection by the time the delay
    /// elapses, the attempt is skipped. Callers re-invoke this with an
    /// incremented `attempt` after each failure and stop once
    /// [`BackoffPolicy::allows`] returns `false`. Returns the scheduled delay.
    pub fn start_connection_recovery<C, R>(
        &self,
        attempt: u32,
        is_connected: C,
        attempt_reconnect: R,
        policy: &BackoffPolicy,
    ) -> Duration
    where
        C: Fn() -> bool + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        let delay = policy.delay_for(attempt);
        if !policy.allows(attempt) {
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                "reliability: scheduling recovery past the attempt limit"
            );
        }
        self.recovery_attempt.store(attempt, Ordering::Release);
        debug!(attempt, ?delay, "reliability: recovery scheduled");

        self.recovery.replace(|| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if is_connected() {
                    debug!(attempt, "reliability: already connected, skipping recovery");
                    return;
                }
                attempt_reconnect();
            })
            .abort_handle()
        });
        delay
    }

    pub fn clear_recovery_timer(&self) {
        self.recovery.cancel();
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        self.clear_connection_timeout();
        self.stop_heartbeat();
        self.clear_recovery_timer();
    }

    // ── Runtime bookkeeping ─────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a live connection: resets the attempt counter and cancels the
    /// connect timeout and any pending recovery.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.recovery_attempt.store(0, Ordering::Release);
        self.clear_connection_timeout();
        self.clear_recovery_timer();
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.stop_heartbeat();
    }

    /// The attempt number of the most recently scheduled recovery, 0 if none.
    pub fn recovery_attempt(&self) -> u32 {
        self.recovery_attempt.load(Ordering::Acquire)
    }

    /// The attempt number the next recovery should use.
    pub fn next_attempt(&self) -> u32 {
        self.recovery_attempt().saturating_add(1)
    }

    pub fn is_timeout_pending(&self) -> bool {
        self.timeout.is_pending()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.is_pending()
    }

    pub fn is_recovery_pending(&self) -> bool {
        self.recovery.is_pending()
    }
}

impl Service for ConnectionReliability {
    fn teardown(&self) -> Result<(), HandlerError> {
        self.stop_all();
        Ok(())
    }

    /// Unhealthy while a recovery is in progress.
    fn health(&self) -> Option<bool> {
        Some(self.is_connected() || self.recovery_attempt() == 0)
    }
}

impl fmt::Debug for ConnectionReliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionReliability")
            .field("connected", &self.is_connected())
            .field("recovery_attempt", &self.recovery_attempt())
            .field("timeout_pending", &self.is_timeout_pending())
            .field("heartbeat_running", &self.is_heartbeat_running())
            .field("recovery_pending", &self.is_recovery_pending())
            .finish()
    }
}

impl Drop for ConnectionReliability {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn backoff_schedule_doubles_and_clamps() {
        let policy = BackoffPolicy {
            base_delay: ms(1000),
            max_delay: ms(30_000),
            max_attempts: 6,
        };
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn backoff_handles_edges() {
        let base = ms(1000);
        let max = ms(30_000);
        assert_eq!(backoff_delay(0, base, max), base);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
        assert_eq!(backoff_delay(3, Duration::ZERO, max), Duration::ZERO);
    }

    #[test]
    fn policy_allows_up_to_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once() {
        let reliability = ConnectionReliability::new();
        let (count, bump) = counter();
        reliability.start_connection_timeout(ms(500), bump);
        assert!(reliability.is_timeout_pending());

        tokio::time::sleep(ms(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(ms(10_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!reliability.is_timeout_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timeout_never_fires() {
        let reliability = ConnectionReliability::new();
        let (count, bump) = counter();
        reliability.start_connection_timeout(ms(500), bump);
        reliability.clear_connection_timeout();
        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_timeout_replaces_previous() {
        let reliability = ConnectionReliability::new();
        let (count, bump) = counter();
        reliability.start_connection_timeout(ms(500), bump.clone());
        reliability.start_connection_timeout(ms(500), bump);
        tokio::time::sleep(ms(2_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_only_while_connected() {
        let reliability = ConnectionReliability::new();
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let (pings, bump) = counter();
        reliability.start_heartbeat(ms(100), move || flag.load(Ordering::SeqCst), bump);

        tokio::time::sleep(ms(50)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 0, "no tick before one interval");
        tokio::time::sleep(ms(260)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 3);

        connected.store(false, Ordering::SeqCst);
        tokio::time::sleep(ms(300)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 3);

        reliability.stop_heartbeat();
        assert!(!reliability.is_heartbeat_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_heartbeat_keeps_one_timer() {
        let reliability = ConnectionReliability::new();
        let (pings, bump) = counter();
        reliability.start_heartbeat(ms(100), || true, bump.clone());
        reliability.start_heartbeat(ms(100), || true, bump);
        tokio::time::sleep(ms(150)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_recovery_keeps_one_timer() {
        let reliability = ConnectionReliability::new();
        let (attempts, bump) = counter();
        let policy = BackoffPolicy::default();
        reliability.start_connection_recovery(1, || false, bump.clone(), &policy);
        reliability.start_connection_recovery(1, || false, bump, &policy);
        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_skips_when_already_connected() {
        let reliability = ConnectionReliability::new();
        let (attempts, bump) = counter();
        reliability.start_connection_recovery(1, || true, bump, &BackoffPolicy::default());
        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_reschedules_with_doubled_delay() {
        let reliability = Arc::new(ConnectionReliability::new());
        let policy = BackoffPolicy::default();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        // Attempt 1; on firing, the "reconnect" fails and attempt 2 is scheduled.
        let again = Arc::clone(&reliability);
        let log = Arc::clone(&fired);
        let delay = reliability.start_connection_recovery(
            reliability.next_attempt(),
            || false,
            move || {
                log.lock().push(start.elapsed());
                let log = Arc::clone(&log);
                again.start_connection_recovery(
                    again.next_attempt(),
                    || false,
                    move || log.lock().push(start.elapsed()),
                    &BackoffPolicy::default(),
                );
            },
            &policy,
        );
        assert_eq!(delay, ms(1_000));

        tokio::time::sleep(ms(3_500)).await;
        let fired = fired.lock().clone();
        assert_eq!(fired.len(), 2);
        assert!(fired[0] >= ms(1_000) && fired[0] < ms(1_100));
        assert!(fired[1] >= ms(3_000) && fired[1] < ms(3_100));
        assert_eq!(reliability.recovery_attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_connected_resets_and_cancels() {
        let reliability = ConnectionReliability::new();
        let (count, bump) = counter();
        reliability.start_connection_timeout(ms(100), bump.clone());
        reliability.start_connection_recovery(3, || false, bump, &BackoffPolicy::default());
        assert_eq!(reliability.recovery_attempt(), 3);
        assert_eq!(reliability.health(), Some(false));

        reliability.mark_connected();
        assert!(reliability.is_connected());
        assert_eq!(reliability.recovery_attempt(), 0);
        assert_eq!(reliability.health(), Some(true));

        tokio::time::sleep(ms(10_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
