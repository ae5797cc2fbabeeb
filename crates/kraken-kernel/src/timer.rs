//! Software timers and delays on the Tokio clock.
//!
//! A [`SoftTimer`] owns at most one Tokio task. Arming spawns it, disarming
//! aborts it, and dropping the timer disarms it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kraken_types::KernelError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Callback fired on every timer expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Sleep the calling task for `ms` milliseconds.
pub async fn delay_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// A named one-shot or auto-reload timer.
pub struct SoftTimer {
    name: String,
    period: Duration,
    auto_reload: bool,
    callback: TimerCallback,
    task: Option<JoinHandle<()>>,
}

impl SoftTimer {
    /// Create a disarmed timer.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an empty name or a zero period.
    pub fn new(
        name: &str,
        period: Duration,
        auto_reload: bool,
        callback: TimerCallback,
    ) -> Result<Self, KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument("timer name is empty".into()));
        }
        if period.is_zero() {
            return Err(KernelError::InvalidArgument(format!(
                "timer '{name}' has a zero period"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            period,
            auto_reload,
            callback,
            task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_auto_reload(&self) -> bool {
        self.auto_reload
    }

    /// Arm the timer. An armed timer is restarted from zero.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] outside a Tokio runtime.
    pub fn start(&mut self) -> Result<(), KernelError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            KernelError::InvalidState(format!("timer '{}' needs a Tokio runtime", self.name))
        })?;
        self.stop();

        let name = self.name.clone();
        let period = self.period;
        let auto_reload = self.auto_reload;
        let callback = Arc::clone(&self.callback);
        self.task = Some(runtime.spawn(async move {
            if auto_reload {
                let mut ticks =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    trace!(timer = %name, "timer fired");
                    callback();
                }
            } else {
                tokio::time::sleep(period).await;
                trace!(timer = %name, "timer fired");
                callback();
            }
        }));
        debug!(
            timer = %self.name,
            period_ms = u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX),
            auto_reload,
            "timer armed"
        );
        Ok(())
    }

    /// Disarm the timer. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(timer = %self.name, "timer disarmed");
        }
    }

    /// `true` while the timer is armed and has not finished a one-shot run.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Disarm and release the timer.
    pub fn delete(mut self) {
        self.stop();
    }
}

impl Drop for SoftTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for SoftTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftTimer")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("auto_reload", &self.auto_reload)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        (count, Arc::new(move || {
            cb_count.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn invalid_timers_are_rejected() {
        let (_, cb) = counter();
        assert!(matches!(
            SoftTimer::new("", Duration::from_millis(10), false, Arc::clone(&cb)),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(matches!(
            SoftTimer::new("blink", Duration::ZERO, true, cb),
            Err(KernelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn start_outside_runtime_is_invalid_state() {
        let (_, cb) = counter();
        let mut timer = SoftTimer::new("blink", Duration::from_millis(10), false, cb).unwrap();
        assert!(matches!(timer.start(), Err(KernelError::InvalidState(_))));
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn one_shot_fires_once() {
        let (count, cb) = counter();
        let mut timer = SoftTimer::new("once", Duration::from_millis(10), false, cb).unwrap();
        timer.start().unwrap();
        assert!(timer.is_active());

        delay_ms(80).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn auto_reload_fires_until_stopped() {
        let (count, cb) = counter();
        let mut timer = SoftTimer::new("tick", Duration::from_millis(10), true, cb).unwrap();
        timer.start().unwrap();

        delay_ms(100).await;
        timer.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {fired} times");
        assert!(!timer.is_active());

        delay_ms(50).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
        timer.stop();
    }

    #[tokio::test]
    async fn stopped_before_expiry_never_fires() {
        let (count, cb) = counter();
        let mut timer = SoftTimer::new("late", Duration::from_millis(50), false, cb).unwrap();
        timer.start().unwrap();
        timer.stop();
        delay_ms(100).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_or_deleting_disarms() {
        let (count, cb) = counter();
        let mut deleted =
            SoftTimer::new("a", Duration::from_millis(20), true, Arc::clone(&cb)).unwrap();
        deleted.start().unwrap();
        deleted.delete();

        {
            let mut dropped = SoftTimer::new("b", Duration::from_millis(20), true, cb).unwrap();
            dropped.start().unwrap();
        }

        delay_ms(80).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
