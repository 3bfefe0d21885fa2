//! Report interval throttle
//!
//! Data reads can land much faster than clients want reports. The throttle
//! sits between the data path and the event fan-out: new-data notifications
//! set a pending flag, and a timed worker releases at most one report per
//! arbitrated interval. A pending report is never dropped, only delayed
//! until the interval since the previous emission has elapsed.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Receiver of throttled report-due callbacks
///
/// Held weakly by the throttle worker so the throttle never keeps its
/// owner alive.
pub trait ReportSink: Send + Sync {
    /// A report interval has elapsed with data pending.
    fn report_due(&self);
}

struct ThrottleState {
    interval: Duration,
    last_report: Option<Instant>,
    pending: bool,
    active: bool,
    stopping: bool,
}

struct ThrottleShared {
    state: Mutex<ThrottleState>,
    wake: Notify,
}

/// Timed gate between sample arrival and report emission
pub struct ReportThrottle {
    shared: Arc<ThrottleShared>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReportThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(ThrottleShared {
                state: Mutex::new(ThrottleState {
                    interval,
                    last_report: None,
                    pending: false,
                    active: false,
                    stopping: false,
                }),
                wake: Notify::new(),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the throttle worker. Idempotent.
    pub async fn start(&self, sink: Weak<dyn ReportSink>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        {
            let mut state = self.shared.state.lock();
            state.active = true;
            state.stopping = false;
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(run(shared, sink)));
        debug!("Report throttle started");
    }

    /// Stop the throttle worker and wait for it to finish. Idempotent.
    ///
    /// After this returns no further report is emitted until the next
    /// [`start`](Self::start).
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            state.active = false;
            state.stopping = true;
        }
        self.shared.wake.notify_one();

        // Worker exits cooperatively on the stopping flag
        let _ = handle.await;
        debug!("Report throttle stopped");
    }

    /// Update the report interval. Takes effect at the next wake-up.
    pub fn set_report_interval(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        if state.interval != interval {
            debug!("Report interval set to {:?}", interval);
            state.interval = interval;
        }
    }

    /// Note that fresh data is available.
    ///
    /// Coalescing: any number of calls between emissions produces exactly
    /// one report. Notifications while stopped are remembered and released
    /// after the next start.
    pub fn notify_new_data(&self) {
        let active = {
            let mut state = self.shared.state.lock();
            state.pending = true;
            state.active
        };

        if active {
            self.shared.wake.notify_one();
        }
    }
}

async fn run(shared: Arc<ThrottleShared>, sink: Weak<dyn ReportSink>) {
    loop {
        // Decide how long to wait without holding the lock across awaits
        let deadline = {
            let state = shared.state.lock();
            if state.stopping {
                break;
            }

            if state.pending {
                let due = match state.last_report {
                    Some(last) => last + state.interval,
                    None => Instant::now(),
                };
                Some(due)
            } else {
                None
            }
        };

        match deadline {
            Some(due) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
            None => shared.wake.notified().await,
        }

        let emit = {
            let mut state = shared.state.lock();
            if state.stopping {
                break;
            }

            let elapsed = state
                .last_report
                .map_or(true, |last| last.elapsed() >= state.interval);

            if state.pending && elapsed {
                state.pending = false;
                state.last_report = Some(Instant::now());
                true
            } else {
                false
            }
        };

        if emit {
            let Some(sink) = sink.upgrade() else {
                break;
            };
            trace!("Releasing throttled report");
            sink.report_due();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSink {
        reports: AtomicUsize,
        stamps: Mutex<Vec<Instant>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reports: AtomicUsize::new(0),
                stamps: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.reports.load(Ordering::SeqCst)
        }
    }

    impl ReportSink for TestSink {
        fn report_due(&self) {
            self.reports.fetch_add(1, Ordering::SeqCst);
            self.stamps.lock().push(Instant::now());
        }
    }

    fn as_sink(sink: &Arc<TestSink>) -> Weak<dyn ReportSink> {
        let strong: Arc<dyn ReportSink> = Arc::clone(sink) as Arc<dyn ReportSink>;
        Arc::downgrade(&strong)
    }

    #[tokio::test]
    async fn test_first_report_released_immediately() {
        let throttle = ReportThrottle::new(Duration::from_millis(50));
        let sink = TestSink::new();
        let weak = Arc::downgrade(&(Arc::clone(&sink) as Arc<dyn ReportSink>));

        throttle.start(weak).await;
        throttle.notify_new_data();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.count(), 1);
        throttle.stop().await;
    }

    #[tokio::test]
    async fn test_reports_spaced_by_interval() {
        let interval = Duration::from_millis(40);
        let throttle = ReportThrottle::new(interval);
        let sink = TestSink::new();
        throttle.start(as_sink(&sink)).await;

        // Burst of notifications much faster than the interval
        for _ in 0..20 {
            throttle.notify_new_data();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(interval).await;
        throttle.stop().await;

        let stamps = sink.stamps.lock().clone();
        assert!(stamps.len() >= 2, "expected multiple reports");
        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= interval - Duration::from_millis(2),
                "reports {gap:?} apart, interval is {interval:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_report() {
        let throttle = ReportThrottle::new(Duration::from_millis(100));
        let sink = TestSink::new();
        throttle.start(as_sink(&sink)).await;

        for _ in 0..10 {
            throttle.notify_new_data();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.count(), 1);
        throttle.stop().await;
    }

    #[tokio::test]
    async fn test_no_emission_after_stop() {
        let throttle = ReportThrottle::new(Duration::from_millis(10));
        let sink = TestSink::new();
        throttle.start(as_sink(&sink)).await;

        throttle.notify_new_data();
        tokio::time::sleep(Duration::from_millis(20)).await;
        throttle.stop().await;
        let before = sink.count();

        throttle.notify_new_data();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.count(), before);
    }

    #[tokio::test]
    async fn test_pending_before_start_released_after_start() {
        let throttle = ReportThrottle::new(Duration::from_millis(10));
        let sink = TestSink::new();

        throttle.notify_new_data();
        throttle.start(as_sink(&sink)).await;
        // Worker picks the pending flag up on its first pass
        throttle.notify_new_data();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.count() >= 1);
        throttle.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let throttle = ReportThrottle::new(Duration::from_millis(10));
        let sink = TestSink::new();

        throttle.start(as_sink(&sink)).await;
        throttle.start(as_sink(&sink)).await;
        throttle.stop().await;
        throttle.stop().await;
    }
}
