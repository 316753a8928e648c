/// Start-slot scheduling: staggers the start of concurrent test cases that
/// each stand up their own cluster, so they do not all boot at once.
///
/// One scheduler is built per test run and shared by reference. Only the
/// read-last/compute/append step runs under the lock; the sleep does not.
use crate::config::SchedulerConfig;
use crate::reporter::Reporter;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Whether test cases run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    /// Cases share one host-level cluster and run one at a time.
    Serial,
}

impl ExecutionMode {
    pub fn is_parallel(self) -> bool {
        self == ExecutionMode::Parallel
    }
}

#[derive(Debug)]
pub struct StartSlotScheduler {
    mode: ExecutionMode,
    offset: Duration,
    /// Every wake-up handed out so far; non-decreasing.
    wake_times: Mutex<Vec<Instant>>,
}

impl StartSlotScheduler {
    pub fn new(mode: ExecutionMode, offset: Duration) -> Self {
        Self {
            mode,
            offset,
            wake_times: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        let mode = if config.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Serial
        };
        Self::new(mode, config.start_offset())
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Assign the next wake time: `max(now, last + offset)`.
    fn reserve_slot(&self) -> Instant {
        let mut wake_times = match self.wake_times.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let wakeup = match wake_times.last() {
            // Ignore the next slot if it is in the past; `now` still keeps
            // the offset for whoever comes after us.
            Some(&last) => (last + self.offset).max(now),
            None => now,
        };
        wake_times.push(wakeup);
        wakeup
    }

    /// Block until it is this caller's turn to start.
    ///
    /// Returns the assigned wake time, or `None` in serial mode where no
    /// spacing is needed.
    pub async fn wait_for_start_slot(&self, reporter: &dyn Reporter) -> Option<Instant> {
        if !self.mode.is_parallel() {
            return None;
        }

        let wakeup = self.reserve_slot();
        let now = Instant::now();
        if now < wakeup {
            let d = wakeup - now;
            let at = chrono::Local::now()
                + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
            reporter.log(&format!(
                "Waiting for start slot at {} (sleeping {:?}) ...",
                at.format("%H:%M:%S%.3f"),
                d
            ));
            tokio::time::sleep_until(wakeup).await;
        } else {
            reporter.log(&format!(
                "No need to wait for start slot, it is already {}",
                chrono::Local::now().format("%H:%M:%S%.3f")
            ));
        }
        Some(wakeup)
    }

    /// Snapshot of every wake time assigned so far, in assignment order.
    pub fn scheduled(&self) -> Vec<Instant> {
        match self.wake_times.lock() {
            Ok(w) => w.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemoryReporter;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_serial_mode_is_noop() {
        let scheduler = StartSlotScheduler::new(ExecutionMode::Serial, Duration::from_secs(30));
        let reporter = MemoryReporter::new();
        assert!(scheduler.wait_for_start_slot(&reporter).await.is_none());
        assert!(scheduler.wait_for_start_slot(&reporter).await.is_none());
        assert!(scheduler.scheduled().is_empty());
        assert!(reporter.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_caller_starts_immediately() {
        let scheduler = StartSlotScheduler::new(ExecutionMode::Parallel, Duration::from_secs(30));
        let reporter = MemoryReporter::new();
        let start = Instant::now();
        let wake = scheduler.wait_for_start_slot(&reporter).await.unwrap();
        assert_eq!(wake, start);
        assert!(reporter.contains("No need to wait for start slot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_caller_sleeps_for_offset() {
        let scheduler = StartSlotScheduler::new(ExecutionMode::Parallel, Duration::from_secs(30));
        let reporter = MemoryReporter::new();
        let start = Instant::now();
        scheduler.wait_for_start_slot(&reporter).await;
        scheduler.wait_for_start_slot(&reporter).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_millis(30_050));
        assert!(reporter.contains("Waiting for start slot at"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_slot_is_ignored() {
        let scheduler = StartSlotScheduler::new(ExecutionMode::Parallel, Duration::from_secs(5));
        let reporter = MemoryReporter::new();
        scheduler.wait_for_start_slot(&reporter).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let before = Instant::now();
        let wake = scheduler.wait_for_start_slot(&reporter).await.unwrap();
        assert_eq!(wake, before);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_spaced_by_offset() {
        let offset = Duration::from_secs(10);
        let scheduler = Arc::new(StartSlotScheduler::new(ExecutionMode::Parallel, offset));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let reporter = MemoryReporter::new();
                let wake = scheduler.wait_for_start_slot(&reporter).await.unwrap();
                (wake, Instant::now())
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        for (wake, woke_at) in &results {
            assert!(woke_at >= wake);
        }

        let scheduled = scheduler.scheduled();
        assert_eq!(scheduled.len(), 8);
        for pair in scheduled.windows(2) {
            assert!(pair[1] - pair[0] >= offset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_callers_do_not_hold_the_lock() {
        let scheduler = Arc::new(StartSlotScheduler::new(
            ExecutionMode::Parallel,
            Duration::from_secs(60),
        ));
        for _ in 0..3 {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let reporter = MemoryReporter::new();
                scheduler.wait_for_start_slot(&reporter).await;
            });
        }
        // Well before the second slot, all three reservations exist.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.scheduled().len(), 3);
    }

    #[test]
    fn test_from_config() {
        let scheduler = StartSlotScheduler::from_config(&SchedulerConfig {
            start_offset_ms: 1500,
            parallel: false,
        });
        assert_eq!(scheduler.mode(), ExecutionMode::Serial);
        assert_eq!(scheduler.offset(), Duration::from_millis(1500));
    }
}
