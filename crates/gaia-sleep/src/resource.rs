//! Host load sampling and distracted detection.
//!
//! The monitor samples a [`UtilizationProbe`] on a fixed cadence and
//! latches "distracted" once peak utilization stays above the threshold
//! for the sustain window. The latch is only released by
//! [`check_and_clear`](ResourceMonitor::check_and_clear), which requires
//! three consecutive quiet samples.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Source of a peak utilization percentage (GPU or CPU, whichever is
/// higher). Injected so hosts without accelerators and tests can supply
/// their own.
pub trait UtilizationProbe: Send + Sync {
    /// Current peak utilization in percent, or None if unavailable.
    fn sample(&self) -> Option<f32>;
}

/// Default probe: 1-minute load average from `/proc/loadavg`, scaled by
/// the CPU count into a rough busy percentage.
pub struct LoadAvgProbe;

impl UtilizationProbe for LoadAvgProbe {
    fn sample(&self) -> Option<f32> {
        let content = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load1: f32 = content.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;
        Some((load1 / cpus * 100.0).min(100.0))
    }
}

pub struct ResourceMonitor {
    probe: Arc<dyn UtilizationProbe>,
    distracted: AtomicBool,
    sustained_since: Mutex<Option<Instant>>,
    /// Peak utilization above this counts toward distraction.
    threshold_pct: f32,
    /// How long load must stay high before latching.
    sustain: Duration,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn UtilizationProbe>) -> Self {
        Self {
            probe,
            distracted: AtomicBool::new(false),
            sustained_since: Mutex::new(None),
            threshold_pct: 25.0,
            sustain: Duration::from_secs(5),
        }
    }

    pub fn with_thresholds(mut self, threshold_pct: f32, sustain: Duration) -> Self {
        self.threshold_pct = threshold_pct;
        self.sustain = sustain;
        self
    }

    /// Take one sample and update the sustained-load latch.
    pub fn poll_once(&self) {
        let Some(peak) = self.probe.sample() else {
            return;
        };

        let mut since = self.sustained_since.lock();
        if peak > self.threshold_pct {
            match *since {
                None => *since = Some(Instant::now()),
                Some(start) if start.elapsed() >= self.sustain => {
                    if !self.distracted.swap(true, Ordering::SeqCst) {
                        warn!(peak_pct = peak, "sustained load: entering distracted");
                    }
                }
                Some(_) => {}
            }
        } else {
            // Below threshold resets the sustain clock but does not
            // release the latch; check_and_clear owns that.
            *since = None;
        }
    }

    /// True once sustained load has been detected.
    pub fn is_distracted(&self) -> bool {
        self.distracted.load(Ordering::SeqCst)
    }

    /// Take 3 samples one second apart; release the latch only if all of
    /// them are below the threshold. Returns true if clear afterwards.
    pub async fn check_and_clear(&self) -> bool {
        if !self.is_distracted() {
            return true;
        }

        for i in 0..3 {
            let peak = self.probe.sample().unwrap_or(0.0);
            if peak > self.threshold_pct {
                debug!(sample = i, peak_pct = peak, "still distracted");
                return false;
            }
            if i < 2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        self.distracted.store(false, Ordering::SeqCst);
        *self.sustained_since.lock() = None;
        debug!("distraction cleared");
        true
    }

    /// Background sampling worker; runs until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once();
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Mutex<f32>);

    impl FixedProbe {
        fn new(pct: f32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(pct)))
        }

        fn set(&self, pct: f32) {
            *self.0.lock() = pct;
        }
    }

    impl UtilizationProbe for FixedProbe {
        fn sample(&self) -> Option<f32> {
            Some(*self.0.lock())
        }
    }

    fn fast_monitor(probe: Arc<FixedProbe>) -> ResourceMonitor {
        ResourceMonitor::new(probe).with_thresholds(25.0, Duration::from_millis(20))
    }

    #[test]
    fn test_not_distracted_below_threshold() {
        let probe = FixedProbe::new(10.0);
        let monitor = fast_monitor(probe);
        monitor.poll_once();
        assert!(!monitor.is_distracted());
    }

    #[test]
    fn test_single_spike_does_not_latch() {
        let probe = FixedProbe::new(80.0);
        let monitor = fast_monitor(probe.clone());
        monitor.poll_once();
        // Sustain window not yet elapsed.
        assert!(!monitor.is_distracted());
        probe.set(5.0);
        monitor.poll_once();
        assert!(!monitor.is_distracted());
    }

    #[test]
    fn test_sustained_load_latches() {
        let probe = FixedProbe::new(80.0);
        let monitor = fast_monitor(probe);
        monitor.poll_once();
        std::thread::sleep(Duration::from_millis(30));
        monitor.poll_once();
        assert!(monitor.is_distracted());
    }

    #[test]
    fn test_quiet_sample_does_not_release_latch() {
        let probe = FixedProbe::new(80.0);
        let monitor = fast_monitor(probe.clone());
        monitor.poll_once();
        std::thread::sleep(Duration::from_millis(30));
        monitor.poll_once();
        assert!(monitor.is_distracted());

        probe.set(5.0);
        monitor.poll_once();
        assert!(monitor.is_distracted());
    }

    #[tokio::test]
    async fn test_check_and_clear_when_quiet() {
        let probe = FixedProbe::new(80.0);
        let monitor = fast_monitor(probe.clone());
        monitor.poll_once();
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.poll_once();
        assert!(monitor.is_distracted());

        probe.set(5.0);
        assert!(monitor.check_and_clear().await);
        assert!(!monitor.is_distracted());
    }

    #[tokio::test]
    async fn test_check_and_clear_fails_while_loaded() {
        let probe = FixedProbe::new(80.0);
        let monitor = fast_monitor(probe);
        monitor.poll_once();
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.poll_once();

        // First sample is already above threshold: no 3-second wait.
        assert!(!monitor.check_and_clear().await);
        assert!(monitor.is_distracted());
    }

    #[tokio::test]
    async fn test_check_and_clear_noop_when_already_clear() {
        let probe = FixedProbe::new(5.0);
        let monitor = fast_monitor(probe);
        assert!(monitor.check_and_clear().await);
    }
}
