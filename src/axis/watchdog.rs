//! Cooperative-loop watchdog.
//!
//! Samples scheduler loop latency on a fixed interval; when the observed
//! lag exceeds the block threshold it emits a diagnostic dump (process
//! memory, scheduler gauges, uptime) at warn level. Start and stop are
//! idempotent. Samples live in process memory only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::WatchdogConfig;

/// Live gauges sampled from the scheduler at dump time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerGauges {
    pub active_workers: usize,
    pub queued_jobs: usize,
}

/// Supplier of current gauges.
pub type GaugeSource = Arc<dyn Fn() -> SchedulerGauges + Send + Sync>;

/// Process memory snapshot from `/proc/self/status` (zeros elsewhere).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsage {
    pub rss_kb: u64,
    pub vsz_kb: u64,
}

/// One diagnostic dump, serialized into the warning event.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticDump {
    pub timestamp: String,
    pub event_loop_blocked_ms: u64,
    pub memory: MemoryUsage,
    pub active_workers: usize,
    pub queued_jobs: usize,
    pub uptime_secs: u64,
}

/// Loop-stall detector.
pub struct Watchdog {
    config: WatchdogConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
    dumps: Arc<AtomicUsize>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
            started_at: Instant::now(),
            dumps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start sampling. A second call while running is a no-op.
    pub fn start(&self, gauges: GaugeSource) {
        let mut handle = self.handle.lock().expect("watchdog lock");
        if handle.is_some() {
            return;
        }

        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let threshold = Duration::from_millis(self.config.block_threshold_ms);
        let started_at = self.started_at;
        let dumps = Arc::clone(&self.dumps);

        *handle = Some(tokio::spawn(async move {
            loop {
                let before = Instant::now();
                tokio::time::sleep(interval).await;
                let lag = before.elapsed().saturating_sub(interval);

                if lag > threshold {
                    let g = gauges();
                    let dump = DiagnosticDump {
                        timestamp: Utc::now().to_rfc3339(),
                        event_loop_blocked_ms: u64::try_from(lag.as_millis())
                            .unwrap_or(u64::MAX),
                        memory: read_memory_usage(),
                        active_workers: g.active_workers,
                        queued_jobs: g.queued_jobs,
                        uptime_secs: started_at.elapsed().as_secs(),
                    };
                    dumps.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        dump = %serde_json::to_string(&dump).unwrap_or_default(),
                        "scheduler loop blocked beyond threshold"
                    );
                }
            }
        }));
        tracing::info!(
            interval_ms = self.config.check_interval_ms,
            threshold_ms = self.config.block_threshold_ms,
            "watchdog started"
        );
    }

    /// Stop sampling. A second call, or stop before start, is a no-op.
    pub fn stop(&self) {
        let mut handle = self.handle.lock().expect("watchdog lock");
        if let Some(task) = handle.take() {
            task.abort();
            tracing::info!("watchdog stopped");
        }
    }

    /// True while the sampler task is running.
    pub fn is_running(&self) -> bool {
        self.handle.lock().expect("watchdog lock").is_some()
    }

    /// Dumps emitted so far (observability, tests).
    pub fn dumps_emitted(&self) -> usize {
        self.dumps.load(Ordering::Relaxed)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read RSS/VSZ from `/proc/self/status`; zeros when unavailable.
pub fn read_memory_usage() -> MemoryUsage {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return MemoryUsage::default();
    };

    let mut usage = MemoryUsage::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            usage.rss_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            usage.vsz_kb = parse_kb(rest);
        }
    }
    usage
}

fn parse_kb(raw: &str) -> u64 {
    raw.split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold_ms: u64, interval_ms: u64) -> WatchdogConfig {
        WatchdogConfig {
            block_threshold_ms: threshold_ms,
            check_interval_ms: interval_ms,
        }
    }

    fn no_gauges() -> GaugeSource {
        Arc::new(SchedulerGauges::default)
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let watchdog = Watchdog::new(config(250, 1_000));
        assert!(!watchdog.is_running());

        watchdog.start(no_gauges());
        watchdog.start(no_gauges());
        assert!(watchdog.is_running());

        watchdog.stop();
        watchdog.stop();
        assert!(!watchdog.is_running());
    }

    #[tokio::test]
    async fn test_blocked_loop_emits_dump() {
        let watchdog = Watchdog::new(config(20, 10));
        watchdog.start(no_gauges());

        // Block the (single-threaded) test runtime well past the threshold.
        tokio::time::sleep(Duration::from_millis(15)).await;
        std::thread::sleep(Duration::from_millis(120));
        // Let the sampler observe the lag.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            watchdog.dumps_emitted() >= 1,
            "a blocked loop must produce a diagnostic dump"
        );
        watchdog.stop();
    }

    #[tokio::test]
    async fn test_quiet_loop_emits_nothing() {
        let watchdog = Watchdog::new(config(200, 10));
        watchdog.start(no_gauges());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(watchdog.dumps_emitted(), 0);
        watchdog.stop();
    }

    #[test]
    fn test_memory_usage_readable_on_linux() {
        let usage = read_memory_usage();
        if std::path::Path::new("/proc/self/status").exists() {
            assert!(usage.rss_kb > 0, "a running process has resident memory");
        }
    }

    #[test]
    fn test_parse_kb() {
        assert_eq!(parse_kb("  12345 kB"), 12_345);
        assert_eq!(parse_kb("garbage"), 0);
    }
}
