// Examples are allowed to use expect/unwrap for simplicity
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Vigil Fleet Example
//!
//! Runs a small watcher fleet, first as in-process threads and then
//! inside a shared forked worker process, streaming results back to the
//! parent over the cross-process write queue.
//!
//! # Usage
//!
//! ```bash
//! # Thread mode
//! cargo run --example fleet
//!
//! # Shared worker process (Unix only)
//! cargo run --example fleet -- --subprocess
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use vigil_core::{Poller, Watcher, WatcherConfig, WatcherRegistry};

/// Heartbeat watcher: logs a monotonically increasing beat.
struct Heartbeat {
    beats: AtomicU64,
}

impl Poller for Heartbeat {
    fn tick(&self) -> vigil_core::Result<()> {
        let beat = self.beats.fetch_add(1, Ordering::SeqCst);
        tracing::info!(beat, pid = std::process::id(), "heartbeat");
        Ok(())
    }

    fn post_run(&self) -> vigil_core::Result<()> {
        tracing::info!(total = self.beats.load(Ordering::SeqCst), "heartbeat done");
        Ok(())
    }
}

/// Load watcher: samples the 1-minute load average each period and
/// reports it over the queue so the parent process can see samples
/// taken inside the worker.
#[cfg(unix)]
struct LoadSampler {
    queue: vigil_core::SerializedWriteQueue<f64>,
}

#[cfg(unix)]
impl Poller for LoadSampler {
    fn tick(&self) -> vigil_core::Result<()> {
        let load = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_owned))
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        self.queue.put(&load)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let subprocess = std::env::args().any(|a| a == "--subprocess");
    let registry = WatcherRegistry::new();

    let heartbeat = Watcher::new(
        WatcherConfig::new("heartbeat", Duration::from_millis(500)),
        Heartbeat {
            beats: AtomicU64::new(0),
        },
    )?;
    registry.start(&heartbeat);

    #[cfg(unix)]
    let queue = vigil_core::SerializedWriteQueue::<f64>::new()?;
    #[cfg(unix)]
    let load = Watcher::new(
        WatcherConfig::new("loadavg", Duration::from_millis(500))
            .with_description("1-minute load average sampler"),
        LoadSampler {
            queue: queue.clone(),
        },
    )?;
    #[cfg(unix)]
    registry.start(&load);

    if subprocess {
        #[cfg(unix)]
        {
            registry.start_all(true, true)?;
            tracing::info!(
                worker = registry.subprocess_pid(),
                "fleet running in shared worker"
            );
            for _ in 0..5 {
                let sample = queue.get()?;
                tracing::info!(loadavg = sample, "sample from worker");
            }
            registry.stop(&heartbeat);
            registry.stop(&load);
            registry.wait(&heartbeat, Some(Duration::from_secs(5)));
            registry.wait(&load, Some(Duration::from_secs(5)));
            registry.reap_subprocess(Duration::from_secs(5))?;
        }
        #[cfg(not(unix))]
        tracing::warn!("--subprocess requires a Unix platform");
    } else {
        registry.start_all(false, false)?;
        tracing::info!("fleet running in thread mode");
        std::thread::sleep(Duration::from_secs(3));
        #[cfg(unix)]
        {
            registry.stop(&load);
            registry.wait(&load, Some(Duration::from_secs(5)));
            while !queue.empty() {
                tracing::info!(loadavg = queue.get()?, "sample");
            }
        }
        registry.stop(&heartbeat);
        registry.wait(&heartbeat, Some(Duration::from_secs(5)));
    }

    tracing::info!("fleet shut down");
    Ok(())
}
