use crate::session::ObsLink;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Only connect while a process with this name runs.
    pub process_name: Option<String>,
    pub process_check_interval: Duration,
}

/// Exponential backoff with up to 25% random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct ProcessProbe {
    sys: Arc<Mutex<System>>,
    target: String,
}

impl ProcessProbe {
    fn new(process_name: &str) -> Self {
        Self {
            sys: Arc::new(Mutex::new(System::new())),
            target: process_name.to_lowercase(),
        }
    }

    /// Scans the process table on the blocking pool.
    async fn is_running(&self) -> bool {
        let sys = self.sys.clone();
        let target = self.target.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let mut sys = sys.lock().unwrap_or_else(PoisonError::into_inner);
            sys.refresh_processes();
            sys.processes()
                .values()
                .any(|p| p.name().to_lowercase() == target)
        })
        .await;
        match scan {
            Ok(running) => running,
            Err(err) => {
                tracing::warn!(error = %err, "process scan failed");
                false
            }
        }
    }
}

/// Keeps the link connected: one `Session` per attempt, backing off between
/// failures until shutdown.
pub struct Supervisor {
    link: ObsLink,
    options: SupervisorOptions,
    backoff: Backoff,
    probe: Option<ProcessProbe>,
}

impl Supervisor {
    pub fn new(link: ObsLink, options: SupervisorOptions) -> Self {
        let probe = options.process_name.as_deref().map(ProcessProbe::new);
        Self {
            backoff: Backoff::new(options.initial_delay, options.max_delay),
            link,
            options,
            probe,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut waiting_for_process = false;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(probe) = self.probe.as_ref() {
                if !probe.is_running().await {
                    if !waiting_for_process {
                        tracing::info!(process = %probe.target, "obs is not running, waiting for it");
                        waiting_for_process = true;
                    }
                    let interval = self.options.process_check_interval;
                    if wait_or_shutdown(&mut shutdown, interval).await {
                        break;
                    }
                    continue;
                }
                waiting_for_process = false;
            }

            let session = self.link.new_session();
            match session
                .open(&self.options.url, self.options.connect_timeout)
                .await
            {
                Ok(()) => break,
                Err(err) => tracing::warn!(error = %err, state = %session.state(), "obs connection lost"),
            }

            if session.reached_ready() {
                self.backoff.reset();
            }
            if !self.options.reconnect {
                tracing::warn!("reconnect disabled, no further connection attempts");
                break;
            }

            let delay = self.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting to obs");
            if wait_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        tracing::debug!("connection supervisor stopped");
    }
}

/// Sleeps for `delay`; returns true when shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
