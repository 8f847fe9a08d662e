//! Network reachability monitor
//!
//! A long-lived observer that only posts `Online`/`Offline` transitions.
//! It never touches key material or the remote store; the orchestrator
//! subscribes and decides what a transition means.
//!
//! ```text
//! TcpProbe ──probe()──▶ NetworkMonitor ──watch──▶ SyncOrchestrator
//!  (interval)            (dedups repeats)          (offline / resume)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NetworkSettings;

/// Whether the remote store can currently be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Online => write!(f, "online"),
            Reachability::Offline => write!(f, "offline"),
        }
    }
}

/// Source of reachability samples.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Reachability;
}

/// Probe that opens a TCP connection to `host:port` with a timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe configured by `[network]`, if an address is set.
    pub fn from_settings(settings: &NetworkSettings) -> Option<Self> {
        settings
            .probe_addr
            .as_ref()
            .map(|addr| Self::new(addr.clone(), Duration::from_millis(settings.probe_timeout_ms)))
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> Reachability {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => Reachability::Online,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Probe connect failed");
                Reachability::Offline
            }
            Err(_) => {
                debug!(addr = %self.addr, "Probe timed out");
                Reachability::Offline
            }
        }
    }
}

/// Publishes reachability transitions to subscribers.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<Reachability>>,
}

impl NetworkMonitor {
    pub fn new(initial: Reachability) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Reachability {
        *self.tx.borrow()
    }

    /// Record a sample. Repeats of the current state are swallowed, so
    /// subscribers only wake on transitions. Returns whether it was one.
    pub fn report(&self, state: Reachability) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(%state, "Reachability changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.tx.subscribe()
    }

    /// Sample `probe` every `interval` until `shutdown` fires.
    pub fn spawn_probe<P>(
        &self,
        probe: P,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()>
    where
        P: ReachabilityProbe + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Reachability probe stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let state = probe.probe().await;
                        monitor.report(state);
                    }
                }
            }
        })
    }
}
