//! Background polling of the fingerprint scanner's connection status.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use shared::{domain::ScannerStatus, protocol::ScannerStatusResponse};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait DeviceStatusSource: Send + Sync {
    async fn poll_status(&self) -> Result<ScannerStatusResponse>;
}

pub struct HttpDeviceStatusSource {
    http: Client,
    base_url: String,
}

impl HttpDeviceStatusSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DeviceStatusSource for HttpDeviceStatusSource {
    async fn poll_status(&self) -> Result<ScannerStatusResponse> {
        let status: ScannerStatusResponse = self
            .http
            .get(format!("{}/scanner/status", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub status: ScannerStatus,
    pub port: Option<String>,
    pub polled_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Cheap, non-blocking reader of the monitor's latest published snapshot.
#[derive(Clone)]
pub struct ScannerStatusView {
    rx: watch::Receiver<ConnectivitySnapshot>,
}

impl ScannerStatusView {
    /// A view with no monitor behind it; it reports `Unknown` forever.
    pub fn unmonitored() -> Self {
        let (_tx, rx) = watch::channel(ConnectivitySnapshot::default());
        Self { rx }
    }

    #[cfg(test)]
    pub(crate) fn fixed(status: ScannerStatus) -> Self {
        let (_tx, rx) = watch::channel(ConnectivitySnapshot {
            status,
            ..ConnectivitySnapshot::default()
        });
        Self { rx }
    }

    pub fn last_status(&self) -> ScannerStatus {
        self.rx.borrow().status
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.rx.borrow().clone()
    }

    /// Waits for the next published poll result. Returns `false` once the monitor is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

pub struct ScannerConnectivityMonitor {
    view: ScannerStatusView,
    task: JoinHandle<()>,
}

impl ScannerConnectivityMonitor {
    pub fn spawn(
        source: Arc<dyn DeviceStatusSource>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(ConnectivitySnapshot::default());
        let task = tokio::spawn(poll_loop(source, tx, poll_interval, poll_timeout));
        info!(interval_ms = poll_interval.as_millis() as u64, "scanner connectivity monitor started");
        Self {
            view: ScannerStatusView { rx },
            task,
        }
    }

    pub fn view(&self) -> ScannerStatusView {
        self.view.clone()
    }

    pub fn last_status(&self) -> ScannerStatus {
        self.view.last_status()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for ScannerConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    source: Arc<dyn DeviceStatusSource>,
    tx: watch::Sender<ConnectivitySnapshot>,
    poll_interval: Duration,
    poll_timeout: Duration,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        ticker.tick().await;

        let polled = match timeout(poll_timeout, source.poll_status()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("status poll timed out after {poll_timeout:?}")),
        };

        let snapshot = match polled {
            Ok(response) => {
                consecutive_failures = 0;
                ConnectivitySnapshot {
                    status: if response.connected {
                        ScannerStatus::Connected
                    } else {
                        ScannerStatus::Disconnected
                    },
                    port: response.port,
                    polled_at: Some(Utc::now()),
                    consecutive_failures,
                }
            }
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!(%error, consecutive_failures, "scanner status poll failed");
                ConnectivitySnapshot {
                    status: ScannerStatus::Disconnected,
                    port: None,
                    polled_at: Some(Utc::now()),
                    consecutive_failures,
                }
            }
        };

        let previous = tx.send_replace(snapshot.clone()).status;
        if previous != snapshot.status {
            info!(from = ?previous, to = ?snapshot.status, port = ?snapshot.port, "scanner status changed");
        } else {
            debug!(status = ?snapshot.status, "scanner status unchanged");
        }
    }
}

#[cfg(test)]
#[path = "tests/monitor_tests.rs"]
mod tests;
