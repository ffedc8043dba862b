//! Periodic sweep for devices that have gone quiet.
//!
//! Every `sweep_interval` the monitor lists active devices whose last
//! communication is older than `silence_timeout`, raises one critical
//! `offline` alert per outage and marks the device inactive. Inactive
//! devices are not revisited until the processing core hears from them
//! again and flips them back to active.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::alerts::AlertPublisher;
use crate::config::LivenessConfig;
use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, LIVENESS_SWEEPS_TOTAL};
use crate::model::{AlertKind, Device, Severity};
use crate::processor::SYSTEM_ACTOR;
use crate::rules::AlertDraft;
use crate::store::Stores;

const RACED_NOTES: &str = "device reported during offline sweep";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub silent: usize,
    pub alerts_raised: usize,
    pub marked_inactive: usize,
    pub failures: usize,
}

pub struct LivenessMonitor {
    stores: Stores,
    alerts: AlertPublisher,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(stores: Stores, alerts: AlertPublisher, config: LivenessConfig) -> Self {
        Self {
            stores,
            alerts,
            config,
        }
    }

    /// Sweeps on a fixed interval until `cancel` fires. The first sweep
    /// happens one interval after start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Liveness monitor started: interval={}s, silence_timeout={}s",
            self.config.sweep_interval.as_secs(),
            self.config.silence_timeout.num_seconds()
        );

        let period = self.config.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Liveness monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report.silent > 0 || report.failures > 0 => info!(
                            "Liveness sweep: {} silent, {} alerts raised, {} marked inactive, {} failures",
                            report.silent, report.alerts_raised, report.marked_inactive, report.failures
                        ),
                        Ok(_) => debug!("Liveness sweep: all devices reporting"),
                        Err(e) => error!("Liveness sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over the registry as of `now`. Only a failure to list the
    /// silent devices is returned; per-device failures are counted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        LIVENESS_SWEEPS_TOTAL.inc();
        let cutoff = now - self.config.silence_timeout;

        let silent = self
            .stores
            .devices
            .silent_devices(cutoff)
            .await
            .map_err(counted)?;

        let mut report = SweepReport {
            silent: silent.len(),
            ..SweepReport::default()
        };

        for device in &silent {
            if let Err(e) = self.flag_offline(device, cutoff, now, &mut report).await {
                report.failures += 1;
                error!("Failed to flag {} as offline: {}", device.device_id, e);
            }
        }

        Ok(report)
    }

    async fn flag_offline(
        &self,
        device: &Device,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let already_open = self
            .stores
            .alerts
            .has_unresolved(&device.device_id, AlertKind::Offline)
            .await
            .map_err(counted)?;

        let raised = if already_open {
            debug!("Offline alert already open for {}", device.device_id);
            false
        } else {
            let draft = AlertDraft::new(device, AlertKind::Offline, Severity::Critical, None);
            self.alerts.raise(device, None, draft).await?;
            report.alerts_raised += 1;
            true
        };

        if self
            .stores
            .devices
            .mark_inactive_if_silent(&device.device_id, cutoff)
            .await
            .map_err(counted)?
        {
            report.marked_inactive += 1;
            return Ok(());
        }

        // The device reported between the listing and the status flip.
        if raised {
            self.stores
                .alerts
                .resolve_open(
                    &device.device_id,
                    AlertKind::Offline,
                    SYSTEM_ACTOR,
                    RACED_NOTES,
                    now,
                )
                .await
                .map_err(counted)?;
        }
        Ok(())
    }
}

fn counted(e: Error) -> Error {
    DB_FAILURES_TOTAL.inc();
    e
}
