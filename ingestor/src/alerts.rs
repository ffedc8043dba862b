use std::sync::Arc;

use tracing::{error, warn};
use uuid::Uuid;

use crate::db::is_transient;
use crate::errors::Result;
use crate::fanout::{FanOut, FarmEvent};
use crate::metrics::{ALERTS_RAISED_TOTAL, DB_FAILURES_TOTAL};
use crate::model::{Alert, Device};
use crate::rules::AlertDraft;
use crate::store::AlertStore;

/// The one path by which alerts come into existence: the row is written
/// first and only then broadcast to the owning farm's observers.
#[derive(Clone)]
pub struct AlertPublisher {
    store: Arc<dyn AlertStore>,
    fanout: Arc<FanOut>,
}

impl AlertPublisher {
    pub fn new(store: Arc<dyn AlertStore>, fanout: Arc<FanOut>) -> Self {
        Self { store, fanout }
    }

    pub async fn raise(
        &self,
        device: &Device,
        reading_id: Option<Uuid>,
        draft: AlertDraft,
    ) -> Result<Alert> {
        let alert = Alert::new(
            device.device_id.clone(),
            reading_id,
            draft.kind,
            draft.severity,
            draft.message,
            draft.trigger_value,
        );

        if let Err(e) = self.store.insert_alert(&alert).await {
            DB_FAILURES_TOTAL.inc();
            error!(
                transient = is_transient(&e),
                "Failed to persist {} alert for {}: {}",
                alert.kind.as_str(),
                device.device_id,
                e
            );
            return Err(e);
        }

        ALERTS_RAISED_TOTAL
            .with_label_values(&[alert.kind.as_str()])
            .inc();
        warn!(
            "Sensor alert: {} - {} - {:?}",
            device.device_id,
            alert.kind.as_str(),
            alert.trigger_value
        );

        self.fanout
            .publish(&device.farm_id, FarmEvent::sensor_alert(device, &alert))
            .await;

        Ok(alert)
    }
}
