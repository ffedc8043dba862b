//! Ingestion gateway: turns raw bus messages into `ReadingEvent`s.
//!
//! Topics are shaped `farm/{farmId}/sensors/{deviceId}/data`; payloads are
//! JSON records with a numeric `value` and optional `unit`, `timestamp`
//! and `batteryLevel`. Anything else is dropped here, logged and counted,
//! and never reaches the processing core.

use chrono::Utc;
use tracing::{debug, warn};

use crate::dispatch::IngressHandle;
use crate::errors::{Error, Result};
use crate::metrics::{DECODE_ERRORS_TOTAL, MESSAGES_TOTAL};
use crate::model::{DirectReading, ReadingEvent, SensorPayload};
use crate::validate::{validate_device_id, validate_payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTopic {
    pub farm_id: String,
    pub device_id: String,
}

impl SensorTopic {
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["farm", farm_id, "sensors", device_id, "data"]
                if !farm_id.is_empty() && !device_id.is_empty() =>
            {
                Ok(Self {
                    farm_id: farm_id.to_string(),
                    device_id: device_id.to_string(),
                })
            }
            _ => Err(Error::Decode(format!("unexpected topic {}", topic))),
        }
    }

    pub fn to_topic(&self) -> String {
        format!("farm/{}/sensors/{}/data", self.farm_id, self.device_id)
    }
}

/// Parses a payload, keeping the original document for the audit column.
pub fn decode_payload(payload: &[u8]) -> Result<(SensorPayload, serde_json::Value)> {
    let raw: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| Error::Decode(format!("JSON parse error: {}", e)))?;

    if !raw.is_object() {
        return Err(Error::Decode("payload is not a JSON object".to_string()));
    }

    let decoded = serde_json::from_value::<SensorPayload>(raw.clone())
        .map_err(|e| Error::Decode(format!("invalid sensor payload: {}", e)))?;

    validate_payload(&decoded)?;
    Ok((decoded, raw))
}

/// Decodes one bus message into an event bound for the processing core.
pub fn decode_message(topic: &str, payload: &[u8]) -> Result<ReadingEvent> {
    let topic = SensorTopic::parse(topic)?;
    validate_device_id(&topic.device_id)?;
    let (payload, raw) = decode_payload(payload)?;

    Ok(ReadingEvent {
        farm_id: Some(topic.farm_id),
        device_id: topic.device_id,
        payload,
        raw,
        received_at: Utc::now(),
    })
}

/// Builds an event from a synchronous ingress request.
pub fn decode_direct(request: DirectReading) -> Result<ReadingEvent> {
    validate_device_id(&request.device_id)?;
    validate_payload(&request.payload)?;

    let raw = serde_json::to_value(&request.payload)?;
    Ok(ReadingEvent {
        farm_id: None,
        device_id: request.device_id,
        payload: request.payload,
        raw,
        received_at: Utc::now(),
    })
}

/// Entry point for every bus message. Bad messages are dropped with a
/// warning; only a closed ingress channel is reported back to the caller.
pub async fn handle_publish(topic: &str, payload: &[u8], ingress: &IngressHandle) -> Result<()> {
    MESSAGES_TOTAL.inc();
    debug!(
        "Received message on topic {}, size: {} bytes",
        topic,
        payload.len()
    );

    let event = match decode_message(topic, payload) {
        Ok(event) => event,
        Err(e) => {
            DECODE_ERRORS_TOTAL.inc();
            warn!("Dropping message on {}: {}", topic, e);
            return Ok(());
        }
    };

    ingress.forward(event).await
}
