#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensor_ingestor::config::{LivenessConfig, RuleConfig};
use sensor_ingestor::dispatch::{self, run_dispatcher, IngressHandle};
use sensor_ingestor::errors::Result;
use sensor_ingestor::fanout::FanOut;
use sensor_ingestor::gateway::{handle_publish, SensorTopic};
use sensor_ingestor::liveness::LivenessMonitor;
use sensor_ingestor::memory::MemoryStore;
use sensor_ingestor::processor::Processor;
use sensor_ingestor::model::{Reading, ReadingQuery};
use sensor_ingestor::store::{ReadingStore, Stores};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// The full processing pipeline over an in-memory store.
pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub stores: Stores,
    pub fanout: Arc<FanOut>,
    pub processor: Arc<Processor>,
    pub ingress: IngressHandle,
    dispatcher: JoinHandle<()>,
}

impl Pipeline {
    pub fn start() -> Self {
        Self::with_rules(RuleConfig::default())
    }

    pub fn with_rules(rules: RuleConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::from_backend(store.clone());
        Self::with_stores(store, stores, rules)
    }

    /// Runs over `stores`, which should be backed by `store` so the test can
    /// inspect what was written.
    pub fn with_stores(store: Arc<MemoryStore>, stores: Stores, rules: RuleConfig) -> Self {
        let fanout = Arc::new(FanOut::default());
        let processor = Arc::new(Processor::new(stores.clone(), fanout.clone(), rules));

        let (ingress, rx) = dispatch::channel(64);
        let dispatcher = tokio::spawn(run_dispatcher(rx, processor.clone(), 16));

        Self {
            store,
            stores,
            fanout,
            processor,
            ingress,
            dispatcher,
        }
    }

    pub fn producer(&self) -> FakeProducer {
        FakeProducer {
            ingress: self.ingress.clone(),
        }
    }

    pub fn liveness(&self, config: LivenessConfig) -> LivenessMonitor {
        LivenessMonitor::new(self.stores.clone(), self.processor.alert_publisher(), config)
    }

    /// Closes the ingress and waits for every lane to finish its queue.
    pub async fn drain(self) -> Arc<MemoryStore> {
        let Pipeline {
            store,
            ingress,
            dispatcher,
            ..
        } = self;
        drop(ingress);
        dispatcher.await.expect("dispatcher panicked");
        store
    }
}

/// Stands in for devices on the bus: messages go through the same gateway
/// entry point the MQTT consumer uses.
#[derive(Clone)]
pub struct FakeProducer {
    ingress: IngressHandle,
}

impl FakeProducer {
    pub async fn send_raw(&self, topic: &str, payload: &[u8]) {
        handle_publish(topic, payload, &self.ingress)
            .await
            .expect("ingress closed");
    }

    pub async fn send(&self, farm_id: &str, device_id: &str, payload: Value) {
        let topic = SensorTopic {
            farm_id: farm_id.to_string(),
            device_id: device_id.to_string(),
        }
        .to_topic();
        let body = serde_json::to_vec(&payload).expect("payload serializes");
        self.send_raw(&topic, &body).await;
    }

    pub async fn send_value(&self, farm_id: &str, device_id: &str, value: f64, at: DateTime<Utc>) {
        self.send(farm_id, device_id, json!({ "value": value, "timestamp": at }))
            .await;
    }
}

/// Reading store whose writes for one device take `delay` each.
pub struct SlowReadings {
    pub inner: Arc<MemoryStore>,
    pub device_id: String,
    pub delay: Duration,
}

#[async_trait]
impl ReadingStore for SlowReadings {
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        if reading.device_id == self.device_id {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.insert_reading(reading).await
    }

    async fn recent_valid_readings(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reading>> {
        self.inner.recent_valid_readings(device_id, since, limit).await
    }

    async fn list_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>> {
        self.inner.list_readings(query).await
    }

    async fn count_readings(&self, query: &ReadingQuery) -> Result<usize> {
        self.inner.count_readings(query).await
    }
}
