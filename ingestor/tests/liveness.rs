mod support;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sensor_ingestor::config::LivenessConfig;
use sensor_ingestor::fanout::FarmEvent;
use sensor_ingestor::gateway::decode_direct;
use sensor_ingestor::model::{AlertKind, Device, DeviceStatus, Severity};
use serde_json::json;
use support::Pipeline;

fn config() -> LivenessConfig {
    LivenessConfig {
        sweep_interval: StdDuration::from_secs(300),
        silence_timeout: Duration::minutes(30),
    }
}

fn silent_device(device_id: &str, minutes: i64) -> Device {
    let mut device = Device::new(device_id, "farm-1").with_location("north paddock");
    device.last_communication = Some(Utc::now() - Duration::minutes(minutes));
    device
}

#[tokio::test]
async fn silent_device_goes_offline_once() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("D3", 40)).await;
    let monitor = pipeline.liveness(config());

    let now = Utc::now();
    let report = monitor.sweep(now).await.unwrap();
    assert_eq!(report.silent, 1);
    assert_eq!(report.alerts_raised, 1);
    assert_eq!(report.marked_inactive, 1);

    let device = pipeline.store.device("D3").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Inactive);

    let alerts = pipeline.store.alerts_for("D3").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Offline);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].trigger_value, None);
    assert_eq!(alerts[0].reading_id, None);

    let report = monitor.sweep(now + Duration::minutes(5)).await.unwrap();
    assert_eq!(report.silent, 0);
    assert_eq!(pipeline.store.alerts_for("D3").await.len(), 1);
}

#[tokio::test]
async fn reporting_devices_are_left_alone() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("fresh", 5)).await;
    pipeline.store.insert_device(silent_device("edge", 29)).await;

    let mut maintenance = silent_device("bench", 120);
    maintenance.status = DeviceStatus::Maintenance;
    pipeline.store.insert_device(maintenance).await;

    let report = pipeline.liveness(config()).sweep(Utc::now()).await.unwrap();
    assert_eq!(report.silent, 0);
    for id in ["fresh", "edge", "bench"] {
        assert!(pipeline.store.alerts_for(id).await.is_empty());
    }
}

#[tokio::test]
async fn existing_open_alert_is_not_duplicated() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("D3", 40)).await;
    let monitor = pipeline.liveness(config());

    monitor.sweep(Utc::now()).await.unwrap();
    // Flipped back to active by hand without a reading, then silent again.
    let mut device = pipeline.store.device("D3").await.unwrap();
    device.status = DeviceStatus::Active;
    pipeline.store.insert_device(device).await;

    let report = monitor.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.alerts_raised, 0);
    assert_eq!(report.marked_inactive, 1);
    assert_eq!(pipeline.store.alerts_for("D3").await.len(), 1);
}

#[tokio::test]
async fn new_outage_after_recovery_raises_a_new_alert() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("D3", 40)).await;
    let monitor = pipeline.liveness(config());

    monitor.sweep(Utc::now()).await.unwrap();

    let request = serde_json::from_value(json!({ "deviceId": "D3", "value": 12.0 })).unwrap();
    pipeline
        .ingress
        .submit(decode_direct(request).unwrap())
        .await
        .unwrap();

    let device = pipeline.store.device("D3").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Active);
    let first = pipeline.store.alerts_for("D3").await;
    assert_eq!(first.len(), 1);
    assert!(first[0].resolved);

    // Silent again, well past the timeout.
    pipeline
        .store
        .set_last_communication("D3", Utc::now() - Duration::minutes(45))
        .await;
    let report = monitor.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.alerts_raised, 1);

    let alerts = pipeline.store.alerts_for("D3").await;
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts.iter().filter(|a| !a.resolved).count(), 1);
}

#[tokio::test]
async fn offline_alert_reaches_farm_observers() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("D3", 40)).await;
    let mut observer = pipeline.fanout.subscribe("farm-1").await;

    pipeline.liveness(config()).sweep(Utc::now()).await.unwrap();

    match observer.recv().await.unwrap() {
        FarmEvent::SensorAlert(alert) => {
            assert_eq!(alert.device_id, "D3");
            assert_eq!(alert.alert_kind, AlertKind::Offline);
            assert_eq!(alert.location.as_deref(), Some("north paddock"));
            assert_eq!(alert.value, None);
        }
        other => panic!("expected sensor_alert, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_alert_write_leaves_device_active() {
    let pipeline = Pipeline::start();
    pipeline.store.insert_device(silent_device("D3", 40)).await;
    pipeline.store.fail_alert_writes(true);

    let report = pipeline.liveness(config()).sweep(Utc::now()).await.unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.marked_inactive, 0);
    assert_eq!(
        pipeline.store.device("D3").await.unwrap().status,
        DeviceStatus::Active
    );

    // The next sweep tries again.
    pipeline.store.fail_alert_writes(false);
    let report = pipeline.liveness(config()).sweep(Utc::now()).await.unwrap();
    assert_eq!(report.alerts_raised, 1);
    assert_eq!(report.marked_inactive, 1);
}

#[tokio::test]
async fn monitor_stops_on_cancel() {
    let pipeline = Pipeline::start();
    let monitor = std::sync::Arc::new(pipeline.liveness(config()));
    let cancel = tokio_util::sync::CancellationToken::new();

    let handle = tokio::spawn(monitor.run(cancel.clone()));
    cancel.cancel();
    handle.await.unwrap();
}
