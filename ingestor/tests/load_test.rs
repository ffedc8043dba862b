//! Broker load tests. They need a running MQTT broker on localhost:1883
//! (and an ingestor subscribed to it to be meaningful), so they are ignored
//! by default: `cargo test --test load_test -- --ignored`.

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const FARM_ID: &str = "load-farm";

fn random_payload(rng: &mut impl Rng) -> Vec<u8> {
    json!({
        "value": rng.gen_range(15.0..35.0),
        "unit": "C",
        "timestamp": Utc::now(),
        "batteryLevel": rng.gen_range(20.0..100.0),
    })
    .to_string()
    .into_bytes()
}

struct LoadReport {
    sent: usize,
    errors: usize,
    duration: Duration,
}

impl LoadReport {
    fn rate(&self) -> f64 {
        self.sent as f64 / self.duration.as_secs_f64()
    }
}

async fn publish_load(client_id: &str, seconds: usize, target_rate: usize, devices: usize) -> LoadReport {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let total_messages = seconds * target_rate;
    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000 / target_rate) as u64);

    let start = Instant::now();
    let mut sent = 0;
    let mut errors = 0;

    for batch_start in (0..total_messages).step_by(burst_size) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let payload = random_payload(&mut rand::thread_rng());
            let topic = format!("farm/{}/sensors/load-dev-{}/data", FARM_ID, i % devices);

            match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    errors += 1;
                    if errors < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let rate = (batch_start + burst_size) as f64 / start.elapsed().as_secs_f64();
            println!("{} msgs ({:.0} msg/s)", batch_start + burst_size, rate);
        }
    }

    LoadReport {
        sent,
        errors,
        duration: start.elapsed(),
    }
}

#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    let report = publish_load("load-test", 10, 1000, 10).await;

    println!(
        "Sent {} in {:.2}s ({:.2} msg/s), {} errors",
        report.sent,
        report.duration.as_secs_f64(),
        report.rate(),
        report.errors
    );

    assert!(
        report.rate() >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        report.rate()
    );
    assert_eq!(report.errors, 0, "Too many errors");
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let report = publish_load("load-test-sustained", 60, 1000, 50).await;

    println!(
        "Sustained: {} sent in {:.2}s ({:.2} msg/s), {} errors",
        report.sent,
        report.duration.as_secs_f64(),
        report.rate(),
        report.errors
    );

    let error_rate = report.errors as f64 / (report.sent + report.errors).max(1) as f64;
    assert!(report.rate() >= 900.0, "Sustained rate too low");
    assert!(error_rate < 0.01, "Error rate too high: {:.2}%", error_rate * 100.0);
}
