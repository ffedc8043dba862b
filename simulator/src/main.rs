mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{SensorKind, SimulatedDevice};
use tracing::{error, info, warn};

/// Publishes synthetic farm sensor readings to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "sensor-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all devices
    #[arg(long, env = "RATE", default_value_t = 50)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    #[arg(long, env = "FARM_ID", default_value = "farm-1")]
    farm_id: String,

    /// Device ids are `{prefix}-{n}`; provision the same ids in the registry
    #[arg(long, env = "DEVICE_PREFIX", default_value = "sim")]
    device_prefix: String,

    /// Share of readings far outside the normal range
    #[arg(long, env = "OUTLIER_RATE", default_value_t = 0.02)]
    outlier_rate: f64,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let rate = args.rate.max(1);

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Farm: {}",
        args.broker, args.port, rate, args.devices, args.farm_id
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", rng.gen::<u32>());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut devices: Vec<SimulatedDevice> = (0..args.devices.max(1))
        .map(|i| {
            SimulatedDevice::new(
                format!("{}-{}", args.device_prefix, i),
                SensorKind::for_index(i),
                &mut rng,
            )
        })
        .collect();

    let mut ticker = tokio::time::interval(Duration::from_micros((1_000_000 / rate).max(1)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} messages", counter);
                break;
            }
            _ = ticker.tick() => {
                let index = (counter % devices.len() as u64) as usize;
                let device = &mut devices[index];
                let payload = device.next_payload(&mut rng, args.outlier_rate);

                let body = match serde_json::to_vec(&payload) {
                    Ok(body) => body,
                    Err(e) => {
                        error!("Failed to serialize payload: {}", e);
                        continue;
                    }
                };

                match client
                    .publish(device.topic(&args.farm_id), QoS::AtLeastOnce, false, body)
                    .await
                {
                    Ok(()) => counter += 1,
                    Err(e) => warn!("Failed to publish: {}", e),
                }

                if counter > 0 && counter % 1000 == 0 {
                    info!("Published {} messages", counter);
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("MQTT disconnect failed: {}", e);
    }
}
