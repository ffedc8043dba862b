use crate::config::MqttConfig;
use crate::dispatch::IngressHandle;
use crate::errors::{Error, Result};
use crate::gateway::handle_publish;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_clean_session(false);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }
    mqtt_options
}

/// Consumes sensor messages until `cancel` fires or the ingress channel
/// closes. Per-message failures never end the loop.
pub async fn run_mqtt(
    config: MqttConfig,
    ingress: IngressHandle,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", config.broker, config.port);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 10000);

    loop {
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopping MQTT consumer");
                if let Err(e) = client.disconnect().await {
                    warn!("MQTT disconnect failed: {}", e);
                }
                return Ok(());
            }
            notification = eventloop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Subscribe on every (re)connect; the broker may have lost
                // the session.
                client
                    .subscribe(config.topic.as_str(), QoS::AtLeastOnce)
                    .await
                    .map_err(Error::Mqtt)?;
                info!("Subscribed to {} with QoS 1", config.topic);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Err(e) = handle_publish(&publish.topic, &publish.payload, &ingress).await
                {
                    error!("Ingress closed, stopping MQTT consumer: {}", e);
                    return Err(e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
