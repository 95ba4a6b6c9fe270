#![cfg(feature = "notify-mqtt")]

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::{Client, MqttOptions, QoS};

use super::{Delivery, Notice, NotificationSink};

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Publishes each notice as JSON with QoS 1.
///
/// "Delivered" means the publish was queued to the client; broker
/// acknowledgement is handled by the background connection thread.
pub struct MqttSink {
    client: Mutex<Client>,
    topic: String,
    _connection: JoinHandle<()>,
}

impl MqttSink {
    /// `broker` is `host` or `host:port`.
    pub fn connect(broker: &str, topic: &str) -> Result<Self> {
        let (host, port) = parse_broker(broker)?;
        let mut options = MqttOptions::new("exit-witness", host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut connection) = Client::new(options, 10);

        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                if let Err(e) = event {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        });

        log::info!("MQTT notification sink publishing to {} on {}", topic, broker);
        Ok(Self {
            client: Mutex::new(client),
            topic: topic.to_string(),
            _connection: handle,
        })
    }
}

impl NotificationSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn notify(&self, notice: &Notice) -> Result<Delivery> {
        let payload = serde_json::to_vec(notice)?;
        let client = self
            .client
            .lock()
            .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
        client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .context("mqtt publish failed")?;
        Ok(Delivery { delivered: true })
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let broker = broker.trim();
    if broker.is_empty() {
        return Err(anyhow!("mqtt broker address must not be empty"));
    }
    match broker.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("invalid mqtt broker port in {:?}", broker))?;
            Ok((host.to_string(), port))
        }
        None => Ok((broker.to_string(), DEFAULT_MQTT_PORT)),
    }
}
