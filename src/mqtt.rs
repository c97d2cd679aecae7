use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

/// Manual override command received over the command topic; mirrors the
/// HTTP override endpoint but takes the charge power in watts.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideCommand {
    pub mode: i8,
    pub duration: String,
    #[serde(rename = "charge_power")]
    pub charge_power_w: f64,
}

/// MQTT publication port. Publishes are fire-and-forget: when the broker is
/// down they are dropped with a log line, never blocking a control cycle.
pub struct MqttService {
    client: Option<AsyncClient>,
    prefix: String,
}

impl MqttService {
    pub fn disabled() -> Self {
        Self { client: None, prefix: String::new() }
    }

    /// Connect to the broker, announce `status = online` (with an offline
    /// last will), subscribe to the override command topic and pump the
    /// event loop until shutdown. Incoming commands are forwarded to the
    /// returned channel.
    pub fn connect(
        cfg: &MqttConfig,
        stop: CancellationToken,
    ) -> (Self, mpsc::Receiver<OverrideCommand>) {
        let (command_tx, command_rx) = mpsc::channel(8);
        if !cfg.enabled {
            return (Self::disabled(), command_rx);
        }

        let prefix = cfg.topic_prefix.trim_end_matches('/').to_string();
        let mut options = MqttOptions::new("eos-bridge", cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !cfg.user.is_empty() {
            options.set_credentials(cfg.user.clone(), cfg.password.clone());
        }
        options.set_last_will(LastWill::new(
            format!("{prefix}/status"),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let command_topic = format!("{prefix}/control/override/set");
        let status_topic = format!("{prefix}/status");

        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        let _ = loop_client
                            .publish(&status_topic, QoS::AtLeastOnce, true, "offline")
                            .await;
                        let _ = loop_client.disconnect().await;
                        info!("mqtt loop stopped");
                        return;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("mqtt connected");
                            let _ = loop_client
                                .publish(&status_topic, QoS::AtLeastOnce, true, "online")
                                .await;
                            let _ = loop_client
                                .subscribe(&command_topic, QoS::AtLeastOnce)
                                .await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic == command_topic {
                                match serde_json::from_slice::<OverrideCommand>(&publish.payload) {
                                    Ok(command) => {
                                        if command_tx.try_send(command).is_err() {
                                            warn!("override command queue full, dropping command");
                                        }
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "invalid override command payload");
                                    }
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "mqtt connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        });

        (Self { client: Some(client), prefix }, command_rx)
    }

    /// Publish under the configured prefix. No-op when MQTT is disabled.
    pub async fn publish(&self, topic_suffix: &str, payload: impl Into<String>) {
        let Some(client) = &self.client else { return };
        let topic = format!("{}/{}", self.prefix, topic_suffix);
        let payload = payload.into();
        if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            debug!(topic, error = %e, "mqtt publish dropped");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_command_payload_parses() {
        let cmd: OverrideCommand =
            serde_json::from_str(r#"{"mode":2,"duration":"01:30","charge_power":2000.0}"#).unwrap();
        assert_eq!(cmd.mode, 2);
        assert_eq!(cmd.duration, "01:30");
        assert_eq!(cmd.charge_power_w, 2000.0);
    }

    #[tokio::test]
    async fn disabled_service_swallows_publishes() {
        let svc = MqttService::disabled();
        assert!(!svc.is_enabled());
        svc.publish("status", "online").await;
    }

    #[test]
    fn disabled_when_config_off() {
        let cfg = MqttConfig {
            enabled: false,
            host: "localhost".into(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            topic_prefix: "eos_bridge".into(),
        };
        let (svc, _rx) = MqttService::connect(&cfg, CancellationToken::new());
        assert!(!svc.is_enabled());
    }
}
