//! The message bus: a thin wrapper over `rumqttc` that owns the global
//! availability contract (§5, §6) and gives every other module a small
//! publish/subscribe surface instead of a raw client.
//!
//! # Topic structure
//!
//! Everything lives under a configurable root namespace (default
//! `smartbedmqtt`):
//!
//! - `<ns>/status` — retained `online`/`offline`, last-will = `offline`.
//! - `<ns>/status/degraded` — retained `true`/`false`.
//! - `<ns>/health`, `<ns>/health/<deviceId>` — heartbeat JSON, not retained.
//! - `<ns>/proxy/<host>/status` (in), `.../command` (out), `.../reboot_requested`
//!   and `.../reboot_suppressed` (out, audit).
//! - `homeassistant/<component>/<deviceTopic>_<tag>/config` — discovery.
//! - `homeassistant/status` (in) — triggers a debounced discovery re-publish.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Name used as the MQTT client id and in the `Hello` handshake upstream.
const CLIENT_ID: &str = "bedlink";

/// Handle to the message bus. Cheap to clone; publishes serialize through
/// the underlying `rumqttc` client's own internal channel.
#[derive(Clone)]
pub struct Bus {
    client: AsyncClient,
    namespace: String,
}

impl Bus {
    /// Connect to the broker named by `config`, with the global status
    /// topic's last-will wired to `offline` (§4.6 step 1). Returns the bus
    /// handle and the event loop driving it; the caller is responsible for
    /// polling the event loop (see [`drive`]).
    pub fn connect(config: &Config) -> Result<(Self, EventLoop)> {
        let mut options = MqttOptions::new(CLIENT_ID, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(password)) = (&config.mqtt_user, &config.mqtt_password) {
            options.set_credentials(user, password);
        }

        let status_topic = format!("{}/status", config.namespace);
        options.set_last_will(LastWill::new(&status_topic, "offline", QoS::AtLeastOnce, true));

        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok((
            Self {
                client,
                namespace: config.namespace.clone(),
            },
            eventloop,
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Result<()> {
        let topic = topic.into();
        self.client
            .publish(&topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Error::mqtt(format!("publish to {topic} failed: {e}")))
    }

    pub async fn publish_json<T: serde::Serialize>(&self, topic: impl Into<String>, value: &T, retain: bool) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|e| Error::mqtt(e.to_string()))?;
        self.publish(topic, payload, retain).await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::mqtt(format!("subscribe to {topic} failed: {e}")))
    }

    /// Publish the retained global availability flag (§5: the single source
    /// of availability for every published entity).
    pub async fn publish_status(&self, online: bool) -> Result<()> {
        let payload = if online { "online" } else { "offline" };
        self.publish(format!("{}/status", self.namespace), payload, true).await
    }

    pub async fn publish_degraded(&self, degraded: bool) -> Result<()> {
        self.publish(
            format!("{}/status/degraded", self.namespace),
            if degraded { "true" } else { "false" },
            true,
        )
        .await
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "error disconnecting from bus");
        }
    }
}

/// An incoming message-bus event, pre-filtered down to what the supervisor
/// actually dispatches on (proxy status, entity commands, discovery
/// re-publish triggers).
#[derive(Debug, Clone)]
pub enum Incoming {
    Publish { topic: String, payload: Vec<u8> },
}

/// Drive the event loop in the background: publish `online` on every fresh
/// `ConnAck` (§4.6 step 1), and forward every incoming `Publish` to the
/// returned channel for the supervisor to route. Runs until the loop errors
/// out repeatedly (bus connection lost) or the returned handle is aborted.
pub fn spawn_router(bus: Bus, mut eventloop: EventLoop) -> (tokio::task::JoinHandle<()>, tokio::sync::mpsc::UnboundedReceiver<Incoming>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(?ack, "connected to message bus");
                    if let Err(e) = bus.publish_status(true).await {
                        warn!(error = %e, "failed to publish online status after connect");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = publish.payload.to_vec();
                    if tx.send(Incoming::Publish { topic, payload }).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "message bus connection error");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
    (handle, rx)
}

/// Sanitize a path segment for use inside an MQTT topic (no `#`, `+`,
/// spaces, or extra `/`).
pub fn safe_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_id_lowercases_and_replaces_unsafe_chars() {
        assert_eq!(safe_id("Keeson Bed #1"), "keeson_bed__1");
        assert_eq!(safe_id("aabbccddeeff"), "aabbccddeeff");
        assert_eq!(safe_id("proxy/host+name"), "proxy_host_name");
    }

    #[test]
    fn safe_id_is_idempotent() {
        let once = safe_id("Living Room Bed");
        let twice = safe_id(&once);
        assert_eq!(once, twice);
    }
}
