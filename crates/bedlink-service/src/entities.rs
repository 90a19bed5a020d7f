//! Vendor abstraction and external-system entity discovery (§6).
//!
//! This crate never hard-codes a vendor's GATT command protocol — `type` in
//! configuration only selects which [`ControllerBuilder`] the supervisor
//! hands candidates to. A vendor crate plugs in by implementing
//! [`ControllerBuilder`] (the `is_supported` probe and controller
//! construction, §4.3) and [`BedController`] (how a configured entity's
//! write is turned into bytes on the wire, §4.4). Everything in this module
//! is about naming and publishing those entities, not about any specific
//! byte protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use bedlink_core::DeviceSession;
use bedlink_types::{BedConfig, BleAdvertisement};

use crate::mqtt::{safe_id, Bus};
use crate::pipeline::CommandPipeline;

/// One externally-discoverable entity a controller exposes (a preset
/// button, a degraded-state sensor, and so on). `component` is the Home
/// Assistant MQTT-discovery component (`switch`, `button`, `sensor`, ...).
#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub component: String,
    pub tag: String,
    pub description: String,
    pub device_class: Option<String>,
}

impl EntityConfig {
    pub fn new(component: impl Into<String>, tag: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            tag: tag.into(),
            description: description.into(),
            device_class: None,
        }
    }

    #[must_use]
    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }
}

/// A built, connected controller for one bed. Vendor crates implement this
/// to turn an entity write into the bytes their hardware expects; this
/// crate only needs to know which entities exist and how to route a write
/// to the pipeline.
#[async_trait]
pub trait BedController: Send + Sync {
    /// Stable per-bed key used for scorer/stats lookups — not the runtime
    /// BLE address (§4.3: `Candidate::controller_key`).
    fn controller_key(&self) -> &str;
    fn friendly_name(&self) -> &str;
    fn entities(&self) -> &[EntityConfig];

    /// Route a write for `entity_tag` with `payload` through the
    /// controller's command pipeline.
    async fn send(&self, pipeline: &Arc<CommandPipeline>, entity_tag: &str, payload: &[u8]) -> bedlink_core::Result<()>;
}

/// The vendor plug-in point for discovery (§4.3 `is_supported` probe,
/// `select_first_supported`) and controller construction.
pub trait ControllerBuilder: Send + Sync {
    /// Does this vendor recognize `advertisement` as one of its controllers?
    fn is_supported(&self, advertisement: &BleAdvertisement) -> bool;

    /// Build a controller bound to an already-connected session. Returns
    /// `ControllerBuildFailed` if the advertisement matched `is_supported`
    /// but the session doesn't actually expose what the controller needs
    /// (§7 `ControllerBuildFailed`, recovered via failover in the caller).
    fn build(
        &self,
        bed: &BedConfig,
        advertisement: &BleAdvertisement,
        session: Arc<DeviceSession>,
    ) -> bedlink_core::Result<Box<dyn BedController>>;
}

/// `<deviceTopic>` = `<safeId(manufacturer)>/<safeId(stableAddress)>` (§6).
pub fn device_topic(manufacturer: &str, bed: &BedConfig) -> String {
    format!("{}/{}", safe_id(manufacturer), safe_id(&bed.stable_identity()))
}

/// `unique_id` = `<safeId(deviceName)>_<tag>` (§6).
pub fn unique_id(bed: &BedConfig, tag: &str) -> String {
    format!("{}_{}", safe_id(&bed.friendly_name), safe_id(tag))
}

/// Publish one entity's Home Assistant MQTT-discovery config (§6). The
/// discovery table marks this topic not-retained, but §5 states entity
/// discovery publishes are retained; this implementation follows §5 — a
/// discovery message an external consumer misses on a later bus restart
/// must not make the entity disappear, which not-retaining would risk.
pub async fn publish_discovery(bus: &Bus, manufacturer: &str, bed: &BedConfig, entity: &EntityConfig) -> crate::error::Result<()> {
    let device_topic = device_topic(manufacturer, bed);
    let tag = safe_id(entity.tag.as_str());
    let object_id = format!("{}_{}", device_topic.replace('/', "_"), tag);
    let topic = format!("homeassistant/{}/{object_id}/config", entity.component);

    let entity_base = format!("{}/entity/{object_id}", bus.namespace());
    let mut payload = json!({
        "name": entity.description,
        "unique_id": unique_id(bed, &entity.tag),
        "availability_topic": format!("{}/status", bus.namespace()),
        "payload_available": "online",
        "payload_not_available": "offline",
        "command_topic": format!("{entity_base}/set"),
        "state_topic": format!("{entity_base}/state"),
        "device": {
            "identifiers": [bed.stable_identity()],
            "name": bed.friendly_name,
            "manufacturer": manufacturer,
        },
    });
    if let Some(device_class) = &entity.device_class {
        payload["device_class"] = json!(device_class);
    }

    bus.publish_json(topic, &payload, true).await
}

/// Publish every entity for every configured bed, used both at startup and
/// after a debounced `homeassistant/status` re-publish trigger.
pub async fn publish_all_discovery(
    bus: &Bus,
    manufacturer: &str,
    beds: &[(BedConfig, Vec<EntityConfig>)],
) -> crate::error::Result<()> {
    for (bed, entities) in beds {
        for entity in entities {
            publish_discovery(bus, manufacturer, bed, entity).await?;
        }
    }
    Ok(())
}

/// Debounces `homeassistant/status` re-publish triggers: each call to
/// [`Self::trigger`] restarts a 15 s timer rather than stacking one per
/// message, matching §6's "trigger re-publish ... after 15 s debounce".
pub struct DiscoveryDebouncer {
    bus: Bus,
    manufacturer: String,
    beds: Vec<(BedConfig, Vec<EntityConfig>)>,
    pending: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryDebouncer {
    pub fn new(bus: Bus, manufacturer: String, beds: Vec<(BedConfig, Vec<EntityConfig>)>) -> Self {
        Self {
            bus,
            manufacturer,
            beds,
            pending: std::sync::Mutex::new(None),
        }
    }

    pub fn trigger(self: &Arc<Self>) {
        let mut guard = self.pending.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(15)).await;
            if let Err(e) = publish_all_discovery(&this.bus, &this.manufacturer, &this.beds).await {
                tracing::warn!(error = %e, "failed to re-publish discovery after homeassistant/status");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bed() -> BedConfig {
        BedConfig {
            friendly_name: "Living Room Bed".to_string(),
            name: "Bed-aabbccddeeff".to_string(),
            stay_connected: false,
            aliases: String::new(),
            extra_identifiers: Vec::new(),
        }
    }

    #[test]
    fn device_topic_uses_manufacturer_and_stable_address() {
        assert_eq!(device_topic("Keeson", &bed()), "keeson/aabbccddeeff");
    }

    #[test]
    fn unique_id_combines_device_name_and_tag() {
        assert_eq!(unique_id(&bed(), "Preset Zero-G"), "living_room_bed_preset_zero_g");
    }
}
