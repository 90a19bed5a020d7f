//! Proxy and device event stream.
//!
//! Replaces the source system's pervasive event-emitter-with-manual-add/remove
//! pattern with a single broadcast channel per `ProxyLink`: every listener is
//! a subscription handle that deregisters itself on drop, so reconnect
//! cycles cannot accumulate leaked callbacks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use bedlink_types::BleAdvertisement;

/// Events observed on a proxy connection and fanned out to every interested
/// task: Discovery & Matching, the Device Session owning a given address,
/// and diagnostics.
///
/// Marked `#[non_exhaustive]` to allow new event kinds later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProxyEvent {
    /// A BLE advertisement was observed on this proxy.
    Advertisement(BleAdvertisement),
    /// An asynchronous connect response arrived for `address`. Per §4.2,
    /// receivers MUST NOT treat this as license to issue an implicit
    /// reconnect; it only updates a `connected` flag.
    ConnectResponse { address: u64, connected: bool },
    /// The device at `address` disconnected; `reason` is the proxy's
    /// best-effort description.
    Disconnected { address: u64, reason: String },
    /// A notification payload arrived on a subscribed characteristic.
    Notify {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    /// A line from the proxy's own diagnostic log stream, used by the
    /// connect race in §4.2 to short-circuit hopeless attempts.
    ProxyLogLine { line: String },
    /// The underlying transport transitioned state.
    LinkStateChanged { state: String },
}

pub type EventSender = broadcast::Sender<ProxyEvent>;
pub type EventReceiver = broadcast::Receiver<ProxyEvent>;

/// Fan-out point for one `ProxyLink`'s event stream.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event to every current subscriber. Errors (no receivers) are
    /// intentionally ignored: a quiet proxy link with nobody watching its
    /// advertisements is not a fault.
    pub fn send(&self, event: ProxyEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedlink_types::AddressType;

    #[tokio::test]
    async fn subscribers_receive_sent_events() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(ProxyEvent::Disconnected {
            address: 1,
            reason: "timeout".into(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::Disconnected { address: 1, .. }));
    }

    #[tokio::test]
    async fn advertisement_round_trips_through_channel() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        let adv = BleAdvertisement::new(0x1122_3344_5566, AddressType::Public, -60);
        dispatcher.send(ProxyEvent::Advertisement(adv.clone()));

        match rx.recv().await.unwrap() {
            ProxyEvent::Advertisement(received) => assert_eq!(received.address, adv.address),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_with_no_subscribers_does_not_panic() {
        let dispatcher = EventDispatcher::new(16);
        dispatcher.send(ProxyEvent::LinkStateChanged {
            state: "Ready".into(),
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }
}
