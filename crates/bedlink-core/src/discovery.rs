//! Discovery & Matching: advertisement scanning, tolerant identifier
//! matching, and silent-scan self-heal (§4.3).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::warn;

use bedlink_types::{matches_identifier, BedConfig, BleAdvertisement};

use crate::error::Result;
use crate::events::ProxyEvent;
use crate::link::ProxyLink;

/// Upper bound on one scan cycle (§4.3, §5).
pub const SCAN_WINDOW: Duration = Duration::from_secs(30);

/// Advertisements grouped by the bed identity they matched, plus the total
/// count of advertisements observed (used by the silent-scan self-heal
/// check).
#[derive(Debug, Default)]
pub struct ScanResult {
    pub candidates: HashMap<String, Vec<BleAdvertisement>>,
    pub advertisement_count: usize,
}

/// Run one scan cycle across every link, accumulating candidates per bed
/// until `window` elapses. Unnamed advertisements are accepted (matching
/// falls back to the 12-hex MAC). Duplicate addresses within the window are
/// ignored after their first sighting.
pub async fn scan_once(
    links: &[Arc<ProxyLink>],
    beds: &[BedConfig],
    window: Duration,
) -> Result<ScanResult> {
    for link in links {
        link.subscribe_advertisements().await?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<BleAdvertisement>();
    let mut forward_tasks = Vec::with_capacity(links.len());
    for link in links {
        let mut events = link.subscribe_events();
        let tx = tx.clone();
        forward_tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProxyEvent::Advertisement(adv)) => {
                        if tx.send(adv).is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));
    }
    drop(tx);

    let mut seen_addresses = HashSet::new();
    let mut pending: HashMap<String, HashSet<String>> = beds
        .iter()
        .map(|bed| (bed.stable_identity(), bed.identifier_variants().into_iter().collect()))
        .collect();
    let mut candidates: HashMap<String, Vec<BleAdvertisement>> = HashMap::new();
    let mut advertisement_count = 0usize;

    let deadline = TokioInstant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(TokioInstant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(adv)) => {
                advertisement_count += 1;
                if !seen_addresses.insert(adv.address) {
                    continue;
                }

                let name = adv.effective_name();
                let mac = adv.mac_hex();

                for (bed_key, identifiers) in pending.iter_mut() {
                    if identifiers.is_empty() {
                        continue;
                    }
                    let matched = identifiers
                        .iter()
                        .any(|id| matches_identifier(&name, &mac, id));
                    if matched {
                        // Consume every identifier of this bed at once: a
                        // single advertisement already fully identifies it,
                        // and leaving partial identifiers pending would
                        // starve completion despite discovery being done.
                        identifiers.clear();
                        candidates.entry(bed_key.clone()).or_default().push(adv.clone());
                    }
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    for task in forward_tasks {
        task.abort();
    }

    Ok(ScanResult {
        candidates,
        advertisement_count,
    })
}

/// Scan once; if zero advertisements were observed across every link,
/// perform one full reconnect (via `reconnect_all`) and scan once more.
/// Preserves "one reconnect per call" even if the caller's own retry loop
/// invokes this again immediately (§9 open question 1).
pub async fn scan_with_self_heal<F, Fut>(
    links: &[Arc<ProxyLink>],
    beds: &[BedConfig],
    window: Duration,
    reconnect_all: F,
) -> Result<ScanResult>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let first = scan_once(links, beds, window).await?;
    if first.advertisement_count > 0 {
        return Ok(first);
    }

    warn!("Scan timed out with 0 advertisements seen");
    reconnect_all().await?;
    scan_once(links, beds, window).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedlink_types::AddressType;

    #[test]
    fn scan_result_default_is_empty() {
        let result = ScanResult::default();
        assert_eq!(result.advertisement_count, 0);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn pending_identifiers_are_cleared_together() {
        let bed = BedConfig {
            friendly_name: "Bed 1".into(),
            name: "aabbccddeeff".into(),
            stay_connected: false,
            aliases: "other-name".into(),
            extra_identifiers: Vec::new(),
        };
        let mut pending: HashMap<String, HashSet<String>> = HashMap::new();
        pending.insert(bed.stable_identity(), bed.identifier_variants().into_iter().collect());

        let adv = BleAdvertisement {
            name: Some("aabbccddeeff".into()),
            address: 0xaabb_ccdd_eeff,
            address_type: AddressType::Public,
            rssi: -60,
            manufacturer_data: Vec::new(),
            service_uuids: Vec::new(),
        };

        let name = adv.effective_name();
        let mac = adv.mac_hex();
        for identifiers in pending.values_mut() {
            if identifiers.iter().any(|id| matches_identifier(&name, &mac, id)) {
                identifiers.clear();
            }
        }

        assert!(pending.values().all(|s| s.is_empty()));
    }
}
