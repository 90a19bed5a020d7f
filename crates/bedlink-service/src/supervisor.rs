//! The outer loop (§4.6): open the bus, open every proxy link, run vendor
//! setup, wait for a restart signal, tear down, loop.

use std::sync::{Arc, Mutex as StdMutex};

use tracing::{error, info, warn};

use bedlink_core::{scan_with_self_heal, Candidate, ControllerStatsPort, ProxyLink, SessionRegistry};
use bedlink_types::{BedConfig, DeviceKey, ProxyConfig};

use crate::config::Config;
use crate::entities::{ControllerBuilder, DiscoveryDebouncer, EntityConfig};
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::mqtt::{self, Bus, Incoming};
use crate::pipeline::CommandPipeline;

/// One outer-loop iteration's live state, torn down and rebuilt every pass.
struct Iteration {
    bus: Bus,
    links: Vec<Arc<ProxyLink>>,
    health: Arc<HealthMonitor>,
    router: tokio::task::JoinHandle<()>,
    status_router: tokio::task::JoinHandle<()>,
    /// Set once `run_vendor_setup` has built this iteration's entity list;
    /// `status_router` reads through this slot to debounce
    /// `homeassistant/status` triggers without being re-spawned per scan.
    debouncer: Arc<StdMutex<Option<Arc<DiscoveryDebouncer>>>>,
}

/// Runs forever. Process-level exit handling (§4.6 step 7, §6 exit codes)
/// is the caller's responsibility — this function only returns on an
/// unrecoverable bus-connect failure.
///
/// `health_slot` is kept pointed at the current iteration's
/// [`HealthMonitor`] so a caller racing this future against a shutdown
/// signal (`main.rs`) can still publish a final snapshot on the way out.
pub async fn run(
    config: Config,
    builder: Arc<dyn ControllerBuilder>,
    preferences: Arc<dyn bedlink_core::ConnectPreferences>,
    stats: Arc<dyn ControllerStatsPort>,
    health_slot: Arc<StdMutex<Option<Arc<HealthMonitor>>>>,
) -> Result<()> {
    loop {
        let iteration = start_iteration(&config).await?;
        *health_slot.lock().unwrap() = Some(Arc::clone(&iteration.health));
        run_vendor_setup(&config, &iteration, Arc::clone(&builder), Arc::clone(&preferences), Arc::clone(&stats)).await;

        let restart = iteration.health.wait_for_restart().await;
        info!(kind = ?restart.kind, reason = %restart.reason, "restart signal received, cycling proxy links");
        iteration.health.publish_final_snapshot().await;

        for link in &iteration.links {
            link.close().await;
        }
        iteration.router.abort();
        iteration.status_router.abort();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn start_iteration(config: &Config) -> Result<Iteration> {
    let (bus, eventloop) = Bus::connect(config)?;
    bus.publish_status(false).await.ok();
    let (router, mut incoming) = mqtt::spawn_router(bus.clone(), eventloop);

    let health = Arc::new(HealthMonitor::new(bus.clone(), config.vendor.clone()));
    crate::health::spawn_heartbeat(Arc::clone(&health));
    crate::health::spawn_maintenance_timer(Arc::clone(&health));

    let prefix = format!("{}/proxy/", bus.namespace());
    for proxy in &config.ble_proxies {
        let topic = format!("{prefix}{}/status", proxy.host);
        if let Err(e) = bus.subscribe(topic).await {
            warn!(host = %proxy.host, error = %e, "failed to subscribe to proxy status topic");
        }
    }

    let debouncer: Arc<StdMutex<Option<Arc<DiscoveryDebouncer>>>> = Arc::new(StdMutex::new(None));

    let health_for_router = Arc::clone(&health);
    let debouncer_for_router = Arc::clone(&debouncer);
    let status_router = tokio::spawn(async move {
        while let Some(Incoming::Publish { topic, payload }) = incoming.recv().await {
            if topic == "homeassistant/status" {
                if let Some(d) = debouncer_for_router.lock().unwrap().clone() {
                    d.trigger();
                }
                continue;
            }
            if let Some(rest) = topic.strip_prefix(&prefix) {
                if let Some(host) = rest.strip_suffix("/status") {
                    health_for_router.ingest_proxy_status(host, &payload);
                }
            }
        }
    });

    let links = open_all_links(&config.ble_proxies).await?;

    Ok(Iteration {
        bus,
        links,
        health,
        router,
        status_router,
        debouncer,
    })
}

/// Open every configured proxy link with infinite retry, backoff
/// 5 s → 30 s × 1.5 (§4.6 step 3).
async fn open_all_links(proxies: &[crate::config::ProxyEntryConfig]) -> Result<Vec<Arc<ProxyLink>>> {
    let mut links = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        let proxy_config = ProxyConfig {
            host: proxy.host.clone(),
            port: proxy.port,
            password: proxy.password.clone(),
            encryption_key: proxy.encryption_key.clone(),
            expected_server_name: proxy.expected_server_name.clone(),
        };
        let retry = bedlink_core::RetryConfig::for_proxy_open();
        let link = bedlink_core::with_retry(&retry, "proxy_open", |e| e.is_socket_or_ble_class(), || {
            let proxy_config = proxy_config.clone();
            async move {
                let events = bedlink_core::EventDispatcher::default();
                ProxyLink::open(&proxy_config, events).await
            }
        })
        .await?;
        links.push(Arc::new(link));
    }
    Ok(links)
}

/// §4.6 step 4: discovery + per-bed setup + entity publication.
///
/// A matched advertisement doesn't carry which `ProxyLink` observed it
/// (discovery fans every configured proxy into one stream, §4.3), so the
/// connect attempt races every open link in turn and keeps whichever one
/// answers first — the common single-proxy-per-bed deployment resolves on
/// the first try, and overlapping-coverage deployments still converge.
async fn run_vendor_setup(
    config: &Config,
    iteration: &Iteration,
    builder: Arc<dyn ControllerBuilder>,
    preferences: Arc<dyn bedlink_core::ConnectPreferences>,
    stats: Arc<dyn ControllerStatsPort>,
) {
    let registry = Arc::new(SessionRegistry::new());
    let discovery_retry = bedlink_core::RetryConfig::for_discovery();
    let links = iteration.links.clone();
    let beds = config.beds.clone();

    let scan_result = bedlink_core::with_retry(&discovery_retry, "discovery_scan", |_| true, || {
        let links = links.clone();
        let beds = beds.clone();
        async move {
            scan_with_self_heal(&links, &beds, bedlink_core::SCAN_WINDOW, || {
                let links = links.clone();
                async move {
                    for link in &links {
                        link.subscribe_advertisements().await?;
                    }
                    Ok(())
                }
            })
            .await
        }
    })
    .await;

    let scan_result = match scan_result {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "discovery scan failed after retries");
            return;
        }
    };

    let mut published: Vec<(BedConfig, Vec<EntityConfig>)> = Vec::new();

    for bed in &config.beds {
        let bed_key = bed.stable_identity();
        let Some(advertisements) = scan_result.candidates.get(&bed_key) else {
            warn!(bed = %bed.friendly_name, "no matching advertisement observed this scan");
            continue;
        };

        let now_ms = bedlink_types::now_ms();
        let candidates: Vec<Candidate> = advertisements
            .iter()
            .map(|adv| Candidate {
                controller_key: adv.mac_hex(),
                advertisement: adv.clone(),
            })
            .collect();
        let ranked = bedlink_core::rank(&bed_key, candidates, stats.as_ref(), now_ms);
        let supported: Vec<&Candidate> = ranked
            .iter()
            .filter(|(c, _)| builder.is_supported(&c.advertisement))
            .map(|(c, _)| c)
            .collect();

        if supported.is_empty() {
            warn!(bed = %bed.friendly_name, "no supported controller among candidates");
            continue;
        }

        let mut connected = None;
        for winner in &supported {
            let connect_result = connect_via_any_link(
                &iteration.links,
                &registry,
                winner.advertisement.address,
                winner.advertisement.address_type,
                Arc::clone(&preferences),
            )
            .await;

            let (proxy_host, session) = match connect_result {
                Some(result) => result,
                None => {
                    warn!(bed = %bed.friendly_name, controller = %winner.controller_key, "failed to connect to candidate on any proxy, trying next");
                    if let Err(e) = stats.record_failure(&bed_key, &winner.controller_key, now_ms, "connect failed on every proxy link") {
                        warn!(error = %e, "failed to record controller failure");
                    }
                    continue;
                }
            };

            let controller: Arc<dyn crate::entities::BedController> =
                match builder.build(bed, &winner.advertisement, Arc::clone(&session)) {
                    Ok(controller) => Arc::from(controller),
                    Err(e) => {
                        warn!(bed = %bed.friendly_name, controller = %winner.controller_key, error = %e, "controller build failed, trying next candidate");
                        continue;
                    }
                };

            connected = Some((*winner, proxy_host, session, controller));
            break;
        }

        let Some((winner, proxy_host, session, controller)) = connected else {
            warn!(bed = %bed.friendly_name, "every supported candidate failed to connect or build");
            continue;
        };

        let _ = stats.record_success(&bed_key, &winner.controller_key, now_ms);
        let _ = stats.set_pinned_controller(&bed_key, &winner.controller_key);

        let reconnect_links = iteration.links.clone();
        let reconnect_registry = Arc::clone(&registry);
        let reconnect_preferences = Arc::clone(&preferences);
        let address = winner.advertisement.address;
        let address_type = winner.advertisement.address_type;
        let reconnect: crate::pipeline::ReconnectFn = Arc::new(move || {
            let links = reconnect_links.clone();
            let registry = Arc::clone(&reconnect_registry);
            let preferences = Arc::clone(&reconnect_preferences);
            Box::pin(async move {
                match connect_via_any_link(&links, &registry, address, address_type, preferences).await {
                    Some((_, session)) => Ok(session),
                    None => Err(bedlink_core::Error::socket("reconnect failed on every proxy link")),
                }
            })
        });

        let _pipeline = CommandPipeline::new(
            session,
            reconnect,
            Arc::clone(&iteration.health),
            bed.friendly_name.clone(),
            proxy_host,
            bed.stay_connected,
        );

        published.push((bed.clone(), controller.entities().to_vec()));
    }

    let debouncer = Arc::new(DiscoveryDebouncer::new(iteration.bus.clone(), config.vendor.clone(), published.clone()));
    *iteration.debouncer.lock().unwrap() = Some(Arc::clone(&debouncer));
    if let Err(e) = iteration.bus.subscribe("homeassistant/status").await {
        warn!(error = %e, "failed to subscribe to homeassistant/status");
    }
    if let Err(e) = crate::entities::publish_all_discovery(&iteration.bus, &config.vendor, &published).await {
        warn!(error = %e, "failed to publish entity discovery");
    }
}

async fn connect_via_any_link(
    links: &[Arc<ProxyLink>],
    registry: &Arc<SessionRegistry>,
    address: u64,
    address_type: bedlink_types::AddressType,
    preferences: Arc<dyn bedlink_core::ConnectPreferences>,
) -> Option<(String, Arc<bedlink_core::DeviceSession>)> {
    for link in links {
        let key = DeviceKey::new(link.host().to_string(), address);
        match registry.connect(key, address_type, Arc::clone(link), Arc::clone(&preferences)).await {
            Ok(session) => return Some((link.host().to_string(), session)),
            Err(e) => {
                warn!(proxy_host = %link.host(), error = %e, "connect attempt failed on this link");
            }
        }
    }
    None
}
