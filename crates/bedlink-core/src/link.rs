//! Proxy Link: one TCP session to a network-attached BLE proxy.
//!
//! `ProxyLink` owns the socket, the `Dialing → Authorizing → Ready →
//! Degraded → Closed` state machine, and the single reader task that fans
//! incoming frames out to an [`EventDispatcher`] (for advertisements,
//! connect responses, notifications, and log lines) or back to a waiting
//! request (for call/response operations like `list_services`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use bedlink_types::{AddressType, ProxyConfig};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, ProxyEvent};
use crate::wire::{self, GattService, ProxyRequest, ProxyResponse};

/// Proxy Link states. Only `Ready` accepts BLE operations (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Authorizing,
    Ready,
    Degraded,
    Closed,
}

/// Hard timeout on the whole open sequence (transport connect + handshake).
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded wait for the readiness gate before failing with `ApiNotReady`.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);
/// Internal bound on a single request/response exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-attempt connect timeout (§4.2 step 5).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Result of a `device_connect` request.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOutcome {
    pub connected: bool,
    pub error: u16,
    pub mtu: u16,
}

struct PendingReply {
    reply: oneshot::Sender<ProxyResponse>,
}

/// One open session to a proxy.
pub struct ProxyLink {
    host: String,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    request_lock: Arc<Mutex<()>>,
    pending: Arc<StdMutex<VecDeque<PendingReply>>>,
    state_tx: watch::Sender<LinkState>,
    events: EventDispatcher,
    reader_task: JoinHandle<()>,
}

impl ProxyLink {
    /// Open a proxy link. Completes only after transport connect, the
    /// `Hello`/`HelloAck` exchange, and a BLE-proxy capability check all
    /// succeed. If the proxy presents a different server name than
    /// `config.expected_server_name`, one self-corrected retry is made
    /// using the presented name (§4.1 "name-mismatch auto-correction") —
    /// beyond that, the caller's own retry loop is responsible for further
    /// attempts.
    pub async fn open(config: &ProxyConfig, events: EventDispatcher) -> Result<Self> {
        timeout(OPEN_TIMEOUT, Self::open_inner(config, events))
            .await
            .map_err(|_| Error::socket(format!("proxy open timed out after {OPEN_TIMEOUT:?}")))?
    }

    async fn open_inner(config: &ProxyConfig, events: EventDispatcher) -> Result<Self> {
        let mut expected = config.expected_server_name.clone();

        for attempt in 0..2 {
            match Self::dial_and_handshake(config, expected.as_deref()).await {
                Ok((stream, _server_name, ble_proxy)) => {
                    if !ble_proxy {
                        return Err(Error::socket(
                            "proxy did not advertise BLE-proxy capability",
                        ));
                    }
                    return Ok(Self::from_stream(config.host.clone(), stream, events));
                }
                Err(Error::SocketError(msg)) => {
                    if let Some(corrected) = parse_name_mismatch(&msg) {
                        if attempt == 0 {
                            warn!(
                                proxy_host = %config.host,
                                presented = %corrected,
                                "server name mismatch, pinning to presented name"
                            );
                            expected = Some(corrected);
                            continue;
                        }
                    }
                    return Err(Error::SocketError(msg));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns within two attempts")
    }

    async fn dial_and_handshake(
        config: &ProxyConfig,
        expected_name: Option<&str>,
    ) -> Result<(TcpStream, String, bool)> {
        let addr = format!("{}:{}", config.host, config.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::socket(format!("connect to {addr} failed: {e}")))?;

        let hello = ProxyRequest::Hello {
            client_info: "bedlink".to_string(),
            password: config.password.clone(),
        };
        wire::write_frame(&mut stream, &hello).await?;

        match wire::read_frame(&mut stream).await? {
            ProxyResponse::HelloAck {
                server_name,
                ble_proxy,
            } => {
                if let Some(expected) = expected_name {
                    if expected != server_name {
                        return Err(Error::socket(format!(
                            "Server name mismatch, expected {expected}, got {server_name}"
                        )));
                    }
                }
                Ok((stream, server_name, ble_proxy))
            }
            ProxyResponse::Error { message } => Err(Error::socket(message)),
            other => Err(Error::Framing(format!(
                "expected HelloAck, got {other:?}"
            ))),
        }
    }

    fn from_stream(host: String, stream: TcpStream, events: EventDispatcher) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<StdMutex<VecDeque<PendingReply>>> =
            Arc::new(StdMutex::new(VecDeque::new()));
        let (state_tx, _) = watch::channel(LinkState::Ready);

        let reader_task = tokio::spawn(Self::reader_loop(
            read_half,
            events.clone(),
            Arc::clone(&pending),
            state_tx.clone(),
        ));

        Self {
            host,
            write_half: Arc::new(Mutex::new(write_half)),
            request_lock: Arc::new(Mutex::new(())),
            pending,
            state_tx,
            events,
            reader_task,
        }
    }

    async fn reader_loop(
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        events: EventDispatcher,
        pending: Arc<StdMutex<VecDeque<PendingReply>>>,
        state_tx: watch::Sender<LinkState>,
    ) {
        loop {
            match wire::read_frame(&mut read_half).await {
                Ok(response) => Self::route(response, &events, &pending),
                Err(e) => {
                    debug!(error = %e, "proxy link reader loop ending");
                    let _ = state_tx.send(LinkState::Closed);
                    events.send(ProxyEvent::LinkStateChanged {
                        state: "Closed".into(),
                    });
                    return;
                }
            }
        }
    }

    fn route(
        response: ProxyResponse,
        events: &EventDispatcher,
        pending: &Arc<StdMutex<VecDeque<PendingReply>>>,
    ) {
        match response {
            ProxyResponse::Advertisement(adv) => events.send(ProxyEvent::Advertisement(adv)),
            ProxyResponse::DeviceConnectResponse {
                address, connected, ..
            } => {
                // Per §4.2: always surfaced as an event, never treated as an
                // implicit license to reconnect.
                events.send(ProxyEvent::ConnectResponse { address, connected });
            }
            ProxyResponse::Disconnected { address, reason } => {
                events.send(ProxyEvent::Disconnected { address, reason })
            }
            ProxyResponse::Notify {
                address,
                handle,
                data,
            } => events.send(ProxyEvent::Notify {
                address,
                handle,
                data,
            }),
            ProxyResponse::LogLine { line } => events.send(ProxyEvent::ProxyLogLine { line }),
            other => {
                if let Some(slot) = pending.lock().unwrap().pop_front() {
                    let _ = slot.reply.send(other);
                }
            }
        }
    }

    /// Await readiness with a bounded wait. Fails with `ApiNotReady` if the
    /// link is not `Ready` within `READINESS_TIMEOUT`.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        if *rx.borrow() == LinkState::Ready {
            return Ok(());
        }
        timeout(READINESS_TIMEOUT, async {
            loop {
                if *rx.borrow() == LinkState::Ready {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::api_not_ready(READINESS_TIMEOUT))?;

        if *rx.borrow() == LinkState::Ready {
            Ok(())
        } else {
            Err(Error::api_not_ready(READINESS_TIMEOUT))
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.subscribe().borrow()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn subscribe_advertisements(&self) -> Result<()> {
        self.send_fire_and_forget(ProxyRequest::SubscribeAdvertisements)
            .await
    }

    pub async fn subscribe_logs(&self) -> Result<()> {
        self.send_fire_and_forget(ProxyRequest::SubscribeLogs).await
    }

    async fn send_fire_and_forget(&self, request: ProxyRequest) -> Result<()> {
        self.ready().await?;
        let mut write_half = self.write_half.lock().await;
        wire::write_frame(&mut *write_half, &request).await
    }

    /// Issue a request and await its matching reply, serialized against any
    /// other in-flight request/response exchange on this link.
    async fn request(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        self.ready().await?;
        let _guard = self.request_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push_back(PendingReply { reply: tx });

        {
            let mut write_half = self.write_half.lock().await;
            wire::write_frame(&mut *write_half, &request).await?;
        }

        timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| Error::ble_timeout("proxy request", REQUEST_TIMEOUT))?
            .map_err(|_| Error::socket("proxy link closed while awaiting reply"))
    }

    /// Issue a connect request and wait for its connect-response event.
    /// Bounded by `CONNECT_TIMEOUT` (§4.2 step 5).
    pub async fn device_connect(
        &self,
        address: u64,
        address_type: AddressType,
        without_cache: bool,
    ) -> Result<ConnectOutcome> {
        self.ready().await?;
        let mut events = self.events.subscribe();

        {
            let mut write_half = self.write_half.lock().await;
            wire::write_frame(
                &mut *write_half,
                &ProxyRequest::DeviceConnect {
                    address,
                    address_type,
                    without_cache,
                },
            )
            .await?;
        }

        timeout(CONNECT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(ProxyEvent::ConnectResponse {
                        address: a,
                        connected,
                    }) if a == address => {
                        return Ok(ConnectOutcome {
                            connected,
                            error: 0,
                            mtu: if connected { 23 } else { 0 },
                        });
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return Err(Error::socket("proxy link closed during connect")),
                }
            }
        })
        .await
        .map_err(|_| Error::ble_timeout("device_connect", CONNECT_TIMEOUT))?
    }

    pub async fn device_disconnect(&self, address: u64) -> Result<()> {
        self.send_fire_and_forget(ProxyRequest::DeviceDisconnect { address })
            .await
    }

    pub async fn device_clear_cache(&self, address: u64) -> Result<()> {
        self.send_fire_and_forget(ProxyRequest::DeviceClearCache { address })
            .await
    }

    pub async fn list_services(&self, address: u64) -> Result<Vec<GattService>> {
        match self.request(ProxyRequest::ListServices { address }).await? {
            ProxyResponse::ServicesList { services, .. } => Ok(services),
            ProxyResponse::Error { message } => Err(Error::socket(message)),
            other => Err(Error::Framing(format!("unexpected reply: {other:?}"))),
        }
    }

    pub async fn read_char(&self, address: u64, handle: u16) -> Result<Vec<u8>> {
        match self.request(ProxyRequest::ReadChar { address, handle }).await? {
            ProxyResponse::ReadCharResponse { data, .. } => Ok(data),
            ProxyResponse::Error { message } => Err(Error::socket(message)),
            other => Err(Error::Framing(format!("unexpected reply: {other:?}"))),
        }
    }

    pub async fn write_char(
        &self,
        address: u64,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
    ) -> Result<()> {
        match self
            .request(ProxyRequest::WriteChar {
                address,
                handle,
                data,
                with_response,
            })
            .await?
        {
            ProxyResponse::WriteCharAck { .. } => Ok(()),
            ProxyResponse::Error { message } => Err(Error::write_failed(handle, message)),
            other => Err(Error::Framing(format!("unexpected reply: {other:?}"))),
        }
    }

    pub async fn subscribe_notify(&self, address: u64, handle: u16) -> Result<()> {
        self.send_fire_and_forget(ProxyRequest::SubscribeNotify { address, handle })
            .await
    }

    /// Close the link: mark `Closed`, abort the reader task, and shut down
    /// the socket. Must be called before opening a replacement link for the
    /// same host, or the proxy's single-subscriber slot stays held (§4.1).
    pub async fn close(&self) {
        let _ = self.state_tx.send(LinkState::Closed);
        self.reader_task.abort();
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }
}

/// Parses `Server name mismatch, expected X, got Y` and returns `Y`.
fn parse_name_mismatch(message: &str) -> Option<String> {
    let marker = "got ";
    if !message.contains("Server name mismatch") {
        return None;
    }
    message
        .rfind(marker)
        .map(|idx| message[idx + marker.len()..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_mismatch_message() {
        let msg = "Server name mismatch, expected 10.0.0.111, got m5stack-atom-lite-fdb45c";
        assert_eq!(
            parse_name_mismatch(msg).as_deref(),
            Some("m5stack-atom-lite-fdb45c")
        );
    }

    #[test]
    fn non_mismatch_message_returns_none() {
        assert_eq!(parse_name_mismatch("ECONNRESET"), None);
    }
}
