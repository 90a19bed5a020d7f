//! Minimal framing for the proxy's TCP API.
//!
//! The real proxy wire protocol is proprietary and binary; this module only
//! needs to satisfy the observed requirements (§6): the connect request
//! carries an address type, and the proxy exposes cached and cache-less
//! connect variants. It is implemented here as length-prefixed JSON —
//! a 4-byte big-endian length header followed by a UTF-8 JSON body — so the
//! rest of the crate can work with plain `serde`-derived request/response
//! types instead of a byte-level codec.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest single frame accepted from the proxy. Guards against a
/// misbehaving proxy (or a desynced stream) driving an unbounded
/// allocation.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Requests this side issues to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyRequest {
    Hello {
        client_info: String,
        password: Option<String>,
    },
    DeviceConnect {
        address: u64,
        address_type: bedlink_types::AddressType,
        without_cache: bool,
    },
    DeviceDisconnect {
        address: u64,
    },
    DeviceClearCache {
        address: u64,
    },
    ListServices {
        address: u64,
    },
    ReadChar {
        address: u64,
        handle: u16,
    },
    WriteChar {
        address: u64,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
    },
    SubscribeNotify {
        address: u64,
        handle: u16,
    },
    SubscribeAdvertisements,
    SubscribeLogs,
}

/// Responses and unsolicited events the proxy sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyResponse {
    HelloAck {
        server_name: String,
        ble_proxy: bool,
    },
    DeviceConnectResponse {
        address: u64,
        connected: bool,
        error: u16,
        mtu: u16,
    },
    ServicesList {
        address: u64,
        services: Vec<GattService>,
    },
    ReadCharResponse {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    WriteCharAck {
        address: u64,
        handle: u16,
    },
    Notify {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    Advertisement(bedlink_types::BleAdvertisement),
    Disconnected {
        address: u64,
        reason: String,
    },
    LogLine {
        line: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: String,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub handle: u16,
}

/// Write one length-prefixed JSON frame to `writer`. Generic over any
/// `AsyncWrite` so it works against a whole `TcpStream` or an owned write
/// half.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &ProxyRequest,
) -> Result<()> {
    let body = serde_json::to_vec(request)
        .map_err(|e| Error::Framing(format!("failed to encode request: {e}")))?;
    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| Error::Framing("request body too large to frame".into()))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame from `reader`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ProxyResponse> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Framing(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::Framing(format!("failed to decode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn round_trips_a_request_and_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let len = socket.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            socket.read_exact(&mut body).await.unwrap();
            let request: ProxyRequest = serde_json::from_slice(&body).unwrap();
            assert!(matches!(request, ProxyRequest::SubscribeAdvertisements));

            let response = ProxyResponse::HelloAck {
                server_name: "m5stack-atom-lite-fdb45c".into(),
                ble_proxy: true,
            };
            write_frame_server_side(&mut socket, &response).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, &ProxyRequest::SubscribeAdvertisements)
            .await
            .unwrap();
        let response = read_frame(&mut client).await.unwrap();
        assert!(matches!(
            response,
            ProxyResponse::HelloAck { ble_proxy: true, .. }
        ));

        server.await.unwrap();
    }

    async fn write_frame_server_side(stream: &mut TcpStream, response: &ProxyResponse) {
        let body = serde_json::to_vec(response).unwrap();
        stream.write_u32(body.len() as u32).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
            socket.flush().await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let result = read_frame(&mut client).await;
        assert!(matches!(result, Err(Error::Framing(_))));

        server.await.unwrap();
    }
}
