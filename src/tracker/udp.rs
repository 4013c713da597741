use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, ScrapeStats};
use crate::constants::{UDP_CONNECTION_TTL, UDP_MAX_BACKOFF_EXPONENT, UDP_PROTOCOL_ID};
use crate::metainfo::InfoHash;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// A UDP tracker (BEP-15).
///
/// The connection id from the connect exchange is cached and refreshed
/// transparently once it is older than a minute. Every exchange is retried
/// on timeout with a fresh transaction id, doubling the wait each attempt.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    connection: Option<(u64, Instant)>,
    timeout: Duration,
    retries: u32,
}

impl UdpTracker {
    /// Resolves the tracker host and binds a socket for it. No packets are
    /// sent until the first request.
    pub async fn bind(url: &str, timeout: Duration, retries: u32) -> Result<Self, TrackerError> {
        let (host, port) = parse_udp_url(url)?;
        let mut resolved = lookup_host((host.as_str(), port))
            .await
            .map_err(|_| TrackerError::Unresolved(host.clone()))?;
        let addr = resolved
            .next()
            .ok_or_else(|| TrackerError::Unresolved(host.clone()))?;

        let local: SocketAddr = if addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        Ok(Self {
            socket,
            addr,
            connection: None,
            timeout,
            retries,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let mut body = self
            .exchange(ACTION_ANNOUNCE, |transaction_id| {
                let mut buf = BytesMut::with_capacity(98);
                buf.put_u64(connection_id);
                buf.put_u32(ACTION_ANNOUNCE);
                buf.put_u32(transaction_id);
                buf.put_slice(request.info_hash.as_bytes());
                buf.put_slice(request.peer_id.as_bytes());
                buf.put_u64(request.stats.downloaded);
                buf.put_u64(request.stats.left);
                buf.put_u64(request.stats.uploaded);
                buf.put_u32(request.event.as_udp_id());
                buf.put_u32(0); // IP address: use the sender's
                buf.put_u32(request.key);
                buf.put_i32(request.numwant.map_or(-1, |n| n.min(i32::MAX as u32) as i32));
                buf.put_u16(request.port);
                buf
            })
            .await?;

        if body.len() < 12 {
            return Err(TrackerError::InvalidResponse("announce response too short".into()));
        }
        let interval = body.get_u32();
        let leechers = body.get_u32();
        let seeders = body.get_u32();

        Ok(AnnounceResponse {
            interval: Some(interval),
            complete: Some(seeders),
            incomplete: Some(leechers),
            peers: parse_compact_peers(&body),
            ..AnnounceResponse::default()
        })
    }

    pub async fn scrape(&mut self, info_hash: &InfoHash) -> Result<ScrapeStats, TrackerError> {
        let connection_id = self.connection_id().await?;
        let mut body = self
            .exchange(ACTION_SCRAPE, |transaction_id| {
                let mut buf = BytesMut::with_capacity(36);
                buf.put_u64(connection_id);
                buf.put_u32(ACTION_SCRAPE);
                buf.put_u32(transaction_id);
                buf.put_slice(info_hash.as_bytes());
                buf
            })
            .await?;

        if body.len() < 12 {
            return Err(TrackerError::InvalidResponse("scrape response too short".into()));
        }
        let complete = body.get_u32();
        let downloaded = body.get_u32();
        let incomplete = body.get_u32();
        Ok(ScrapeStats {
            complete,
            incomplete,
            downloaded,
        })
    }

    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = self.connection {
            if obtained.elapsed() < UDP_CONNECTION_TTL {
                return Ok(id);
            }
        }

        let mut body = self
            .exchange(ACTION_CONNECT, |transaction_id| {
                let mut buf = BytesMut::with_capacity(16);
                buf.put_u64(UDP_PROTOCOL_ID);
                buf.put_u32(ACTION_CONNECT);
                buf.put_u32(transaction_id);
                buf
            })
            .await?;
        if body.len() < 8 {
            return Err(TrackerError::InvalidResponse("connect response too short".into()));
        }
        let id = body.get_u64();
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Sends a request built by `build` and returns the reply payload after
    /// the action and transaction id.
    ///
    /// Each of the `1 + retries` attempts uses a fresh transaction id and
    /// waits `timeout * 2^attempt`. Replies carrying another transaction id
    /// are late answers to an earlier attempt and are skipped.
    async fn exchange(
        &self,
        action: u32,
        build: impl Fn(u32) -> BytesMut,
    ) -> Result<BytesMut, TrackerError> {
        let mut buf = vec![0u8; 2048];

        for attempt in 0..=self.retries {
            let transaction_id: u32 = rand::rng().random();
            self.socket.send(&build(transaction_id)).await?;
            let deadline = Instant::now() + attempt_timeout(self.timeout, attempt);

            loop {
                let n = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                if n < 8 {
                    return Err(TrackerError::InvalidResponse("packet too short".into()));
                }

                let mut reply = BytesMut::from(&buf[..n]);
                let got_action = reply.get_u32();
                let got_transaction = reply.get_u32();
                if got_transaction != transaction_id {
                    tracing::trace!(tracker = %self.addr, "skipping stale transaction");
                    continue;
                }
                if got_action == ACTION_ERROR {
                    return Err(TrackerError::Failure(
                        String::from_utf8_lossy(&reply).into_owned(),
                    ));
                }
                if got_action != action {
                    return Err(TrackerError::InvalidResponse(format!(
                        "expected action {}, got {}",
                        action, got_action
                    )));
                }
                return Ok(reply);
            }

            tracing::debug!(tracker = %self.addr, attempt, "udp request timed out");
        }

        Err(TrackerError::Timeout)
    }
}

/// `base * 2^attempt`, the exponent capped at [`UDP_MAX_BACKOFF_EXPONENT`].
pub(super) fn attempt_timeout(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.min(UDP_MAX_BACKOFF_EXPONENT))
}

/// Splits `udp://host:port/...` into host and port.
fn parse_udp_url(url: &str) -> Result<(String, u16), TrackerError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| TrackerError::InvalidUrl(url.to_string()))?;
    if parsed.scheme() != "udp" {
        return Err(TrackerError::UnsupportedProtocol(parsed.scheme().to_string()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed
        .port()
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    Ok((host, port))
}
