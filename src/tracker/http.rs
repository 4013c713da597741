use std::net::{IpAddr, SocketAddr};

use reqwest::Client;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, Peer, ScrapeStats,
};
use crate::bencode::{decode, Value};
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// An HTTP(S) tracker. Cheap to build; the client carries the connection pool.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(client: Client, url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = announce_url(&self.url, request);
        tracing::trace!(tracker = %self.url, "GET {}", url);
        let body = self.get(&url).await?;
        parse_announce(&body)
    }

    pub async fn scrape(&self, info_hash: &InfoHash) -> Result<ScrapeStats, TrackerError> {
        let base = scrape_url(&self.url).ok_or(TrackerError::ScrapeUnsupported)?;
        let url = format!(
            "{}{}info_hash={}",
            base,
            separator(&base),
            url_encode(info_hash.as_bytes())
        );
        let body = self.get(&url).await?;
        parse_scrape(&body, info_hash)
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes, TrackerError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }
}

/// Builds the announce GET URL with every query parameter.
pub fn announce_url(base: &str, request: &AnnounceRequest) -> String {
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={:08x}",
        base,
        separator(base),
        url_encode(request.info_hash.as_bytes()),
        url_encode(request.peer_id.as_bytes()),
        request.port,
        request.stats.uploaded,
        request.stats.downloaded,
        request.stats.left,
        request.key,
    );

    let event = request.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }
    if let Some(numwant) = request.numwant {
        url.push_str(&format!("&numwant={}", numwant));
    }
    if let Some(id) = &request.tracker_id {
        url.push_str("&trackerid=");
        url.push_str(&url_encode(id.as_bytes()));
    }
    url
}

/// Swaps a trailing `announce` path segment for `scrape`, keeping any
/// suffix and query. `None` when the last segment does not start with
/// `announce`.
pub fn scrape_url(announce: &str) -> Option<String> {
    let (path, query) = match announce.find('?') {
        Some(pos) => announce.split_at(pos),
        None => (announce, ""),
    };
    let slash = path.rfind('/')?;
    let segment = &path[slash + 1..];
    let rest = segment.strip_prefix("announce")?;
    Some(format!("{}scrape{}{}", &path[..=slash], rest, query))
}

fn separator(url: &str) -> char {
    if url.contains('?') {
        '&'
    } else {
        '?'
    }
}

pub fn parse_announce(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    dict_of(&value)?;

    if let Some(reason) = value.get(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        return Err(TrackerError::Failure(reason));
    }

    let seconds = |key: &[u8]| value.get_u64(key).map(|v| v.min(u32::MAX as u64) as u32);
    let text = |key: &[u8]| value.get(key).and_then(Value::as_str).map(String::from);

    let peers = match value.get(b"peers") {
        Some(Value::Bytes(packed)) => parse_compact_peers(packed),
        Some(Value::List(list)) => list.iter().filter_map(dict_peer).collect(),
        Some(_) => return Err(TrackerError::InvalidResponse("bad peers field".into())),
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: seconds(b"interval"),
        min_interval: seconds(b"min interval"),
        min_request_interval: seconds(b"min_request_interval"),
        complete: seconds(b"complete"),
        incomplete: seconds(b"incomplete"),
        peers,
        warning_message: text(b"warning message"),
        tracker_id: text(b"tracker id"),
    })
}

/// A peer in the non-compact list form: `{ip, port, peer id}`.
fn dict_peer(value: &Value) -> Option<Peer> {
    let ip: IpAddr = value.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(value.get_u64(b"port")?).ok()?;
    let peer_id = value
        .get(b"peer id")
        .and_then(Value::as_bytes)
        .and_then(|b| PeerId::from_bytes(b));
    Some(Peer {
        addr: SocketAddr::new(ip, port),
        peer_id,
    })
}

pub fn parse_scrape(body: &[u8], info_hash: &InfoHash) -> Result<ScrapeStats, TrackerError> {
    let value = decode(body)?;
    dict_of(&value)?;

    if let Some(reason) = value.get(b"failure reason").and_then(Value::as_str) {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let entry = value
        .get(b"files")
        .and_then(|files| files.get(info_hash.as_bytes()))
        .ok_or_else(|| TrackerError::InvalidResponse("torrent missing from scrape".into()))?;
    let count = |key: &[u8]| entry.get_u64(key).unwrap_or(0).min(u32::MAX as u64) as u32;

    Ok(ScrapeStats {
        complete: count(b"complete"),
        incomplete: count(b"incomplete"),
        downloaded: count(b"downloaded"),
    })
}

fn dict_of(value: &Value) -> Result<(), TrackerError> {
    match value {
        Value::Dict(_) => Ok(()),
        _ => Err(TrackerError::InvalidResponse("expected dict".into())),
    }
}

/// Percent-encodes everything but RFC 3986 unreserved characters.
pub fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}
