use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng as _;
use reqwest::Client;
use tokio::sync::{watch, Mutex as TokioMutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::error::TrackerError;
use super::http::HttpTracker;
use super::ranking::TrackerRanking;
use super::response::{
    AnnounceRequest, AnnounceResponse, AnnounceStats, Peer, ScrapeStats, TrackerEvent,
};
use super::schedule::{Contact, ContactKind, Schedule};
use super::udp::UdpTracker;
use crate::config::TrackerConfig;
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// The wire side of tracker contact, one call per request.
pub trait TrackerBackend: Send + Sync {
    fn announce<'a>(
        &'a self,
        url: &'a str,
        request: &'a AnnounceRequest,
    ) -> BoxFuture<'a, Result<AnnounceResponse, TrackerError>>;

    fn scrape<'a>(
        &'a self,
        url: &'a str,
        info_hash: &'a InfoHash,
    ) -> BoxFuture<'a, Result<ScrapeStats, TrackerError>>;
}

/// What the announcer needs from the rest of the client.
pub trait AnnounceHandler: Send + Sync {
    /// Totals to report in the next announce.
    fn stats(&self) -> AnnounceStats;

    /// Peers from a successful announce.
    fn peers_found(&self, peers: Vec<Peer>);
}

/// HTTP and UDP trackers over the network.
///
/// UDP trackers keep their socket and connection id between requests.
pub struct NetworkBackend {
    http: Client,
    udp: DashMap<String, Arc<TokioMutex<UdpTracker>>>,
    config: TrackerConfig,
}

impl NetworkBackend {
    pub fn new(config: TrackerConfig) -> Result<Self, TrackerError> {
        let http = Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self {
            http,
            udp: DashMap::new(),
            config,
        })
    }

    async fn udp_tracker(&self, url: &str) -> Result<Arc<TokioMutex<UdpTracker>>, TrackerError> {
        if let Some(tracker) = self.udp.get(url) {
            return Ok(tracker.clone());
        }
        let tracker = UdpTracker::bind(url, self.config.udp_timeout, self.config.udp_retries).await?;
        let tracker = Arc::new(TokioMutex::new(tracker));
        Ok(self
            .udp
            .entry(url.to_string())
            .or_insert(tracker)
            .clone())
    }

    /// Forgets a UDP tracker's socket after an I/O failure.
    fn evict_on_io(&self, url: &str, e: &TrackerError) {
        if matches!(e, TrackerError::Io(_) | TrackerError::ConnectionRefused) {
            self.udp.remove(url);
        }
    }
}

impl TrackerBackend for NetworkBackend {
    fn announce<'a>(
        &'a self,
        url: &'a str,
        request: &'a AnnounceRequest,
    ) -> BoxFuture<'a, Result<AnnounceResponse, TrackerError>> {
        Box::pin(async move {
            match scheme(url) {
                "http" | "https" => HttpTracker::new(self.http.clone(), url)?.announce(request).await,
                "udp" => {
                    let tracker = self.udp_tracker(url).await?;
                    let result = tracker.lock().await.announce(request).await;
                    if let Err(e) = &result {
                        self.evict_on_io(url, e);
                    }
                    result
                }
                other => Err(TrackerError::UnsupportedProtocol(other.to_string())),
            }
        })
    }

    fn scrape<'a>(
        &'a self,
        url: &'a str,
        info_hash: &'a InfoHash,
    ) -> BoxFuture<'a, Result<ScrapeStats, TrackerError>> {
        Box::pin(async move {
            match scheme(url) {
                "http" | "https" => HttpTracker::new(self.http.clone(), url)?.scrape(info_hash).await,
                "udp" => {
                    let tracker = self.udp_tracker(url).await?;
                    let result = tracker.lock().await.scrape(info_hash).await;
                    if let Err(e) = &result {
                        self.evict_on_io(url, e);
                    }
                    result
                }
                other => Err(TrackerError::UnsupportedProtocol(other.to_string())),
            }
        })
    }
}

fn scheme(url: &str) -> &str {
    url.split_once("://").map_or("", |(scheme, _)| scheme)
}

enum Outcome {
    Announced(AnnounceResponse),
    Scraped(ScrapeStats),
}

/// Keeps in touch with the torrent's trackers.
///
/// [`reannounce`](Self::reannounce) queues one announce and one scrape for
/// the best tracker of every tier, tiers spaced by the configured stagger.
/// [`run`](Self::run) is the scheduler loop: it sleeps until the earliest
/// queued contact or until the queue changes, and hands each due contact to
/// its own task. A tracker that is still busy when its next contact comes up
/// is pushed back by a few seconds.
///
/// Successful responses re-queue an announce after the tracker's interval.
/// Failures demote the tracker and retry after the configured delay.
pub struct Announcer {
    config: TrackerConfig,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    key: u32,
    backend: Arc<dyn TrackerBackend>,
    handler: Arc<dyn AnnounceHandler>,
    ranking: Mutex<TrackerRanking>,
    schedule: Mutex<Schedule>,
    wake: Notify,
    busy: Mutex<HashSet<String>>,
    tracker_ids: Mutex<HashMap<String, String>>,
    stop: watch::Sender<bool>,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TrackerConfig,
        tiers: Vec<Vec<String>>,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        backend: Arc<dyn TrackerBackend>,
        handler: Arc<dyn AnnounceHandler>,
    ) -> Self {
        Self {
            config,
            info_hash,
            peer_id,
            port,
            key: rand::rng().random(),
            backend,
            handler,
            ranking: Mutex::new(TrackerRanking::new(tiers)),
            schedule: Mutex::new(Schedule::new()),
            wake: Notify::new(),
            busy: Mutex::new(HashSet::new()),
            tracker_ids: Mutex::new(HashMap::new()),
            stop: watch::channel(false).0,
        }
    }

    pub fn ranking(&self) -> TrackerRanking {
        self.ranking.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.schedule.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Queues a full announce and scrape round.
    ///
    /// A `Stopped` round replaces everything queued and carries no scrapes;
    /// once a tracker accepts it, that tracker is not contacted again until
    /// the next round.
    pub fn reannounce(&self, event: TrackerEvent) {
        if self.is_stopped() {
            return;
        }
        let round = self.ranking.lock().round();
        debug!(?event, trackers = round.len(), "queueing tracker round");

        let now = Instant::now();
        {
            let mut schedule = self.schedule.lock();
            if event == TrackerEvent::Stopped {
                schedule.clear();
            }
            for (i, url) in round.into_iter().enumerate() {
                let at = now + self.config.tier_stagger * i as u32;
                schedule.push(at, Contact::announce(url.clone(), event));
                if event != TrackerEvent::Stopped {
                    schedule.push(at, Contact::scrape(url));
                }
            }
        }
        self.wake.notify_one();
    }

    /// Cancels every queued and in-flight contact. Later calls do nothing.
    pub fn stop(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        self.schedule.lock().clear();
        self.wake.notify_one();
        debug!("announcer stopped");
    }

    /// Scheduler loop; returns after [`stop`](Self::stop).
    pub async fn run(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        loop {
            let stopped = *stop.borrow_and_update();
            if stopped {
                break;
            }

            let next = self.schedule.lock().next_deadline();
            let sleep = async move {
                match next {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = sleep => {}
                _ = self.wake.notified() => {}
                _ = stop.changed() => {}
            }

            let due = self.schedule.lock().pop_due(Instant::now());
            for contact in due {
                self.dispatch(contact);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, contact: Contact) {
        if self.is_stopped() {
            return;
        }
        if !self.busy.lock().insert(contact.url.clone()) {
            debug!(tracker = %contact.url, "tracker busy, retrying shortly");
            let at = Instant::now() + self.config.busy_retry_delay;
            self.schedule.lock().push(at, contact);
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.contact(&contact).await;
            this.busy.lock().remove(&contact.url);
            this.settle(contact, result);
        });
    }

    async fn contact(&self, contact: &Contact) -> Result<Outcome, TrackerError> {
        let stopped = wait_for_stop(self.stop.subscribe());
        let request = async {
            match contact.kind {
                ContactKind::Announce(event) => {
                    let request = self.request(&contact.url, event);
                    debug!(tracker = %contact.url, ?event, "announcing");
                    self.backend
                        .announce(&contact.url, &request)
                        .await
                        .map(Outcome::Announced)
                }
                ContactKind::Scrape => self
                    .backend
                    .scrape(&contact.url, &self.info_hash)
                    .await
                    .map(Outcome::Scraped),
            }
        };
        tokio::select! {
            result = request => result,
            _ = stopped => Err(TrackerError::Cancelled),
        }
    }

    fn request(&self, url: &str, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            stats: self.handler.stats(),
            event,
            key: self.key,
            numwant: self.config.numwant,
            tracker_id: self.tracker_ids.lock().get(url).cloned(),
        }
    }

    fn settle(&self, contact: Contact, result: Result<Outcome, TrackerError>) {
        let url = contact.url.as_str();
        match result {
            Ok(Outcome::Announced(response)) => {
                if let Some(warning) = &response.warning_message {
                    warn!(tracker = %url, "tracker warning: {}", warning);
                }
                if let Some(id) = &response.tracker_id {
                    self.tracker_ids.lock().insert(url.to_string(), id.clone());
                }
                if let Some((seeders, leechers)) = response.counts() {
                    self.ranking.lock().record_counts(url, seeders, leechers);
                }
                info!(tracker = %url, peers = response.peers.len(), "announce ok");
                if contact.kind == ContactKind::Announce(TrackerEvent::Stopped) {
                    return;
                }
                let next = response.recontact_interval();
                self.handler.peers_found(response.peers);
                self.schedule_announce(url, next);
            }
            Ok(Outcome::Scraped(stats)) => {
                debug!(
                    tracker = %url,
                    seeders = stats.complete,
                    leechers = stats.incomplete,
                    "scrape ok"
                );
                self.ranking
                    .lock()
                    .record_counts(url, stats.complete, stats.incomplete);
                self.schedule_announce(url, crate::constants::DEFAULT_ANNOUNCE_INTERVAL);
            }
            Err(TrackerError::Cancelled) => debug!(tracker = %url, "contact cancelled"),
            Err(TrackerError::ScrapeUnsupported) => debug!(tracker = %url, "scrape not supported"),
            Err(e) if e.is_retryable() => {
                warn!(tracker = %url, "tracker failed: {}", e);
                self.ranking.lock().record_failure(url);
                if self.is_stopped() {
                    return;
                }
                {
                    let mut schedule = self.schedule.lock();
                    if schedule.has_like(&contact) {
                        return;
                    }
                    schedule.push(Instant::now() + self.config.retry_interval, contact);
                }
                self.wake.notify_one();
            }
            Err(e) => {
                warn!(tracker = %url, "tracker unusable: {}", e);
                self.ranking.lock().record_failure(url);
            }
        }
    }

    /// Queues a plain announce after `delay` unless one is already queued.
    fn schedule_announce(&self, url: &str, delay: std::time::Duration) {
        if self.is_stopped() {
            return;
        }
        {
            let mut schedule = self.schedule.lock();
            if schedule.has_announce(url) {
                return;
            }
            schedule.push(Instant::now() + delay, Contact::announce(url, TrackerEvent::None));
        }
        self.wake.notify_one();
    }
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow_and_update();
        if stopped {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
