use rand::seq::SliceRandom;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedTracker {
    pub url: String,
    pub rank: i64,
}

/// Tracker tiers with a per-tracker rank.
///
/// Trackers inside a tier are shuffled once at construction; that order
/// breaks rank ties for the life of the ranking. Initial ranks follow tier
/// order, so the first tier starts out highest.
#[derive(Debug, Clone)]
pub struct TrackerRanking {
    tiers: Vec<Vec<RankedTracker>>,
}

impl TrackerRanking {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let tiers: Vec<Vec<String>> = tiers.into_iter().filter(|t| !t.is_empty()).collect();
        let count = tiers.len() as i64;
        let mut rng = rand::rng();

        let tiers = tiers
            .into_iter()
            .enumerate()
            .map(|(i, mut urls)| {
                urls.shuffle(&mut rng);
                urls.into_iter()
                    .map(|url| RankedTracker {
                        url,
                        rank: count - i as i64,
                    })
                    .collect()
            })
            .collect();
        Self { tiers }
    }

    pub fn tiers(&self) -> &[Vec<RankedTracker>] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn rank(&self, url: &str) -> Option<i64> {
        self.find(url).map(|(t, i)| self.tiers[t][i].rank)
    }

    /// Ranks a tracker by the swarm it reported: `2 * seeders + leechers`.
    pub fn record_counts(&mut self, url: &str, seeders: u32, leechers: u32) {
        if let Some((t, i)) = self.find(url) {
            self.tiers[t][i].rank = 2 * seeders as i64 + leechers as i64;
        }
    }

    /// Drops a tracker to rank -1 at the back of its tier.
    pub fn record_failure(&mut self, url: &str) {
        if let Some((t, i)) = self.find(url) {
            let mut tracker = self.tiers[t].remove(i);
            tracker.rank = -1;
            self.tiers[t].push(tracker);
        }
    }

    /// The trackers to contact in one round: the best-ranked member of each
    /// tier, best tier first. Ties go to the earlier position.
    pub fn round(&self) -> Vec<String> {
        let mut picks: Vec<&RankedTracker> = self
            .tiers
            .iter()
            .filter_map(|tier| {
                tier.iter()
                    .reduce(|best, t| if t.rank > best.rank { t } else { best })
            })
            .collect();
        picks.sort_by(|a, b| b.rank.cmp(&a.rank));
        picks.into_iter().map(|t| t.url.clone()).collect()
    }

    fn find(&self, url: &str) -> Option<(usize, usize)> {
        self.tiers.iter().enumerate().find_map(|(t, tier)| {
            tier.iter().position(|tr| tr.url == url).map(|i| (t, i))
        })
    }
}
