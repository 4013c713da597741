use std::net::SocketAddr;

/// The four directional flags of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ChokingState {
    /// We may send requests: the peer unchoked us and we want its data.
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }
}

/// What a choke policy sees of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeCandidate {
    pub id: u64,
    pub addr: SocketAddr,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub interest_score: u64,
    /// Bytes received from the peer during the last tick.
    pub download_rate: u64,
}

/// Picks which connections hold the unchoke slots.
///
/// Candidates arrive in interest order, highest score first. The returned ids
/// are unchoked and every other candidate is choked; at most `slots` ids are
/// honoured.
pub trait ChokePolicy: Send + Sync {
    fn select(&self, candidates: &[ChokeCandidate], slots: usize) -> Vec<u64>;
}

/// Unchokes the first `slots` candidates that are interested in us.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterestOrder;

impl ChokePolicy for InterestOrder {
    fn select(&self, candidates: &[ChokeCandidate], slots: usize) -> Vec<u64> {
        candidates
            .iter()
            .filter(|c| c.peer_interested)
            .take(slots)
            .map(|c| c.id)
            .collect()
    }
}

/// Runs `policy` and returns `(id, unchoke)` for every candidate whose
/// choke state has to change.
pub fn choke_round(
    policy: &dyn ChokePolicy,
    candidates: &[ChokeCandidate],
    slots: usize,
) -> Vec<(u64, bool)> {
    let mut selected = policy.select(candidates, slots);
    selected.truncate(slots);

    candidates
        .iter()
        .filter_map(|c| {
            let unchoke = selected.contains(&c.id);
            (unchoke == c.am_choking).then_some((c.id, unchoke))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, peer_interested: bool, am_choking: bool) -> ChokeCandidate {
        ChokeCandidate {
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], 6881 + id as u16)),
            peer_interested,
            am_choking,
            interest_score: 0,
            download_rate: 0,
        }
    }

    #[test]
    fn test_interest_order_takes_first_interested() {
        let candidates = [
            candidate(1, false, true),
            candidate(2, true, true),
            candidate(3, true, true),
            candidate(4, true, true),
        ];
        assert_eq!(InterestOrder.select(&candidates, 2), vec![2, 3]);
    }

    #[test]
    fn test_round_reports_only_changes() {
        let candidates = [
            candidate(1, true, false),
            candidate(2, true, true),
            candidate(3, true, false),
            candidate(4, false, true),
        ];
        let decisions = choke_round(&InterestOrder, &candidates, 2);
        assert_eq!(decisions, vec![(2, true), (3, false)]);
    }

    #[test]
    fn test_round_caps_greedy_policy() {
        struct Everyone;
        impl ChokePolicy for Everyone {
            fn select(&self, candidates: &[ChokeCandidate], _slots: usize) -> Vec<u64> {
                candidates.iter().map(|c| c.id).collect()
            }
        }
        let candidates = [candidate(1, true, true), candidate(2, true, true)];
        assert_eq!(choke_round(&Everyone, &candidates, 1), vec![(1, true)]);
    }
}
