use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use swarmshare_proto::{Bitfield, PeerId};

/// Shared swarm bookkeeping of one peer.
///
/// Every public method takes the lock exactly once, so each read-modify-write
/// sequence is atomic with respect to connection handlers and schedulers.
pub struct Swarm {
    local: PeerId,
    piece_count: usize,
    state: Mutex<SwarmState>,
}

struct SwarmState {
    /// Availability vectors of every known peer, self included.
    availability: HashMap<PeerId, Bitfield>,
    /// Outstanding request per piece.
    requested: Vec<Option<PeerId>>,
    /// Neighbors that declared interest in our pieces.
    interested: HashSet<PeerId>,
    /// Preferred neighbors we currently unchoke.
    unchoked: HashSet<PeerId>,
    optimistic: Option<PeerId>,
    /// Pieces received per neighbor since it was last selected.
    rates: BTreeMap<PeerId, u32>,
    /// Neighbors currently letting us request.
    unchoked_by: HashSet<PeerId>,
}

impl SwarmState {
    fn local<'a>(&'a self, local: &PeerId) -> Option<&'a Bitfield> {
        self.availability.get(local)
    }

    fn interested_in(&self, local: &PeerId, neighbor: &PeerId) -> bool {
        match (self.local(local), self.availability.get(neighbor)) {
            (Some(ours), Some(theirs)) => ours.is_interested_in(theirs),
            _ => false,
        }
    }

    fn all_complete(&self) -> bool {
        self.availability.values().all(Bitfield::is_full)
    }

    fn claim_next(&mut self, local: &PeerId, neighbor: &PeerId) -> Option<u32> {
        let (Some(ours), Some(theirs)) = (self.availability.get(local), self.availability.get(neighbor)) else {
            return None;
        };
        let index = ours.wanted_from(theirs).find(|&i| self.requested[i].is_none())?;
        self.requested[index] = Some(neighbor.clone());
        Some(index as u32)
    }
}

/// Result of one preferred-neighbor selection, computed under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredChange {
    pub selected: Vec<PeerId>,
    pub previous: HashSet<PeerId>,
    pub optimistic: Option<PeerId>,
    /// Only evaluated when nobody was interested.
    pub swarm_complete: bool,
}

/// Result of one optimistic-unchoke selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticChange {
    pub chosen: Option<PeerId>,
    /// Previous optimistic peer that lost its unchoke and must be choked.
    pub demoted: Option<PeerId>,
    /// Only evaluated when no candidate was found.
    pub swarm_complete: bool,
}

impl Swarm {
    /// `initial` lists roster peers and whether they start with the whole file.
    pub fn new(local: PeerId, piece_count: usize, initial: impl IntoIterator<Item = (PeerId, bool)>) -> Self {
        let mut availability: HashMap<PeerId, Bitfield> = initial
            .into_iter()
            .map(|(peer, has_file)| {
                let bits = if has_file { Bitfield::full(piece_count) } else { Bitfield::new(piece_count) };
                (peer, bits)
            })
            .collect();
        availability.entry(local.clone()).or_insert_with(|| Bitfield::new(piece_count));
        Self {
            local,
            piece_count,
            state: Mutex::new(SwarmState {
                availability,
                requested: vec![None; piece_count],
                interested: HashSet::new(),
                unchoked: HashSet::new(),
                optimistic: None,
                rates: BTreeMap::new(),
                unchoked_by: HashSet::new(),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Make sure a newly handshaken neighbor has a vector and a rate counter.
    pub fn register_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        let piece_count = self.piece_count;
        state
            .availability
            .entry(peer.clone())
            .or_insert_with(|| Bitfield::new(piece_count));
        state.rates.entry(peer.clone()).or_insert(0);
    }

    pub fn availability(&self, peer: &PeerId) -> Option<Bitfield> {
        self.state.lock().availability.get(peer).cloned()
    }

    pub fn local_availability(&self) -> Bitfield {
        self.availability(&self.local)
            .unwrap_or_else(|| Bitfield::new(self.piece_count))
    }

    /// Replace a neighbor's vector; returns whether we are now interested in it.
    pub fn set_availability(&self, peer: &PeerId, bits: Bitfield) -> bool {
        let mut state = self.state.lock();
        state.availability.insert(peer.clone(), bits);
        state.interested_in(&self.local, peer)
    }

    /// Record a `have`; returns whether we are interested in the neighbor afterwards.
    pub fn mark_have(&self, peer: &PeerId, index: u32) -> bool {
        let mut state = self.state.lock();
        let piece_count = self.piece_count;
        state
            .availability
            .entry(peer.clone())
            .or_insert_with(|| Bitfield::new(piece_count))
            .set(index as usize);
        state.interested_in(&self.local, peer)
    }

    /// True iff `neighbor` holds a piece we lack.
    pub fn is_interested_in(&self, neighbor: &PeerId) -> bool {
        self.state.lock().interested_in(&self.local, neighbor)
    }

    /// Claim the lowest piece `neighbor` has, we lack, and nobody is fetching yet.
    /// Nothing is claimed from a neighbor that is choking us.
    pub fn claim_next(&self, neighbor: &PeerId) -> Option<u32> {
        let mut state = self.state.lock();
        if !state.unchoked_by.contains(neighbor) {
            return None;
        }
        state.claim_next(&self.local, neighbor)
    }

    pub fn is_unchoked_by(&self, neighbor: &PeerId) -> bool {
        self.state.lock().unchoked_by.contains(neighbor)
    }

    /// Drop every outstanding claim attributed to `neighbor`.
    pub fn release_claims(&self, neighbor: &PeerId) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;
        for slot in state.requested.iter_mut() {
            if slot.as_ref() == Some(neighbor) {
                *slot = None;
                released += 1;
            }
        }
        released
    }

    pub fn claimed_by(&self, index: u32) -> Option<PeerId> {
        self.state.lock().requested.get(index as usize).cloned().flatten()
    }

    /// Book a received piece: set our bit, bump the sender's rate and clear
    /// the claim. Returns how many pieces we now hold, or `None` if we
    /// already had this one.
    pub fn record_download(&self, index: u32, from: &PeerId) -> Option<usize> {
        let mut state = self.state.lock();
        if let Some(slot) = state.requested.get_mut(index as usize) {
            *slot = None;
        }
        let ours = state.availability.get_mut(&self.local)?;
        if ours.has(index as usize) || !ours.set(index as usize) {
            return None;
        }
        let count = ours.count();
        *state.rates.entry(from.clone()).or_insert(0) += 1;
        Some(count)
    }

    pub fn set_unchoked_by(&self, neighbor: &PeerId, unchoked: bool) {
        let mut state = self.state.lock();
        if unchoked {
            state.unchoked_by.insert(neighbor.clone());
        } else {
            state.unchoked_by.remove(neighbor);
        }
    }

    /// For every neighbor that unchokes us but has nothing outstanding, claim
    /// its next piece. Used after claims were released elsewhere.
    pub fn claim_for_idle_sources(&self) -> Vec<(PeerId, u32)> {
        let mut state = self.state.lock();
        let mut sources: Vec<PeerId> = state
            .unchoked_by
            .iter()
            .filter(|p| !state.requested.iter().any(|slot| slot.as_ref() == Some(*p)))
            .cloned()
            .collect();
        sources.sort();
        sources
            .into_iter()
            .filter_map(|peer| state.claim_next(&self.local, &peer).map(|index| (peer, index)))
            .collect()
    }

    pub fn add_interested(&self, peer: &PeerId) {
        self.state.lock().interested.insert(peer.clone());
    }

    pub fn remove_interested(&self, peer: &PeerId) {
        self.state.lock().interested.remove(peer);
    }

    pub fn interested(&self) -> HashSet<PeerId> {
        self.state.lock().interested.clone()
    }

    pub fn clear_interested(&self) {
        self.state.lock().interested.clear();
    }

    /// Swap in a new unchoked set, returning the old one.
    pub fn replace_unchoked(&self, peers: HashSet<PeerId>) -> HashSet<PeerId> {
        std::mem::replace(&mut self.state.lock().unchoked, peers)
    }

    pub fn unchoked(&self) -> HashSet<PeerId> {
        self.state.lock().unchoked.clone()
    }

    pub fn optimistic(&self) -> Option<PeerId> {
        self.state.lock().optimistic.clone()
    }

    pub fn set_optimistic(&self, peer: Option<PeerId>) -> Option<PeerId> {
        std::mem::replace(&mut self.state.lock().optimistic, peer)
    }

    /// Requests are only served to preferred or optimistic neighbors.
    pub fn may_upload_to(&self, peer: &PeerId) -> bool {
        let state = self.state.lock();
        state.unchoked.contains(peer) || state.optimistic.as_ref() == Some(peer)
    }

    pub fn rate(&self, peer: &PeerId) -> u32 {
        self.state.lock().rates.get(peer).copied().unwrap_or(0)
    }

    pub fn increment_rate(&self, peer: &PeerId) {
        *self.state.lock().rates.entry(peer.clone()).or_insert(0) += 1;
    }

    pub fn reset_rate(&self, peer: &PeerId) {
        self.state.lock().rates.insert(peer.clone(), 0);
    }

    pub fn local_piece_total(&self) -> usize {
        self.state.lock().local(&self.local).map_or(0, Bitfield::count)
    }

    pub fn is_local_complete(&self) -> bool {
        self.state.lock().local(&self.local).is_some_and(Bitfield::is_full)
    }

    /// Swarm-wide completion: every known vector, ours included, is full.
    pub fn is_complete(&self) -> bool {
        self.state.lock().all_complete()
    }

    /// Shutdown condition: we hold everything and so does everyone we know.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.local(&self.local).is_some_and(Bitfield::is_full) && state.all_complete()
    }

    /// Forget all choke and interest state.
    pub fn clear_choke_state(&self) {
        let mut state = self.state.lock();
        state.unchoked.clear();
        state.optimistic = None;
        state.interested.clear();
    }

    /// One preferred-neighbor round. `select` sees the interested set, the
    /// rate table and whether we hold the whole file; the chosen peers get
    /// their rates reset and become the new unchoked set.
    pub fn rotate_preferred<F>(&self, select: F) -> PreferredChange
    where
        F: FnOnce(&HashSet<PeerId>, &BTreeMap<PeerId, u32>, bool) -> Vec<PeerId>,
    {
        let mut state = self.state.lock();
        if state.interested.is_empty() {
            let previous = std::mem::take(&mut state.unchoked);
            return PreferredChange {
                selected: Vec::new(),
                previous,
                optimistic: state.optimistic.clone(),
                swarm_complete: state.all_complete(),
            };
        }
        let local_complete = state.local(&self.local).is_some_and(Bitfield::is_full);
        let selected = select(&state.interested, &state.rates, local_complete);
        for peer in &selected {
            state.rates.insert(peer.clone(), 0);
        }
        let previous = std::mem::replace(&mut state.unchoked, selected.iter().cloned().collect());
        PreferredChange {
            selected,
            previous,
            optimistic: state.optimistic.clone(),
            swarm_complete: false,
        }
    }

    /// One optimistic-unchoke round. Candidates are interested neighbors that
    /// are neither the current optimistic peer nor already unchoked, sorted.
    pub fn rotate_optimistic<F>(&self, select: F) -> OptimisticChange
    where
        F: FnOnce(&[PeerId]) -> Option<PeerId>,
    {
        let mut state = self.state.lock();
        let current = state.optimistic.clone();
        let mut candidates: Vec<PeerId> = state
            .interested
            .iter()
            .filter(|p| Some(*p) != current.as_ref() && !state.unchoked.contains(*p))
            .cloned()
            .collect();
        candidates.sort();
        let chosen = select(&candidates);
        let previous = std::mem::replace(&mut state.optimistic, chosen.clone());
        let demoted = previous.filter(|p| !state.unchoked.contains(p));
        let swarm_complete = chosen.is_none() && state.all_complete();
        OptimisticChange {
            chosen,
            demoted,
            swarm_complete,
        }
    }
}
