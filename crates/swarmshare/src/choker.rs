use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use swarmshare_proto::{Message, PeerId};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityLog};
use crate::error::SwarmError;
use crate::swarm::Swarm;

/// Fire-and-forget delivery of a message to a connected neighbor.
pub trait Outbound: Send + Sync {
    fn send(&self, peer: &PeerId, message: Message) -> Result<(), SwarmError>;
}

/// Hooks the termination check needs from its owner.
pub trait Terminate: Send + Sync {
    fn is_shut_down(&self) -> bool;
    fn terminate_connections(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Continue,
    /// Nobody to serve and every peer holds the whole file.
    SwarmComplete,
}

/// A periodic neighbor-selection policy.
pub trait Scheduler: Send {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    fn round(&mut self, out: &dyn Outbound) -> RoundOutcome;
}

/// Pick up to `k` preferred neighbors from `interested`.
///
/// Once we hold the whole file there is no download signal left, so the
/// choice is a uniform sample. Otherwise peers are ranked by descending rate;
/// equal rates keep the ascending order of the rate table.
pub fn select_preferred(
    interested: &HashSet<PeerId>,
    rates: &BTreeMap<PeerId, u32>,
    k: usize,
    local_complete: bool,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    let k = k.min(interested.len());
    let mut candidates: Vec<&PeerId> = interested.iter().collect();
    candidates.sort();
    if local_complete {
        return candidates.choose_multiple(rng, k).map(|p| (*p).clone()).collect();
    }
    candidates.sort_by_key(|p| std::cmp::Reverse(rates.get(*p).copied().unwrap_or(0)));
    candidates.into_iter().take(k).cloned().collect()
}

/// Uniformly pick one optimistic candidate.
pub fn select_optimistic(candidates: &[PeerId], rng: &mut impl Rng) -> Option<PeerId> {
    candidates.choose(rng).cloned()
}

fn deliver(out: &dyn Outbound, peer: &PeerId, message: Message, failures: &mut Vec<(PeerId, SwarmError)>) {
    if let Err(err) = out.send(peer, message) {
        failures.push((peer.clone(), err));
    }
}

fn report(scheduler: &str, failures: Vec<(PeerId, SwarmError)>) {
    for (peer, err) in failures {
        warn!(scheduler, peer = %peer, error = %err, "send failed during round");
    }
}

pub struct PreferredNeighborScheduler {
    swarm: Arc<Swarm>,
    log: ActivityLog,
    preferred_neighbors: usize,
    period: Duration,
    rng: StdRng,
}

impl PreferredNeighborScheduler {
    pub fn new(swarm: Arc<Swarm>, log: ActivityLog, preferred_neighbors: usize, period: Duration) -> Self {
        Self {
            swarm,
            log,
            preferred_neighbors,
            period,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }
}

impl Scheduler for PreferredNeighborScheduler {
    fn name(&self) -> &'static str {
        "preferred"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn round(&mut self, out: &dyn Outbound) -> RoundOutcome {
        let k = self.preferred_neighbors;
        let rng = &mut self.rng;
        let change = self
            .swarm
            .rotate_preferred(|interested, rates, local_complete| select_preferred(interested, rates, k, local_complete, rng));

        let mut failures = Vec::new();
        let optimistic = change.optimistic.as_ref();
        for peer in &change.selected {
            if !change.previous.contains(peer) && optimistic != Some(peer) {
                deliver(out, peer, Message::Unchoke, &mut failures);
            }
        }
        if !change.selected.is_empty() {
            self.log.record(Activity::PreferredNeighbors(&change.selected));
        }
        // The optimistic peer stays unchoked through its own slot until the
        // optimistic round demotes it; choking it here would cut that slot short.
        for peer in &change.previous {
            if !change.selected.contains(peer) && optimistic != Some(peer) {
                deliver(out, peer, Message::Choke, &mut failures);
            }
        }
        debug!(selected = ?change.selected, "preferred round done");
        report(self.name(), failures);

        if change.swarm_complete {
            RoundOutcome::SwarmComplete
        } else {
            RoundOutcome::Continue
        }
    }
}

pub struct OptimisticUnchokeScheduler {
    swarm: Arc<Swarm>,
    log: ActivityLog,
    period: Duration,
    rng: StdRng,
}

impl OptimisticUnchokeScheduler {
    pub fn new(swarm: Arc<Swarm>, log: ActivityLog, period: Duration) -> Self {
        Self {
            swarm,
            log,
            period,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }
}

impl Scheduler for OptimisticUnchokeScheduler {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn round(&mut self, out: &dyn Outbound) -> RoundOutcome {
        let rng = &mut self.rng;
        let change = self.swarm.rotate_optimistic(|candidates| select_optimistic(candidates, rng));

        let mut failures = Vec::new();
        if let Some(peer) = &change.chosen {
            deliver(out, peer, Message::Unchoke, &mut failures);
            self.log.record(Activity::OptimisticNeighbor(peer));
        }
        if let Some(peer) = &change.demoted {
            deliver(out, peer, Message::Choke, &mut failures);
        }
        report(self.name(), failures);

        if change.swarm_complete {
            RoundOutcome::SwarmComplete
        } else {
            RoundOutcome::Continue
        }
    }
}

/// Drive `scheduler` every period after `startup` until cancelled or the
/// swarm completes.
pub async fn run_scheduler<S: Scheduler>(
    mut scheduler: S,
    startup: Duration,
    out: Arc<dyn Outbound>,
    cancel: CancellationToken,
) -> RoundOutcome {
    let mut ticker = interval_at(Instant::now() + startup, scheduler.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(scheduler = scheduler.name(), "scheduler cancelled");
                return RoundOutcome::Continue;
            }
            _ = ticker.tick() => {
                if scheduler.round(out.as_ref()) == RoundOutcome::SwarmComplete {
                    info!(scheduler = scheduler.name(), "swarm complete");
                    return RoundOutcome::SwarmComplete;
                }
            }
        }
    }
}

/// Armed once shutdown starts; force-closes whatever connections remain.
#[derive(Debug, Clone, Copy)]
pub struct TerminationScheduler {
    delay: Duration,
    period: Duration,
}

impl TerminationScheduler {
    pub fn new(delay: Duration, period: Duration) -> Self {
        Self { delay, period }
    }

    pub async fn run(self, target: &dyn Terminate) {
        let mut ticker = interval_at(Instant::now() + self.delay, self.period);
        loop {
            ticker.tick().await;
            if target.is_shut_down() {
                target.terminate_connections();
                return;
            }
        }
    }
}
