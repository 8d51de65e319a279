use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use swarmshare_proto::{Message, PeerId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, ActivityLog};
use crate::choker::{
    run_scheduler, OptimisticUnchokeScheduler, Outbound, PreferredNeighborScheduler, RoundOutcome, Scheduler,
    Terminate, TerminationScheduler,
};
use crate::config::PeerConfig;
use crate::error::SwarmError;
use crate::peer::PeerConnection;
use crate::piece_store::{PieceLayout, PieceStore};
use crate::swarm::Swarm;
use crate::transport::{self, Transport};

/// Registry entry for a live connection. `id` tells apart successive
/// connections to the same peer.
struct PeerLink {
    id: u64,
    tx: UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// Owns everything one peer runs on: swarm state, piece store, connection
/// registry, listener, dialer and schedulers.
pub struct Coordinator {
    config: PeerConfig,
    swarm: Arc<Swarm>,
    store: PieceStore,
    log: ActivityLog,
    links: DashMap<PeerId, PeerLink>,
    next_link: AtomicU64,
    shutdown_started: AtomicBool,
    shut_down: AtomicBool,
    schedulers: CancellationToken,
    listening: CancellationToken,
    connections: CancellationToken,
    finished: CancellationToken,
}

impl Coordinator {
    /// Build a coordinator without starting any task.
    pub fn new(config: PeerConfig, store: PieceStore, log: ActivityLog) -> Arc<Self> {
        let piece_count = config.common.layout().piece_count();
        let swarm = Swarm::new(
            config.peer_id().clone(),
            piece_count,
            config.roster.iter().map(|p| (p.peer_id.clone(), p.has_file)),
        );
        Arc::new(Self {
            config,
            swarm: Arc::new(swarm),
            store,
            log,
            links: DashMap::new(),
            next_link: AtomicU64::new(0),
            shutdown_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            schedulers: CancellationToken::new(),
            listening: CancellationToken::new(),
            connections: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    /// Bind the roster port on all interfaces and start the peer.
    pub async fn start(config: PeerConfig, log: ActivityLog) -> Result<Arc<Self>, SwarmError> {
        let listener = TcpListener::bind(("0.0.0.0", config.local.port)).await?;
        Self::start_with_listener(config, log, listener).await
    }

    /// Open the piece store and start accepting, dialing and scheduling.
    /// On failure nothing keeps running and the listener is closed.
    pub async fn start_with_listener(
        config: PeerConfig,
        log: ActivityLog,
        listener: TcpListener,
    ) -> Result<Arc<Self>, SwarmError> {
        let store = PieceStore::open(config.file_path(), config.common.layout(), config.local.has_file).await?;
        info!(
            peer = %config.peer_id(),
            local_addr = ?listener.local_addr().ok(),
            pieces = config.common.layout().piece_count(),
            has_file = config.local.has_file,
            "peer started"
        );
        let this = Self::new(config, store, log);
        this.spawn_listener(listener);
        this.spawn_dialer();
        let common = &this.config.common;
        this.spawn_scheduler(PreferredNeighborScheduler::new(
            this.swarm.clone(),
            this.log.clone(),
            common.preferred_neighbors,
            common.unchoking_interval,
        ));
        this.spawn_scheduler(OptimisticUnchokeScheduler::new(
            this.swarm.clone(),
            this.log.clone(),
            common.optimistic_unchoking_interval,
        ));
        Ok(this)
    }

    pub fn local_id(&self) -> &PeerId {
        self.config.peer_id()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn layout(&self) -> PieceLayout {
        self.store.layout()
    }

    /// Largest acceptable frame body: a full piece message or a bitfield.
    pub fn max_frame_len(&self) -> usize {
        let layout = self.layout();
        let piece = 1 + 4 + layout.piece_size() as usize;
        let bitfield = 1 + layout.piece_count().div_ceil(8);
        piece.max(bitfield)
    }

    /// Token for a new connection; cancelled when connections are terminated.
    pub fn connection_token(&self) -> CancellationToken {
        self.connections.child_token()
    }

    fn spawn_listener(self: &Arc<Self>, listener: TcpListener) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.listening.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, remote_addr)) => {
                            debug!(%remote_addr, "accepted connection");
                            this.spawn_connection(transport::from_tcp(socket), remote_addr, None);
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
            info!("listener closed");
        });
    }

    /// After the connect delay, dial every roster peer listed before us.
    fn spawn_dialer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.listening.cancelled() => return,
                _ = tokio::time::sleep(this.config.timing.connect_delay) => {}
            }
            let targets: Vec<_> = this.config.roster.preceding(this.local_id()).cloned().collect();
            for info in targets {
                if this.is_shutting_down() {
                    break;
                }
                let stream = match TcpStream::connect(info.address()).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(peer = %info.peer_id, address = %info.address(), error = %err, "dial failed");
                        continue;
                    }
                };
                let remote_addr = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(err) => {
                        warn!(peer = %info.peer_id, error = %err, "dialed socket has no peer address");
                        continue;
                    }
                };
                this.log.record(Activity::ConnectionInitiated(&info.peer_id));
                this.spawn_connection(transport::from_tcp(stream), remote_addr, Some(info.peer_id.clone()));
            }
        });
    }

    fn spawn_connection(self: &Arc<Self>, stream: Transport, remote_addr: SocketAddr, expected: Option<PeerId>) {
        let conn = PeerConnection::new(stream, remote_addr, expected, self.clone(), self.connection_token());
        let this = self.clone();
        tokio::spawn(async move {
            match conn.run().await {
                Ok(()) => {}
                Err(err) if err.is_resource() => this.fail(err).await,
                Err(err) => warn!(%remote_addr, error = %err, "peer connection ended"),
            }
        });
    }

    fn spawn_scheduler<S: Scheduler + 'static>(self: &Arc<Self>, scheduler: S) {
        let this = self.clone();
        let out: Arc<dyn Outbound> = self.clone();
        let startup = self.config.timing.scheduler_startup;
        let cancel = self.schedulers.clone();
        tokio::spawn(async move {
            if run_scheduler(scheduler, startup, out, cancel).await == RoundOutcome::SwarmComplete {
                this.shutdown().await;
            }
        });
    }

    /// Record a handshaken connection; returns its link id.
    pub fn register(&self, peer: &PeerId, tx: UnboundedSender<Message>, cancel: CancellationToken) -> u64 {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed) + 1;
        self.swarm.register_peer(peer);
        if let Some(old) = self.links.insert(peer.clone(), PeerLink { id, tx, cancel }) {
            warn!(peer = %peer, "replacing existing connection");
            old.cancel.cancel();
        }
        id
    }

    /// Remove the registry entry, unless a newer connection already replaced it.
    pub fn unregister(&self, peer: &PeerId, link: u64) {
        self.links.remove_if(peer, |_, l| l.id == link);
    }

    pub fn is_linked(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn linked_peers(&self) -> Vec<PeerId> {
        self.links.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send to every registered connection; returns who it reached.
    pub fn broadcast(&self, message: Message) -> Vec<PeerId> {
        self.linked_peers()
            .into_iter()
            .filter(|peer| match self.send(peer, message.clone()) {
                Ok(()) => true,
                Err(err) => {
                    debug!(peer = %peer, error = %err, "broadcast skipped peer");
                    false
                }
            })
            .collect()
    }

    pub fn broadcast_have(&self, index: u32) {
        let reached = self.broadcast(Message::Have(index));
        debug!(piece = index, peers = reached.len(), "announced piece");
    }

    /// Hand released pieces to neighbors that unchoke us but sit idle.
    pub fn redispatch(&self) {
        for (peer, index) in self.swarm.claim_for_idle_sources() {
            if let Err(err) = self.send(&peer, Message::Request(index)) {
                debug!(peer = %peer, piece = index, error = %err, "could not re-request piece");
                self.swarm.release_claims(&peer);
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Graceful, idempotent shutdown. Remaining connections are force-closed
    /// by the termination scheduler shortly afterwards.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.local_id(), "shutting down");
        self.schedulers.cancel();
        self.swarm.clear_choke_state();
        if let Err(err) = self.store.close().await {
            warn!(error = %err, "closing piece store failed");
        }
        self.listening.cancel();
        self.shut_down.store(true, Ordering::SeqCst);

        let timing = self.config.timing;
        let termination = TerminationScheduler::new(timing.termination_delay, timing.termination_period());
        let this = self.clone();
        tokio::spawn(async move {
            termination.run(&*this).await;
        });
    }

    /// A resource failure takes the whole peer down.
    pub async fn fail(self: &Arc<Self>, err: SwarmError) {
        if self.is_shutting_down() {
            debug!(error = %err, "ignoring error during shutdown");
            return;
        }
        error!(error = %err, "fatal resource error");
        self.shutdown().await;
    }

    /// Resolves once every connection has been terminated after shutdown.
    pub async fn wait_finished(&self) {
        self.finished.cancelled().await
    }
}

impl Outbound for Coordinator {
    fn send(&self, peer: &PeerId, message: Message) -> Result<(), SwarmError> {
        let stale = match self.links.get(peer) {
            None => return Err(SwarmError::PeerUnavailable(peer.clone())),
            Some(link) => match link.tx.send(message) {
                Ok(()) => return Ok(()),
                Err(_) => link.id,
            },
        };
        self.links.remove_if(peer, |_, l| l.id == stale);
        warn!(peer = %peer, "dropped stale connection entry");
        Err(SwarmError::PeerUnavailable(peer.clone()))
    }
}

impl Terminate for Coordinator {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn terminate_connections(&self) {
        let open = self.links.len();
        self.connections.cancel();
        self.links.clear();
        info!(connections = open, "terminated remaining connections");
        self.finished.cancel();
    }
}
