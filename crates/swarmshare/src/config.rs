use std::path::{Path, PathBuf};
use std::time::Duration;
use swarmshare_proto::PeerId;
use thiserror::Error;

use crate::piece_store::PieceLayout;

pub const COMMON_CONFIG_FILE: &str = "Common.cfg";
pub const PEER_INFO_FILE: &str = "PeerInfo.cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("missing key {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("malformed roster line {line}: {content:?}")]
    RosterLine { line: usize, content: String },
    #[error("peer {0} is not in the roster")]
    UnknownPeer(PeerId),
}

/// Swarm-wide tunables shared by every peer (`Common.cfg`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

impl CommonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&read_file(path.as_ref())?)
    }

    /// Parse `Key Value` lines. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut preferred_neighbors = None;
        let mut unchoking_interval = None;
        let mut optimistic_unchoking_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "NumberOfPreferredNeighbors" => preferred_neighbors = Some(parse_number::<usize>(key, value)?),
                "UnchokingInterval" => unchoking_interval = Some(Duration::from_secs(parse_positive(key, value)?)),
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoking_interval = Some(Duration::from_secs(parse_positive(key, value)?))
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_positive::<u64>(key, value)?),
                "PieceSize" => piece_size = Some(parse_positive::<u32>(key, value)?),
                _ => {}
            }
        }

        Ok(Self {
            preferred_neighbors: preferred_neighbors.ok_or(ConfigError::MissingKey("NumberOfPreferredNeighbors"))?,
            unchoking_interval: unchoking_interval.ok_or(ConfigError::MissingKey("UnchokingInterval"))?,
            optimistic_unchoking_interval: optimistic_unchoking_interval
                .ok_or(ConfigError::MissingKey("OptimisticUnchokingInterval"))?,
            file_name: file_name.ok_or(ConfigError::MissingKey("FileName"))?,
            file_size: file_size.ok_or(ConfigError::MissingKey("FileSize"))?,
            piece_size: piece_size.ok_or(ConfigError::MissingKey("PieceSize"))?,
        })
    }

    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.file_size, self.piece_size)
    }
}

/// One roster entry (`PeerInfo.cfg`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<PeerId>, host: impl Into<String>, port: u16, has_file: bool) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: host.into(),
            port,
            has_file,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ordered list of every swarm member. Order decides who dials whom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<PeerInfo>,
}

impl Roster {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&read_file(path.as_ref())?)
    }

    /// Parse `<peerID> <host> <port> <hasFile>` lines; blank lines and `#`
    /// comments are skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut peers = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let malformed = || ConfigError::RosterLine {
                line: idx + 1,
                content: line.to_string(),
            };
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            let [id, host, port, has_file] = fields[..] else {
                return Err(malformed());
            };
            let port = port.parse::<u16>().map_err(|_| malformed())?;
            let has_file = match has_file {
                "1" => true,
                "0" => false,
                _ => return Err(malformed()),
            };
            peers.push(PeerInfo::new(id, host, port, has_file));
        }
        Ok(Self { peers })
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    /// Entries listed ahead of `peer_id`; these are the peers it dials.
    pub fn preceding(&self, peer_id: &PeerId) -> impl Iterator<Item = &PeerInfo> {
        let peer_id = peer_id.clone();
        self.peers.iter().take_while(move |p| p.peer_id != peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Fixed delays of the peer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay before the first preferred/optimistic round.
    pub scheduler_startup: Duration,
    /// Delay between binding the listener and dialing neighbors.
    pub connect_delay: Duration,
    /// Delay before the termination check first fires.
    pub termination_delay: Duration,
    /// Termination check period is three times this.
    pub termination_base: Duration,
}

impl Timing {
    pub fn termination_period(&self) -> Duration {
        self.termination_base * 3
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            scheduler_startup: Duration::from_secs(2),
            connect_delay: Duration::from_secs(5),
            termination_delay: Duration::from_secs(5),
            termination_base: Duration::from_secs(2),
        }
    }
}

/// Read-only snapshot a peer runs from.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub local: PeerInfo,
    pub common: CommonConfig,
    pub roster: Roster,
    pub work_dir: PathBuf,
    pub timing: Timing,
}

impl PeerConfig {
    pub fn new(local: PeerId, common: CommonConfig, roster: Roster, work_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let local = roster.get(&local).cloned().ok_or(ConfigError::UnknownPeer(local))?;
        Ok(Self {
            local,
            common,
            roster,
            work_dir: work_dir.into(),
            timing: Timing::default(),
        })
    }

    /// Load `Common.cfg` and `PeerInfo.cfg` from `config_dir`.
    pub fn load(local: PeerId, config_dir: impl AsRef<Path>, work_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let common = CommonConfig::load(config_dir.join(COMMON_CONFIG_FILE))?;
        let roster = Roster::load(config_dir.join(PEER_INFO_FILE))?;
        Self::new(local, common, roster, work_dir)
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.local.peer_id
    }

    /// Directory holding this peer's copy of the file.
    pub fn peer_dir(&self) -> PathBuf {
        self.work_dir.join(format!("peer_{}", self.local.peer_id))
    }

    pub fn file_path(&self) -> PathBuf {
        self.peer_dir().join(&self.common.file_name)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_positive<T: std::str::FromStr + PartialEq + Default>(key: &str, value: &str) -> Result<T, ConfigError> {
    let n = parse_number::<T>(key, value)?;
    if n == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(n)
}
