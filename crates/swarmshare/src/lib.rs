pub mod activity;
pub mod choker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod piece_store;
pub mod swarm;
pub mod transport;

pub use activity::{Activity, ActivityLog, ACTIVITY_TARGET};
pub use config::{CommonConfig, ConfigError, PeerConfig, PeerInfo, Roster, Timing};
pub use coordinator::Coordinator;
pub use error::SwarmError;
pub use piece_store::{PieceLayout, PieceStore, StoreError};
pub use swarm::Swarm;
pub use swarmshare_proto::PeerId;
