use std::fmt;
use swarmshare_proto::PeerId;
use tracing::info;

/// Tracing target the per-peer activity log file subscribes to.
pub const ACTIVITY_TARGET: &str = "swarmshare::activity";

/// One protocol-level event worth recording in the activity log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity<'a> {
    HandshakeReceived(&'a PeerId),
    ConnectionInitiated(&'a PeerId),
    ConnectionAccepted(&'a PeerId),
    BitfieldSent(&'a PeerId),
    BitfieldReceived(&'a PeerId),
    RequestReceived { peer: &'a PeerId, piece: u32 },
    PieceSent { peer: &'a PeerId, piece: u32 },
    PreferredNeighbors(&'a [PeerId]),
    OptimisticNeighbor(&'a PeerId),
    UnchokedBy(&'a PeerId),
    ChokedBy(&'a PeerId),
    HaveReceived { peer: &'a PeerId, piece: u32 },
    InterestedSent(&'a PeerId),
    InterestedReceived(&'a PeerId),
    NotInterestedSent(&'a PeerId),
    NotInterestedReceived(&'a PeerId),
    PieceDownloaded { peer: &'a PeerId, piece: u32, count: usize },
    DownloadCompleted,
}

/// Renders the sentence after the `Peer [<local>] ` prefix.
impl fmt::Display for Activity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::HandshakeReceived(p) => write!(f, "has received a handshake message from Peer [{p}]."),
            Activity::ConnectionInitiated(p) => write!(f, "makes a connection to Peer [{p}]."),
            Activity::ConnectionAccepted(p) => write!(f, "is connected from Peer [{p}]."),
            Activity::BitfieldSent(p) => write!(f, "has sent its bitfield to Peer [{p}]."),
            Activity::BitfieldReceived(p) => write!(f, "has received a bitfield message from Peer [{p}]."),
            Activity::RequestReceived { peer, piece } => {
                write!(f, "has received a request message for piece [{piece}] from Peer [{peer}].")
            }
            Activity::PieceSent { peer, piece } => write!(f, "has sent piece [{piece}] to Peer [{peer}]."),
            Activity::PreferredNeighbors(peers) => {
                let list = peers.iter().map(PeerId::as_str).collect::<Vec<_>>().join(",");
                write!(f, "has the preferred neighbors [{list}].")
            }
            Activity::OptimisticNeighbor(p) => write!(f, "has the optimistically unchoked neighbor [{p}]."),
            Activity::UnchokedBy(p) => write!(f, "is unchoked by [{p}]."),
            Activity::ChokedBy(p) => write!(f, "is choked by [{p}]."),
            Activity::HaveReceived { peer, piece } => {
                write!(f, "received the 'have' message from [{peer}] for the piece [{piece}].")
            }
            Activity::InterestedSent(p) => write!(f, "sent the 'interested' message to [{p}]."),
            Activity::InterestedReceived(p) => write!(f, "received the 'interested' message from [{p}]."),
            Activity::NotInterestedSent(p) => write!(f, "sent the 'not interested' message to [{p}]."),
            Activity::NotInterestedReceived(p) => write!(f, "received the 'not interested' message from [{p}]."),
            Activity::PieceDownloaded { peer, piece, count } => write!(
                f,
                "has downloaded the piece [{piece}] from [{peer}]. Now the number of pieces it has is [{count}]."
            ),
            Activity::DownloadCompleted => write!(f, "has downloaded the complete file."),
        }
    }
}

/// Handle to the activity log of one peer. Recording never fails.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    local: PeerId,
}

impl ActivityLog {
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn line(&self, activity: &Activity<'_>) -> String {
        format!("Peer [{}] {}", self.local, activity)
    }

    pub fn record(&self, activity: Activity<'_>) {
        info!(target: ACTIVITY_TARGET, "{}", self.line(&activity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_classic_lines() {
        let log = ActivityLog::new(PeerId::new("1001"));
        let remote = PeerId::new("1002");
        assert_eq!(
            log.line(&Activity::HandshakeReceived(&remote)),
            "Peer [1001] has received a handshake message from Peer [1002]."
        );
        assert_eq!(
            log.line(&Activity::PieceDownloaded { peer: &remote, piece: 3, count: 7 }),
            "Peer [1001] has downloaded the piece [3] from [1002]. Now the number of pieces it has is [7]."
        );
        assert_eq!(log.line(&Activity::DownloadCompleted), "Peer [1001] has downloaded the complete file.");
    }

    #[test]
    fn preferred_list_is_comma_separated() {
        let log = ActivityLog::new(PeerId::new("1001"));
        let peers = [PeerId::new("1003"), PeerId::new("1005")];
        assert_eq!(
            log.line(&Activity::PreferredNeighbors(&peers)),
            "Peer [1001] has the preferred neighbors [1003,1005]."
        );
    }
}
