use crate::activity::Activity;
use crate::coordinator::Coordinator;
use crate::error::SwarmError;
use crate::transport::Transport;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use swarmshare_proto::{Bitfield, Frame, Handshake, Message, PeerId, HANDSHAKE_LEN, LENGTH_PREFIX_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One neighbor connection: handshake, then a frame-at-a-time read loop.
///
/// The read half stays with the handler; the write half belongs to a writer
/// task that sends our handshake first and then drains the outbound channel.
pub struct PeerConnection {
	stream: Transport,
	remote_addr: SocketAddr,
	expected: Option<PeerId>,
	coordinator: Arc<Coordinator>,
	cancel: CancellationToken,
}

impl PeerConnection {
	/// `expected` is the roster peer we dialed; `None` for accepted connections.
	pub fn new(
		stream: Transport,
		remote_addr: SocketAddr,
		expected: Option<PeerId>,
		coordinator: Arc<Coordinator>,
		cancel: CancellationToken,
	) -> Self {
		Self { stream, remote_addr, expected, coordinator, cancel }
	}

	/// Runs until the remote goes away, a protocol error occurs or the
	/// connection is cancelled. A plain disconnect is not an error.
	pub async fn run(self) -> Result<(), SwarmError> {
		let PeerConnection { stream, remote_addr, expected, coordinator, cancel } = self;
		let (mut reader, writer) = tokio::io::split(stream);
		let (tx, rx) = mpsc::unbounded_channel();
		let hello = Handshake::new(coordinator.local_id().clone());
		let writer_task = tokio::spawn(write_loop(writer, hello, rx, cancel.clone()));

		let mut handler = Handler { coordinator, remote_addr, tx, cancel: cancel.clone(), remote: None, link: 0 };
		let result = tokio::select! {
			res = handler.read_loop(&mut reader, expected) => res,
			_ = cancel.cancelled() => Ok(()),
		};
		cancel.cancel();
		handler.close();
		let shutting_down = handler.coordinator.is_shutting_down();
		drop(handler);
		match writer_task.await {
			Ok(Err(err)) => debug!(%remote_addr, error = %err, "writer stopped"),
			Err(err) => debug!(%remote_addr, error = %err, "writer task failed"),
			Ok(Ok(())) => {}
		}

		match result {
			Err(err) if err.is_disconnect() => {
				debug!(%remote_addr, "peer disconnected");
				Ok(())
			}
			// the store is closed once shutdown starts
			Err(err) if err.is_resource() && shutting_down => {
				debug!(%remote_addr, error = %err, "connection ended during shutdown");
				Ok(())
			}
			other => other,
		}
	}
}

async fn write_loop(
	mut writer: WriteHalf<Transport>,
	hello: Handshake,
	mut rx: UnboundedReceiver<Message>,
	cancel: CancellationToken,
) -> Result<(), io::Error> {
	let result = async {
		writer.write_all(&hello.encode()).await?;
		loop {
			let message = tokio::select! {
				_ = cancel.cancelled() => break,
				next = rx.recv() => match next { Some(message) => message, None => break },
			};
			writer.write_all(&message.encode()).await?;
		}
		writer.flush().await
	}
	.await;
	if result.is_err() { cancel.cancel(); }
	result
}

struct Handler {
	coordinator: Arc<Coordinator>,
	remote_addr: SocketAddr,
	tx: UnboundedSender<Message>,
	cancel: CancellationToken,
	remote: Option<PeerId>,
	link: u64,
}

impl Handler {
	async fn read_loop(&mut self, reader: &mut ReadHalf<Transport>, expected: Option<PeerId>) -> Result<(), SwarmError> {
		let mut buf = [0u8; HANDSHAKE_LEN];
		reader.read_exact(&mut buf).await?;
		let remote = Handshake::decode(&buf)?.peer_id;
		let inbound = match expected {
			Some(expected) if expected != remote => {
				return Err(SwarmError::Protocol(format!("dialed peer {expected} but handshake names {remote}")));
			}
			Some(_) => false,
			None => true,
		};
		self.link = self.coordinator.register(&remote, self.tx.clone(), self.cancel.clone());
		self.remote = Some(remote.clone());

		let log = self.coordinator.log();
		log.record(Activity::HandshakeReceived(&remote));
		if inbound { log.record(Activity::ConnectionAccepted(&remote)); }
		info!(peer = %remote, remote_addr = %self.remote_addr, "Handshake completed");

		let ours = self.coordinator.swarm().local_availability();
		if !ours.is_empty() {
			self.send(Message::Bitfield(ours.to_bytes()))?;
			log.record(Activity::BitfieldSent(&remote));
		}

		let max_frame = self.coordinator.max_frame_len();
		let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
		loop {
			reader.read_exact(&mut len_buf).await?;
			let length = u32::from_be_bytes(len_buf);
			if length == 0 || length as usize > max_frame {
				return Err(SwarmError::Protocol(format!("frame length {length} outside 1..={max_frame}")));
			}
			let mut body = vec![0u8; length as usize];
			reader.read_exact(&mut body).await?;
			let frame = Frame::decode_body(length, &body)?;
			match Message::from_frame(&frame)? {
				Some(message) => self.handle_message(&remote, message).await?,
				None => debug!(peer = %remote, tag = frame.tag, "Ignoring unknown message type"),
			}
		}
	}

	async fn handle_message(&self, remote: &PeerId, msg: Message) -> Result<(), SwarmError> {
		debug!(peer = %remote, kind = ?msg.kind(), "Received message");
		let swarm = self.coordinator.swarm();
		let log = self.coordinator.log();
		match msg {
			Message::Choke => {
				log.record(Activity::ChokedBy(remote));
				swarm.set_unchoked_by(remote, false);
				if swarm.release_claims(remote) > 0 { self.coordinator.redispatch(); }
			}
			Message::Unchoke => {
				log.record(Activity::UnchokedBy(remote));
				swarm.set_unchoked_by(remote, true);
				self.request_next(remote)?;
			}
			Message::Interested => {
				log.record(Activity::InterestedReceived(remote));
				swarm.add_interested(remote);
			}
			Message::NotInterested => {
				log.record(Activity::NotInterestedReceived(remote));
				swarm.remove_interested(remote);
			}
			Message::Have(index) => {
				self.check_index(index)?;
				log.record(Activity::HaveReceived { peer: remote, piece: index });
				let interested = swarm.mark_have(remote, index);
				if swarm.is_finished() { self.coordinator.shutdown().await; }
				self.declare_interest(remote, interested)?;
			}
			Message::Bitfield(bits) => {
				log.record(Activity::BitfieldReceived(remote));
				let interested = swarm.set_availability(remote, Bitfield::from_bytes(&bits, swarm.piece_count()));
				if !swarm.is_local_complete() { self.declare_interest(remote, interested)?; }
			}
			Message::Request(index) => {
				self.check_index(index)?;
				log.record(Activity::RequestReceived { peer: remote, piece: index });
				if !swarm.may_upload_to(remote) {
					debug!(peer = %remote, piece = index, "Dropping request from choked peer");
					return Ok(());
				}
				let data = self.coordinator.store().read_piece(index).await?;
				self.send(Message::Piece { index, data })?;
				log.record(Activity::PieceSent { peer: remote, piece: index });
			}
			Message::Piece { index, data } => {
				self.check_index(index)?;
				let expected = self.coordinator.layout().piece_len(index).unwrap_or_default();
				if data.len() != expected {
					return Err(SwarmError::Protocol(format!("piece {index} carries {} bytes, expected {expected}", data.len())));
				}
				self.coordinator.store().write_piece(index, &data).await?;
				if let Some(count) = swarm.record_download(index, remote) {
					log.record(Activity::PieceDownloaded { peer: remote, piece: index, count });
					self.coordinator.broadcast_have(index);
					if swarm.is_local_complete() {
						log.record(Activity::DownloadCompleted);
						for peer in self.coordinator.broadcast(Message::NotInterested) {
							log.record(Activity::NotInterestedSent(&peer));
						}
						if swarm.is_finished() { self.coordinator.shutdown().await; }
						return Ok(());
					}
				}
				self.request_next(remote)?;
			}
		}
		Ok(())
	}

	/// Ask `remote` for its next unclaimed piece. Not-interested is only sent
	/// when it has nothing we lack; pieces claimed from other neighbors keep
	/// us interested.
	fn request_next(&self, remote: &PeerId) -> Result<(), SwarmError> {
		let swarm = self.coordinator.swarm();
		match swarm.claim_next(remote) {
			Some(index) => {
				debug!(peer = %remote, piece = index, "Requesting piece");
				self.send(Message::Request(index))
			}
			None if swarm.is_interested_in(remote) => Ok(()),
			None => self.declare_interest(remote, false),
		}
	}

	fn declare_interest(&self, remote: &PeerId, interested: bool) -> Result<(), SwarmError> {
		let log = self.coordinator.log();
		if interested {
			self.send(Message::Interested)?;
			log.record(Activity::InterestedSent(remote));
		} else {
			self.send(Message::NotInterested)?;
			log.record(Activity::NotInterestedSent(remote));
		}
		Ok(())
	}

	fn check_index(&self, index: u32) -> Result<(), SwarmError> {
		let piece_count = self.coordinator.swarm().piece_count();
		if index as usize >= piece_count {
			return Err(SwarmError::piece_out_of_range(index, piece_count));
		}
		Ok(())
	}

	fn send(&self, message: Message) -> Result<(), SwarmError> {
		self.tx
			.send(message)
			.map_err(|_| SwarmError::Network(io::Error::new(io::ErrorKind::BrokenPipe, "connection writer closed")))
	}

	fn close(&mut self) {
		let Some(remote) = self.remote.take() else { return };
		self.coordinator.unregister(&remote, self.link);
		let swarm = self.coordinator.swarm();
		swarm.set_unchoked_by(&remote, false);
		if swarm.release_claims(&remote) > 0 { self.coordinator.redispatch(); }
		debug!(peer = %remote, remote_addr = %self.remote_addr, "Connection closed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::activity::ActivityLog;
	use crate::config::{CommonConfig, PeerConfig, PeerInfo, Roster, Timing};
	use crate::piece_store::PieceStore;
	use bytes::Bytes;
	use std::collections::HashSet;
	use std::time::Duration;
	use tempfile::TempDir;
	use tokio::io::DuplexStream;
	use tokio::task::JoinHandle;

	const CONTENT: &[u8] = b"0123456789";

	struct Fixture {
		_dir: TempDir,
		coordinator: Arc<Coordinator>,
	}

	async fn fixture(local_has_file: bool) -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let common = CommonConfig {
			preferred_neighbors: 1,
			unchoking_interval: Duration::from_secs(60),
			optimistic_unchoking_interval: Duration::from_secs(60),
			file_name: "file.bin".into(),
			file_size: CONTENT.len() as u64,
			piece_size: 4,
		};
		let roster = Roster::new(vec![
			PeerInfo::new("1001", "127.0.0.1", 1, local_has_file),
			PeerInfo::new("1002", "127.0.0.1", 2, !local_has_file),
		]);
		let timing = Timing {
			scheduler_startup: Duration::from_millis(10),
			connect_delay: Duration::from_millis(10),
			termination_delay: Duration::from_millis(200),
			termination_base: Duration::from_millis(10),
		};
		let config = PeerConfig::new(PeerId::new("1001"), common, roster, dir.path()).unwrap().with_timing(timing);
		if local_has_file {
			std::fs::create_dir_all(config.peer_dir()).unwrap();
			std::fs::write(config.file_path(), CONTENT).unwrap();
		}
		let store = PieceStore::open(config.file_path(), config.common.layout(), local_has_file).await.unwrap();
		let coordinator = Coordinator::new(config, store, ActivityLog::new(PeerId::new("1001")));
		Fixture { _dir: dir, coordinator }
	}

	fn connect(coordinator: &Arc<Coordinator>, expected: Option<&str>) -> (DuplexStream, JoinHandle<Result<(), SwarmError>>) {
		let (ours, theirs) = tokio::io::duplex(1 << 16);
		let conn = PeerConnection::new(
			Box::new(ours),
			"127.0.0.1:6008".parse().unwrap(),
			expected.map(PeerId::new),
			coordinator.clone(),
			coordinator.connection_token(),
		);
		(theirs, tokio::spawn(conn.run()))
	}

	async fn handshake(stream: &mut DuplexStream, id: &str) -> PeerId {
		stream.write_all(&Handshake::new(PeerId::new(id)).encode()).await.unwrap();
		let mut buf = [0u8; HANDSHAKE_LEN];
		stream.read_exact(&mut buf).await.unwrap();
		Handshake::decode(&buf).unwrap().peer_id
	}

	async fn send(stream: &mut DuplexStream, msg: Message) {
		stream.write_all(&msg.encode()).await.unwrap();
	}

	async fn recv(stream: &mut DuplexStream) -> Message {
		let mut len = [0u8; 4];
		stream.read_exact(&mut len).await.unwrap();
		let length = u32::from_be_bytes(len);
		let mut body = vec![0u8; length as usize];
		stream.read_exact(&mut body).await.unwrap();
		Message::from_frame(&Frame::decode_body(length, &body).unwrap()).unwrap().unwrap()
	}

	async fn eventually(check: impl Fn() -> bool) {
		for _ in 0..200 {
			if check() { return; }
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("condition not reached");
	}

	#[tokio::test]
	async fn seeder_sends_bitfield_and_serves_unchoked_requests() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		assert_eq!(handshake(&mut remote, "1002").await, PeerId::new("1001"));
		assert_eq!(recv(&mut remote).await, Message::Bitfield(Bytes::from_static(&[0b1110_0000])));

		// choked: dropped
		send(&mut remote, Message::Request(0)).await;
		send(&mut remote, Message::Interested).await;
		let swarm = fx.coordinator.swarm().clone();
		eventually(|| swarm.interested().contains(&PeerId::new("1002"))).await;

		swarm.replace_unchoked(HashSet::from([PeerId::new("1002")]));
		send(&mut remote, Message::Request(2)).await;
		assert_eq!(
			recv(&mut remote).await,
			Message::Piece { index: 2, data: Bytes::from_static(b"89") }
		);

		drop(remote);
		assert!(task.await.unwrap().is_ok());
		assert!(!fx.coordinator.is_linked(&PeerId::new("1002")));
	}

	#[tokio::test]
	async fn leecher_downloads_every_piece_then_shuts_down() {
		let fx = fixture(false).await;
		let (mut remote, task) = connect(&fx.coordinator, Some("1002"));
		handshake(&mut remote, "1002").await;

		send(&mut remote, Message::Bitfield(Bytes::from_static(&[0xE0]))).await;
		assert_eq!(recv(&mut remote).await, Message::Interested);

		send(&mut remote, Message::Unchoke).await;
		for index in 0..3u32 {
			assert_eq!(recv(&mut remote).await, Message::Request(index));
			let start = index as usize * 4;
			let end = (start + 4).min(CONTENT.len());
			send(&mut remote, Message::Piece { index, data: Bytes::copy_from_slice(&CONTENT[start..end]) }).await;
			assert_eq!(recv(&mut remote).await, Message::Have(index));
		}
		assert_eq!(recv(&mut remote).await, Message::NotInterested);

		let coordinator = fx.coordinator.clone();
		tokio::time::timeout(Duration::from_secs(5), coordinator.wait_finished()).await.unwrap();
		assert!(fx.coordinator.is_shutting_down());
		assert!(fx.coordinator.swarm().is_local_complete());
		assert!(task.await.unwrap().is_ok());
		assert_eq!(std::fs::read(fx.coordinator.config().file_path()).unwrap(), CONTENT);
	}

	#[tokio::test]
	async fn choke_releases_claims() {
		let fx = fixture(false).await;
		let (mut remote, _task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		send(&mut remote, Message::Bitfield(Bytes::from_static(&[0xE0]))).await;
		assert_eq!(recv(&mut remote).await, Message::Interested);
		send(&mut remote, Message::Unchoke).await;
		assert_eq!(recv(&mut remote).await, Message::Request(0));
		assert_eq!(fx.coordinator.swarm().claimed_by(0), Some(PeerId::new("1002")));

		send(&mut remote, Message::Choke).await;
		let swarm = fx.coordinator.swarm().clone();
		eventually(|| swarm.claimed_by(0).is_none()).await;
	}

	#[tokio::test]
	async fn piece_after_choke_waits_for_next_unchoke() {
		let fx = fixture(false).await;
		let (mut remote, task) = connect(&fx.coordinator, Some("1002"));
		handshake(&mut remote, "1002").await;
		send(&mut remote, Message::Bitfield(Bytes::from_static(&[0xE0]))).await;
		assert_eq!(recv(&mut remote).await, Message::Interested);
		send(&mut remote, Message::Unchoke).await;
		assert_eq!(recv(&mut remote).await, Message::Request(0));

		// the remote choked us while piece 0 was already on its way
		send(&mut remote, Message::Choke).await;
		send(&mut remote, Message::Piece { index: 0, data: Bytes::from_static(b"0123") }).await;
		assert_eq!(recv(&mut remote).await, Message::Have(0));
		let swarm = fx.coordinator.swarm().clone();
		assert!(!swarm.is_unchoked_by(&PeerId::new("1002")));

		send(&mut remote, Message::Unchoke).await;
		assert_eq!(recv(&mut remote).await, Message::Request(1));
		send(&mut remote, Message::Piece { index: 1, data: Bytes::from_static(b"4567") }).await;
		assert_eq!(recv(&mut remote).await, Message::Have(1));
		assert_eq!(recv(&mut remote).await, Message::Request(2));
		send(&mut remote, Message::Piece { index: 2, data: Bytes::from_static(b"89") }).await;
		assert_eq!(recv(&mut remote).await, Message::Have(2));
		assert_eq!(recv(&mut remote).await, Message::NotInterested);

		tokio::time::timeout(Duration::from_secs(5), fx.coordinator.wait_finished()).await.unwrap();
		assert!(task.await.unwrap().is_ok());
		assert_eq!(std::fs::read(fx.coordinator.config().file_path()).unwrap(), CONTENT);
	}

	#[tokio::test]
	async fn have_completing_the_swarm_shuts_down() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		recv(&mut remote).await;

		for index in 0..2u32 {
			send(&mut remote, Message::Have(index)).await;
			assert_eq!(recv(&mut remote).await, Message::NotInterested);
		}
		assert!(!fx.coordinator.is_shutting_down());

		send(&mut remote, Message::Have(2)).await;
		tokio::time::timeout(Duration::from_secs(5), fx.coordinator.wait_finished()).await.unwrap();
		assert!(fx.coordinator.is_shutting_down());
		assert!(fx.coordinator.swarm().is_complete());
		assert!(task.await.unwrap().is_ok());
	}

	#[tokio::test]
	async fn request_after_shutdown_ends_quietly() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		recv(&mut remote).await;

		fx.coordinator.shutdown().await;
		let swarm = fx.coordinator.swarm().clone();
		swarm.replace_unchoked(HashSet::from([PeerId::new("1002")]));
		send(&mut remote, Message::Request(0)).await;

		assert!(task.await.unwrap().is_ok());
		let mut rest = Vec::new();
		remote.read_to_end(&mut rest).await.unwrap();
		assert!(rest.is_empty());
		tokio::time::timeout(Duration::from_secs(5), fx.coordinator.wait_finished()).await.unwrap();
	}

	#[tokio::test]
	async fn unknown_types_are_skipped() {
		let fx = fixture(true).await;
		let (mut remote, _task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		recv(&mut remote).await;
		remote.write_all(&Frame::new(b'9', vec![1, 2, 3]).encode()).await.unwrap();
		send(&mut remote, Message::Interested).await;
		let swarm = fx.coordinator.swarm().clone();
		eventually(|| swarm.interested().contains(&PeerId::new("1002"))).await;
	}

	#[tokio::test]
	async fn oversized_frame_closes_connection() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		recv(&mut remote).await;
		remote.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
		assert!(matches!(task.await.unwrap(), Err(SwarmError::Protocol(_))));
	}

	#[tokio::test]
	async fn out_of_range_have_closes_connection() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		handshake(&mut remote, "1002").await;
		recv(&mut remote).await;
		send(&mut remote, Message::Have(3)).await;
		assert!(matches!(task.await.unwrap(), Err(SwarmError::Protocol(_))));
	}

	#[tokio::test]
	async fn dialed_peer_must_match_handshake() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, Some("1002"));
		handshake(&mut remote, "1003").await;
		assert!(matches!(task.await.unwrap(), Err(SwarmError::Protocol(_))));
	}

	#[tokio::test]
	async fn bad_handshake_header_is_rejected() {
		let fx = fixture(true).await;
		let (mut remote, task) = connect(&fx.coordinator, None);
		let mut bogus = Handshake::new(PeerId::new("1002")).encode();
		bogus[0] = b'X';
		remote.write_all(&bogus).await.unwrap();
		assert!(matches!(task.await.unwrap(), Err(SwarmError::Handshake(_))));
	}
}
