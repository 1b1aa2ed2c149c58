//! A single peer connection: handshake, the choke/interest state machine,
//! request pipelining, and serving blocks back out to peers that want them
//! from us.
//!
//! A session is symmetric: the same state machine drives both outbound
//! connections we initiate and inbound connections accepted by the
//! listener, the only difference being who sends the handshake first.

mod codec;

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::broadcast,
    time::Instant,
};
use tokio_util::codec::{Framed, FramedParts};

use self::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use crate::{
    block_len,
    conf::TorrentConf,
    disk::PieceStore,
    error::{Error, Result},
    scheduler::Scheduler,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// Our willingness to upload to, and interest in downloading from, a peer.
#[derive(Clone, Copy, Debug)]
struct Status {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// A single block we've requested from the peer, along with when we asked
/// for it so stalled requests can be detected and released.
struct OutstandingRequest {
    info: BlockInfo,
    requested_at: Instant,
}

/// Drives one peer connection for the lifetime of the session.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    own_id: PeerId,
    info_hash: Sha1Hash,
    piece_store: PieceStore,
    scheduler: Arc<Scheduler>,
    conf: TorrentConf,
    /// Peer-IDs of every session currently connected anywhere in the
    /// engine, shared with every other session so a duplicate connection to
    /// an already-connected remote peer-ID (e.g. the same peer reconnecting
    /// from a different address) is rejected (spec §4.4).
    connected_peer_ids: Arc<Mutex<HashSet<PeerId>>>,
}

impl PeerSession {
    pub(crate) fn new(
        addr: SocketAddr,
        own_id: PeerId,
        info_hash: Sha1Hash,
        piece_store: PieceStore,
        scheduler: Arc<Scheduler>,
        conf: TorrentConf,
        connected_peer_ids: Arc<Mutex<HashSet<PeerId>>>,
    ) -> Self {
        Self {
            addr,
            own_id,
            info_hash,
            piece_store,
            scheduler,
            conf,
            connected_peer_ids,
        }
    }

    /// Dials `self.addr` and runs the session once connected.
    pub(crate) async fn run_outbound(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        log::info!("connecting to {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        self.run(socket, true, shutdown).await
    }

    /// Runs the session over an already-accepted inbound connection.
    pub(crate) async fn run_inbound(
        self,
        socket: TcpStream,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        self.run(socket, false, shutdown).await
    }

    async fn run(
        self,
        socket: TcpStream,
        is_outbound: bool,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut handshake_io = Framed::new(socket, HandshakeCodec);
        let peer_id = if is_outbound {
            handshake_io
                .send(Handshake::new(self.info_hash, self.own_id))
                .await?;
            let peer_handshake = self.read_handshake(&mut handshake_io).await?;
            peer_handshake
        } else {
            let peer_handshake = self.read_handshake(&mut handshake_io).await?;
            handshake_io
                .send(Handshake::new(self.info_hash, self.own_id))
                .await?;
            peer_handshake
        };

        if peer_id == self.own_id {
            return Err(Error::DuplicatePeer);
        }
        if !self.connected_peer_ids.lock().unwrap().insert(peer_id) {
            return Err(Error::DuplicatePeer);
        }
        log::info!("completed handshake with {} ({})", self.addr, hex::encode(peer_id));

        // Reuse the framed buffers rather than reallocating for the
        // message codec that takes over after the handshake; the read
        // buffer may already hold the start of the peer's first message.
        let old_parts = handshake_io.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut io = Framed::from_parts(new_parts);

        let mut status = Status::default();
        let mut peer_bitfield =
            Bitfield::repeat(false, self.piece_store.piece_count());
        let mut registered_with_scheduler = false;
        let mut message_count = 0usize;
        let mut current_piece: Option<(PieceIndex, u32)> = None;
        let mut outstanding: Vec<OutstandingRequest> = Vec::new();
        let mut last_sent = Instant::now();
        let mut last_received = Instant::now();

        if self.piece_store.bitfield_snapshot().any() {
            io.send(Message::Bitfield(self.piece_store.bitfield_snapshot()))
                .await?;
            last_sent = Instant::now();
        }

        let mut keepalive_ticker =
            tokio::time::interval(self.conf.keepalive_timeout / 2);

        // `?` inside the loop below would return out of `run` directly,
        // skipping the outstanding-request/scheduler cleanup after it; this
        // turns a fallible expression into a `break` carrying the error
        // instead, so cleanup always runs.
        macro_rules! try_or_break {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(e) => break Err(e),
                }
            };
        }

        let result: Result<()> = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("shutting down session with {}", self.addr);
                    break Ok(());
                }
                _ = keepalive_ticker.tick() => {
                    if last_received.elapsed() > self.conf.keepalive_timeout * 2 {
                        break Err(Error::Timeout);
                    }
                    if last_sent.elapsed() > self.conf.keepalive_timeout {
                        try_or_break!(io.send(Message::KeepAlive).await);
                        last_sent = Instant::now();
                    }
                    let before = outstanding.len();
                    outstanding.retain(|req| {
                        if req.requested_at.elapsed() > self.conf.request_timeout {
                            let _ = self.piece_store.release_block(
                                req.info.piece_index,
                                req.info.offset,
                                req.info.len,
                            );
                            false
                        } else {
                            true
                        }
                    });
                    if outstanding.len() != before && !status.peer_choking {
                        try_or_break!(self.top_up_pipeline(
                            &peer_bitfield,
                            &mut current_piece,
                            &mut outstanding,
                            &mut io,
                        ).await);
                    }
                }
                msg = io.next() => {
                    let Some(msg) = msg else {
                        break Ok(());
                    };
                    last_received = Instant::now();
                    let msg = try_or_break!(msg);
                    if !matches!(msg, Message::KeepAlive) {
                        let is_first = message_count == 0;
                        message_count += 1;
                        if matches!(msg, Message::Bitfield(_)) && !is_first {
                            break Err(Error::ProtocolViolation(
                                "bitfield must be the first message".into(),
                            ));
                        }
                    }

                    match msg {
                        Message::KeepAlive => {}
                        Message::Choke => {
                            status.peer_choking = true;
                            for req in outstanding.drain(..) {
                                let _ = self.piece_store.release_block(
                                    req.info.piece_index,
                                    req.info.offset,
                                    req.info.len,
                                );
                            }
                            current_piece = None;
                        }
                        Message::Unchoke => {
                            status.peer_choking = false;
                            if status.am_interested {
                                try_or_break!(self.top_up_pipeline(
                                    &peer_bitfield,
                                    &mut current_piece,
                                    &mut outstanding,
                                    &mut io,
                                ).await);
                            }
                        }
                        Message::Interested => {
                            status.peer_interested = true;
                            if status.am_choking {
                                status.am_choking = false;
                                try_or_break!(io.send(Message::Unchoke).await);
                                last_sent = Instant::now();
                            }
                        }
                        Message::NotInterested => {
                            status.peer_interested = false;
                        }
                        Message::Have { piece_index } => {
                            if peer_bitfield.get(piece_index).is_none() {
                                break Err(Error::ProtocolViolation(
                                    "have refers to an out of range piece".into(),
                                ));
                            }
                            peer_bitfield.set(piece_index, true);
                            if registered_with_scheduler {
                                self.scheduler.update_peer_have(piece_index);
                            }
                            if !status.am_interested && !self.piece_store.have(piece_index) {
                                status.am_interested = true;
                                try_or_break!(io.send(Message::Interested).await);
                                last_sent = Instant::now();
                            }
                        }
                        Message::Bitfield(bits) => {
                            if bits.len() != peer_bitfield.len() {
                                break Err(Error::ProtocolViolation(
                                    "bitfield length doesn't match piece count".into(),
                                ));
                            }
                            peer_bitfield = bits;
                            self.scheduler.register_peer(&peer_bitfield);
                            registered_with_scheduler = true;

                            let missing = self.piece_store.missing_pieces();
                            let has_anything_we_want = missing
                                .iter()
                                .any(|&i| peer_bitfield.get(i).map(|b| *b).unwrap_or(false));
                            if has_anything_we_want && !status.am_interested {
                                status.am_interested = true;
                                try_or_break!(io.send(Message::Interested).await);
                                last_sent = Instant::now();
                            }
                        }
                        Message::Request(info) => {
                            if status.am_choking || !self.piece_store.have(info.piece_index) {
                                // Silently ignore: either we aren't serving
                                // this peer yet, or we don't have the piece.
                            } else {
                                match self.piece_store.read_block(
                                    info.piece_index,
                                    info.offset,
                                    info.len,
                                ).await {
                                    Ok(data) => {
                                        try_or_break!(io.send(Message::Piece {
                                            piece_index: info.piece_index,
                                            offset: info.offset,
                                            data,
                                        }).await);
                                        last_sent = Instant::now();
                                    }
                                    Err(e) => {
                                        log::warn!(
                                            "failed to read block {:?} requested by {}: {}",
                                            info, self.addr, e
                                        );
                                    }
                                }
                            }
                        }
                        Message::Cancel(_) => {
                            // We serve requests immediately rather than
                            // queueing them, so there's nothing to cancel.
                        }
                        Message::Piece { piece_index, offset, data } => {
                            let before = outstanding.len();
                            outstanding.retain(|req| {
                                !(req.info.piece_index == piece_index
                                    && req.info.offset == offset)
                            });
                            if outstanding.len() == before {
                                log::warn!(
                                    "{} sent an unrequested piece {}:{}",
                                    self.addr, piece_index, offset
                                );
                            }
                            try_or_break!(self.piece_store
                                .deliver_block(piece_index, offset, data)
                                .await);
                            if !status.peer_choking {
                                try_or_break!(self.top_up_pipeline(
                                    &peer_bitfield,
                                    &mut current_piece,
                                    &mut outstanding,
                                    &mut io,
                                ).await);
                            }
                        }
                    }
                }
            }
        };

        for req in outstanding.drain(..) {
            let _ = self.piece_store.release_block(
                req.info.piece_index,
                req.info.offset,
                req.info.len,
            );
        }
        if registered_with_scheduler {
            self.scheduler.unregister_peer(&peer_bitfield);
        }
        self.connected_peer_ids.lock().unwrap().remove(&peer_id);

        if let Err(e) = &result {
            log::info!("session with {} ended: {}", self.addr, e);
        }
        result
    }

    async fn read_handshake(
        &self,
        io: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<PeerId> {
        let handshake = io
            .next()
            .await
            .ok_or_else(|| {
                Error::BadHandshake("connection closed before handshake".into())
            })??;
        if handshake.info_hash != self.info_hash {
            return Err(Error::BadHandshake(
                "info hash doesn't match this torrent".into(),
            ));
        }
        Ok(handshake.peer_id)
    }

    /// Requests as many new blocks as the pipeline has room for, picking
    /// pieces rarest-first and blocks within a piece in ascending order.
    async fn top_up_pipeline(
        &self,
        peer_bitfield: &Bitfield,
        current_piece: &mut Option<(PieceIndex, u32)>,
        outstanding: &mut Vec<OutstandingRequest>,
        io: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let capacity = self.conf.pipeline_depth.saturating_sub(outstanding.len());
        let picked = self.next_blocks(peer_bitfield, current_piece, capacity);
        for info in picked {
            io.send(Message::Request(info)).await?;
            outstanding.push(OutstandingRequest {
                info,
                requested_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Reserves up to `capacity` not-yet-in-flight blocks from pieces the
    /// peer has, preferring to complete an already partially reserved piece
    /// before picking a new one rarest-first (spec §4.5 points 1-2).
    fn next_blocks(
        &self,
        peer_bitfield: &Bitfield,
        current_piece: &mut Option<(PieceIndex, u32)>,
        capacity: usize,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::new();
        let mut exhausted: HashSet<PieceIndex> = HashSet::new();
        let block_len_cfg = self.piece_store.block_len();

        while picked.len() < capacity {
            if current_piece.is_none() {
                let missing: Vec<PieceIndex> = self
                    .piece_store
                    .missing_pieces()
                    .into_iter()
                    .filter(|i| !exhausted.contains(i))
                    .collect();
                let partially_reserved =
                    self.piece_store.partially_reserved_pieces();
                match self.scheduler.pick_piece(
                    peer_bitfield,
                    &missing,
                    &partially_reserved,
                ) {
                    Some(index) => *current_piece = Some((index, 0)),
                    None => break,
                }
            }

            let (index, offset) = current_piece.expect("just set above");
            let piece_len = match self.piece_store.piece_len(index) {
                Ok(len) => len,
                Err(_) => {
                    *current_piece = None;
                    continue;
                }
            };
            if offset >= piece_len {
                exhausted.insert(index);
                *current_piece = None;
                continue;
            }

            let block_index = (offset / block_len_cfg) as usize;
            let len = block_len(piece_len, block_index, block_len_cfg);
            *current_piece = Some((index, offset + len));

            if let Ok(true) = self.piece_store.reserve_block(index, offset, len)
            {
                picked.push(BlockInfo { piece_index: index, offset, len });
            }
        }

        picked
    }
}
