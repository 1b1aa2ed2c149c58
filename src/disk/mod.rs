//! The piece store: owns the torrent's on-disk file, tracks which pieces
//! have been verified, and buffers not-yet-complete pieces in memory while
//! their blocks trickle in from peers.
//!
//! Unlike the teacher's actor that owned the file behind a channel and a
//! dedicated task, callers here talk to the store directly through `&self`
//! methods; interior locking makes it safe to share a single `PieceStore`
//! (it's cheaply `Clone`, being an `Arc` handle) across every peer session
//! and the scheduler. Methods that touch the filesystem or compute a SHA-1
//! digest run on a blocking thread via `tokio::task::spawn_blocking` so they
//! never stall the executor.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::sync::broadcast;

use crate::{
    block_count, block_len,
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    Bitfield, PieceIndex, BLOCK_LEN,
};

/// How many verified pieces' worth of read requests we keep buffered in
/// memory before evicting the least recently used entry.
const READ_CACHE_CAPACITY: usize = 32;

/// How many pending piece-verified notifications a lagging subscriber may
/// miss before we stop bothering to retain them for it.
const VERIFIED_EVENT_CAPACITY: usize = 256;

/// The outcome of delivering a block to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The block was buffered, but its piece isn't complete yet.
    AcceptedIncomplete,
    /// The block completed the piece and the piece's hash matched; it has
    /// been written to disk and is now marked verified.
    AcceptedVerified,
    /// The block completed the piece but the piece's hash did not match;
    /// all of the piece's blocks were discarded and must be re-requested.
    AcceptedRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    InFlight,
    Received,
}

/// The in-memory accumulation buffer for a piece that hasn't been verified
/// yet.
struct PendingPiece {
    buf: Vec<u8>,
    blocks: Vec<BlockState>,
}

impl PendingPiece {
    fn new(piece_len: u32, block_len: u32) -> Self {
        Self {
            buf: vec![0; piece_len as usize],
            blocks: vec![BlockState::Missing; block_count(piece_len, block_len)],
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockState::Received)
    }

    /// Whether at least one block has been reserved or received, i.e. this
    /// piece is a candidate to finish rather than abandon to a rarer pick
    /// (spec §4.5 point 2).
    fn is_partially_reserved(&self) -> bool {
        self.blocks.iter().any(|b| *b != BlockState::Missing)
    }

    fn reset(&mut self) {
        for b in &mut self.blocks {
            *b = BlockState::Missing;
        }
    }
}

/// A point-in-time snapshot of the store's disk activity counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub write_count: u64,
    pub write_failure_count: u64,
    pub read_count: u64,
    pub read_failure_count: u64,
}

#[derive(Default, Debug)]
struct Stats {
    write_count: AtomicU64,
    write_failure_count: AtomicU64,
    read_count: AtomicU64,
    read_failure_count: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            write_count: self.write_count.load(Ordering::Relaxed),
            write_failure_count: self
                .write_failure_count
                .load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            read_failure_count: self
                .read_failure_count
                .load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    info: StorageInfo,
    metainfo: Metainfo,
    file: File,
    bitfield: RwLock<Bitfield>,
    pending: Mutex<HashMap<PieceIndex, PendingPiece>>,
    read_cache: Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
    verified_tx: broadcast::Sender<PieceIndex>,
    stats: Stats,
    /// The configured block length (spec §6's `block-size`), used to derive
    /// block indices and counts consistently across reservation, delivery,
    /// and the peer session's request pipelining.
    block_len: u32,
}

/// A handle to the torrent's piece store.
///
/// Cloning is cheap: it shares the same underlying file, bitfield, and
/// in-flight piece buffers with the original.
#[derive(Clone)]
pub struct PieceStore {
    inner: Arc<Inner>,
}

impl PieceStore {
    /// Opens (creating if necessary) the torrent's file at its full length
    /// and verifies any data already present, producing a store whose
    /// bitfield reflects what's already correct on disk.
    ///
    /// The file is sparse-allocated to its final size up front so that
    /// later writes can seek to any piece's offset without first having to
    /// extend the file.
    pub async fn open(
        metainfo: Metainfo,
        download_dir: &Path,
        block_len: u32,
    ) -> Result<Self> {
        let info = StorageInfo::new(&metainfo, &download_dir.to_path_buf());
        let path = info.file.path.clone();
        let download_len = info.download_len;

        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            file.set_len(download_len)?;
            Ok(file)
        })
        .await??;

        let piece_count = info.piece_count;
        let (verified_tx, _) = broadcast::channel(VERIFIED_EVENT_CAPACITY);
        let store = Self {
            inner: Arc::new(Inner {
                info,
                metainfo,
                file,
                bitfield: RwLock::new(Bitfield::repeat(false, piece_count)),
                pending: Mutex::new(HashMap::new()),
                read_cache: Mutex::new(LruCache::new(
                    std::num::NonZeroUsize::new(READ_CACHE_CAPACITY).unwrap(),
                )),
                verified_tx,
                stats: Stats::default(),
                block_len,
            }),
        };
        store.verify_all().await?;
        Ok(store)
    }

    /// Hashes every piece currently on disk and sets the corresponding
    /// bitfield bits for the ones that already match, so that resuming a
    /// partially downloaded file doesn't re-fetch data we already have.
    ///
    /// All pieces are hashed concurrently on the blocking thread pool.
    async fn verify_all(&self) -> Result<()> {
        let piece_count = self.inner.info.piece_count;
        let mut tasks = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::task::spawn_blocking(move || {
                hash_piece_on_disk(&inner, index)
            }));
        }

        let results = futures::future::join_all(tasks).await;
        let mut bitfield = self.inner.bitfield.write().unwrap();
        for (index, result) in results.into_iter().enumerate() {
            let digest = result??;
            if self.inner.metainfo.piece_hash(index) == Some(digest) {
                bitfield.set(index, true);
            }
        }
        Ok(())
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.inner.info.piece_count
    }

    /// The length, in bytes, of the piece at `index` (shorter for the last
    /// piece if the file isn't an exact multiple of the nominal length).
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        self.inner.info.piece_len(index)
    }

    /// Whether the piece at `index` has been downloaded and verified.
    pub fn have(&self, index: PieceIndex) -> bool {
        self.inner
            .bitfield
            .read()
            .unwrap()
            .get(index)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// A snapshot of the pieces we currently have, suitable for sending in
    /// a `bitfield` message.
    pub fn bitfield_snapshot(&self) -> Bitfield {
        self.inner.bitfield.read().unwrap().clone()
    }

    /// The indices of pieces we don't have yet.
    pub fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.inner
            .bitfield
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, have)| !**have)
            .map(|(index, _)| index)
            .collect()
    }

    /// The indices of not-yet-verified pieces that already have at least one
    /// block reserved or received, i.e. pieces some session has started
    /// downloading. The scheduler prefers these over starting a new piece
    /// (spec §4.5 point 2), so a piece half-downloaded by one session gets
    /// finished by whichever session asks next rather than left to stall.
    pub fn partially_reserved_pieces(&self) -> Vec<PieceIndex> {
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, piece)| piece.is_partially_reserved())
            .map(|(&index, _)| index)
            .collect()
    }

    /// The block length this store was configured with (spec §6's
    /// `block-size`), used by peer sessions to keep their request
    /// pipelining block-aligned with how blocks are validated here.
    pub fn block_len(&self) -> u32 {
        self.inner.block_len
    }

    /// Whether every piece has been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.inner.bitfield.read().unwrap().all()
    }

    /// A live feed of piece indices as they become verified.
    pub fn subscribe(&self) -> broadcast::Receiver<PieceIndex> {
        self.inner.verified_tx.subscribe()
    }

    /// A snapshot of the store's disk activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Marks the block as in flight, so that the scheduler won't hand it
    /// out to another peer. Returns `false` if the block is already
    /// reserved, already received, or belongs to a piece we already have.
    pub fn reserve_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<bool> {
        if self.have(piece_index) {
            return Ok(false);
        }
        let (piece_len, block_index) =
            self.validate_block(piece_index, offset, len)?;

        let mut pending = self.inner.pending.lock().unwrap();
        let piece = pending.entry(piece_index).or_insert_with(|| {
            PendingPiece::new(piece_len, self.inner.block_len)
        });
        if piece.blocks[block_index] != BlockState::Missing {
            return Ok(false);
        }
        piece.blocks[block_index] = BlockState::InFlight;
        Ok(true)
    }

    /// Releases a previously reserved block back to `Missing`, e.g. because
    /// the peer that was going to send it disconnected or timed out.
    pub fn release_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<()> {
        let (_, block_index) =
            self.validate_block(piece_index, offset, len)?;
        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(piece) = pending.get_mut(&piece_index) {
            if piece.blocks[block_index] == BlockState::InFlight {
                piece.blocks[block_index] = BlockState::Missing;
            }
        }
        Ok(())
    }

    /// Buffers a received block. Once every block of a piece has arrived,
    /// the piece is hashed; a match is written to disk and marked verified,
    /// while a mismatch discards the piece's buffered blocks so they can be
    /// re-requested.
    pub async fn deliver_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<Delivery> {
        if self.have(piece_index) {
            // A duplicate arriving after we already verified the piece
            // (e.g. from a slow peer we'd already given up on).
            return Ok(Delivery::AcceptedIncomplete);
        }
        let (_, block_index) =
            self.validate_block(piece_index, offset, data.len() as u32)?;

        let completed_buf = {
            let mut pending = self.inner.pending.lock().unwrap();
            let piece = pending.get_mut(&piece_index).ok_or_else(|| {
                Error::ProtocolViolation(
                    "delivered a block that was never reserved".into(),
                )
            })?;
            let start = offset as usize;
            piece.buf[start..start + data.len()].copy_from_slice(&data);
            piece.blocks[block_index] = BlockState::Received;
            if piece.is_complete() {
                Some(piece.buf.clone())
            } else {
                None
            }
        };

        let Some(buf) = completed_buf else {
            return Ok(Delivery::AcceptedIncomplete);
        };

        let expected = self.inner.metainfo.piece_hash(piece_index);
        let digest = {
            let mut hasher = Sha1::new();
            hasher.update(&buf);
            let result = hasher.finalize();
            let mut out = [0u8; 20];
            out.copy_from_slice(&result);
            out
        };

        if Some(digest) != expected {
            self.inner.stats.write_failure_count.fetch_add(1, Ordering::Relaxed);
            let mut pending = self.inner.pending.lock().unwrap();
            if let Some(piece) = pending.get_mut(&piece_index) {
                piece.reset();
            }
            return Ok(Delivery::AcceptedRejected);
        }

        let inner = Arc::clone(&self.inner);
        let offset_on_disk = self.inner.info.piece_offset(piece_index);
        let write_result = tokio::task::spawn_blocking(move || {
            inner.file.write_all_at(&buf, offset_on_disk)
        })
        .await?;
        match write_result {
            Ok(()) => {
                self.inner.stats.write_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner.stats.write_failure_count.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Io(e));
            }
        }

        self.inner.pending.lock().unwrap().remove(&piece_index);
        self.inner.bitfield.write().unwrap().set(piece_index, true);
        // A verified piece always has at least one subscriber once the
        // engine is running; if not (e.g. in a unit test) this simply
        // means nobody is listening, which isn't an error.
        let _ = self.inner.verified_tx.send(piece_index);

        Ok(Delivery::AcceptedVerified)
    }

    /// Reads `len` bytes at `offset` within the verified piece at
    /// `piece_index`. Fails with [`Error::PieceNotAvailable`] if the piece
    /// hasn't been verified yet.
    pub async fn read_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        if !self.have(piece_index) {
            return Err(Error::PieceNotAvailable(piece_index));
        }
        let (piece_len, _) = self.validate_block(piece_index, offset, len)?;

        if let Some(piece) =
            self.inner.read_cache.lock().unwrap().get(&piece_index)
        {
            let start = offset as usize;
            return Ok(piece[start..start + len as usize].to_vec());
        }

        let inner = Arc::clone(&self.inner);
        let offset_on_disk = self.inner.info.piece_offset(piece_index);
        let read_result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; piece_len as usize];
            inner.file.read_exact_at(&mut buf, offset_on_disk)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await?;

        let piece = match read_result {
            Ok(buf) => {
                self.inner.stats.read_count.fetch_add(1, Ordering::Relaxed);
                Arc::new(buf)
            }
            Err(e) => {
                self.inner.stats.read_failure_count.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Io(e));
            }
        };

        let start = offset as usize;
        let slice = piece[start..start + len as usize].to_vec();
        self.inner
            .read_cache
            .lock()
            .unwrap()
            .put(piece_index, piece);
        Ok(slice)
    }

    /// Validates that `offset`/`len` describe a well-formed, block-aligned
    /// range within the piece at `piece_index`, returning the piece's
    /// length and the index of the block within the piece.
    fn validate_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<(u32, usize)> {
        let piece_len = self.inner.info.piece_len(piece_index)?;
        let cfg_block_len = self.inner.block_len;
        if offset % cfg_block_len != 0 {
            return Err(Error::InvalidBlock);
        }
        let block_index = (offset / cfg_block_len) as usize;
        if block_index >= block_count(piece_len, cfg_block_len) {
            return Err(Error::InvalidBlock);
        }
        if len != block_len(piece_len, block_index, cfg_block_len) {
            return Err(Error::InvalidBlock);
        }
        Ok((piece_len, block_index))
    }
}

fn hash_piece_on_disk(
    inner: &Inner,
    index: PieceIndex,
) -> Result<crate::Sha1Hash> {
    let piece_len = inner.info.piece_len(index)?;
    let offset = inner.info.piece_offset(index);
    let mut buf = vec![0u8; piece_len as usize];
    // A freshly created, sparse file reads back as zeroes for any piece we
    // haven't written yet, which will simply fail to match its hash below.
    inner.file.read_exact_at(&mut buf, offset)?;
    let mut hasher = Sha1::new();
    hasher.update(&buf);
    let result = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&result);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn sample_metainfo(
        piece_len: u32,
        piece_hashes: Vec<[u8; 20]>,
        total_len: u64,
    ) -> Metainfo {
        let mut hashes = Vec::new();
        for h in &piece_hashes {
            hashes.extend_from_slice(h);
        }
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::str("payload.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(piece_len as i64));
        info.insert(b"length".to_vec(), Value::Int(total_len as i64));
        info.insert(b"pieces".to_vec(), Value::bytes(hashes));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::str("http://tracker.example/announce"),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&bencode::encode(&Value::Dict(root))).unwrap()
    }

    fn piece_hash(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&result);
        out
    }

    #[tokio::test]
    async fn reserving_and_delivering_a_single_block_piece_verifies_it() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let data = vec![7u8; piece_len as usize];
        let metainfo =
            sample_metainfo(piece_len, vec![piece_hash(&data)], piece_len as u64);

        let store = PieceStore::open(metainfo, dir.path(), BLOCK_LEN).await.unwrap();
        assert!(!store.have(0));

        assert!(store.reserve_block(0, 0, piece_len).unwrap());
        let outcome =
            store.deliver_block(0, 0, data.clone()).await.unwrap();
        assert_eq!(outcome, Delivery::AcceptedVerified);
        assert!(store.have(0));

        let read_back = store.read_block(0, 0, piece_len).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn mismatched_hash_rejects_and_resets_the_piece() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let data = vec![7u8; piece_len as usize];
        // Intentionally wrong expected hash.
        let metainfo =
            sample_metainfo(piece_len, vec![piece_hash(b"wrong")], piece_len as u64);

        let store = PieceStore::open(metainfo, dir.path(), BLOCK_LEN).await.unwrap();
        store.reserve_block(0, 0, piece_len).unwrap();
        let outcome = store.deliver_block(0, 0, data).await.unwrap();
        assert_eq!(outcome, Delivery::AcceptedRejected);
        assert!(!store.have(0));

        // The block can be reserved again after rejection.
        assert!(store.reserve_block(0, 0, piece_len).unwrap());
    }

    #[tokio::test]
    async fn reserve_block_rejects_misaligned_offset() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let metainfo = sample_metainfo(
            piece_len,
            vec![piece_hash(&vec![0u8; piece_len as usize])],
            piece_len as u64,
        );
        let store = PieceStore::open(metainfo, dir.path(), BLOCK_LEN).await.unwrap();
        assert!(store.reserve_block(0, 1, piece_len - 1).is_err());
    }

    #[tokio::test]
    async fn read_block_fails_before_verification() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let metainfo = sample_metainfo(
            piece_len,
            vec![piece_hash(&vec![0u8; piece_len as usize])],
            piece_len as u64,
        );
        let store = PieceStore::open(metainfo, dir.path(), BLOCK_LEN).await.unwrap();
        assert!(matches!(
            store.read_block(0, 0, piece_len).await,
            Err(Error::PieceNotAvailable(0))
        ));
    }

    #[tokio::test]
    async fn resuming_a_prefilled_file_verifies_it_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let data = vec![42u8; piece_len as usize];
        let metainfo = sample_metainfo(
            piece_len,
            vec![piece_hash(&data)],
            piece_len as u64,
        );

        // Pre-populate the file on disk before ever constructing the store,
        // simulating a previously completed (or partially completed)
        // download being resumed.
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, &data).unwrap();

        let store = PieceStore::open(metainfo, dir.path(), BLOCK_LEN).await.unwrap();
        assert!(store.have(0));
    }
}
