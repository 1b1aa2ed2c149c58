// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod bencode;
pub mod conf;
mod disk;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod scheduler;
mod storage_info;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use disk::{Delivery, PieceStore};
pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer or of the piece
/// store.
///
/// It is a compact bool vector ordered from most significant to least
/// significant bits, that is, where the first highest bit represents the
/// first piece, the second highest bit the second piece, and so on (e.g.
/// `0b1100_0001` would mean that we have pieces 0, 1, and 7). A truthy
/// boolean value of a piece's position in this vector means that the holder
/// has the piece, while a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block of the last piece). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The largest block length we are willing to serve or accept in a `request`
/// message, per the block validity rule ("length ≤ B_max, typically 2^17").
pub const MAX_BLOCK_LEN: u32 = 0x20000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happens at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except
    /// possibly for the last block of the last piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> PieceIndex {
        // we need to use "lower than or equal" as this may be the last block
        // in which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as PieceIndex
    }
}

/// Returns the length of the block at the index in piece, given the
/// configured block length (spec §6's `block-size`; see [`TorrentConf`]).
///
/// If the piece is not a multiple of `block_len`, the returned value is
/// smaller for the last block.
///
/// # Panics
///
/// Panics if the index multiplied by `block_len` would exceed the piece
/// length.
///
/// [`TorrentConf`]: crate::conf::TorrentConf
pub(crate) fn block_len(piece_len: u32, index: usize, block_len: u32) -> u32 {
    let index = index as u32;
    let block_offset = index * block_len;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, block_len)
}

/// Returns the number of blocks in a piece of the given length, given the
/// configured block length.
pub(crate) fn block_count(piece_len: u32, block_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (block_len as usize - 1)) / block_len as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical
    // block length and the amount with which it overlaps the nearest exact
    // multiple value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(
            block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0, BLOCK_LEN),
            BLOCK_LEN
        );
        assert_eq!(
            block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1, BLOCK_LEN),
            BLOCK_LEN
        );

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0, BLOCK_LEN), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1, BLOCK_LEN), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2, BLOCK_LEN), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2, BLOCK_LEN);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN), 2);

        assert_eq!(block_count(UNEVEN_PIECE_LEN, BLOCK_LEN), 3);
    }
}
