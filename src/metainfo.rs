//! Parses a torrent descriptor (".torrent" file) into the immutable model
//! used by the rest of the engine, and computes its info-hash.
//!
//! Only single-file torrents are supported; the descriptor's `info`
//! dictionary is expected to carry a `length` key directly rather than a
//! `files` list.

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// An immutable, parsed torrent descriptor.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The single file's name, also used as the download's file name.
    pub name: String,
    /// The nominal length of a piece; all pieces have this length except
    /// possibly the last.
    pub piece_len: u32,
    /// The total length of the file, in bytes.
    pub total_len: u64,
    /// The concatenation of all 20-byte SHA-1 piece hashes, in piece order.
    piece_hashes: Vec<u8>,
    /// The 20-byte SHA-1 digest of the canonical encoding of the `info`
    /// sub-dictionary; identifies the torrent swarm-wide.
    info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses a descriptor from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let root = bencode::decode(buf)
            .map_err(|_| Error::BadDescriptor("not valid bencode".into()))?;
        let root = root
            .as_dict()
            .ok_or_else(|| Error::BadDescriptor("not a dictionary".into()))?;

        let announce = root
            .get("announce".as_bytes())
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::BadDescriptor("missing announce".into()))?;
        let announce = String::from_utf8_lossy(announce).into_owned();

        let info_value = root
            .get("info".as_bytes())
            .ok_or_else(|| Error::BadDescriptor("missing info dict".into()))?;
        let info = info_value
            .as_dict()
            .ok_or_else(|| Error::BadDescriptor("info is not a dict".into()))?;

        let name = info
            .get("name".as_bytes())
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::BadDescriptor("missing info.name".into()))?;
        let name = String::from_utf8_lossy(name).into_owned();

        let piece_len = info
            .get("piece length".as_bytes())
            .and_then(Value::as_int)
            .ok_or_else(|| {
                Error::BadDescriptor("missing info.piece length".into())
            })?;
        if piece_len <= 0 {
            return Err(Error::BadDescriptor(
                "piece length must be positive".into(),
            ));
        }
        let piece_len = piece_len as u32;

        let total_len = info
            .get("length".as_bytes())
            .and_then(Value::as_int)
            .ok_or_else(|| {
                Error::BadDescriptor(
                    "missing info.length (multi-file torrents are not \
                     supported)"
                        .into(),
                )
            })?;
        if total_len <= 0 {
            return Err(Error::BadDescriptor(
                "length must be positive".into(),
            ));
        }
        let total_len = total_len as u64;

        let piece_hashes = info
            .get("pieces".as_bytes())
            .and_then(Value::as_bytes)
            .ok_or_else(|| {
                Error::BadDescriptor("missing info.pieces".into())
            })?
            .to_vec();
        if piece_hashes.len() % 20 != 0 {
            return Err(Error::BadDescriptor(
                "pieces length is not a multiple of 20".into(),
            ));
        }

        let expected_piece_count =
            ((total_len + u64::from(piece_len) - 1) / u64::from(piece_len))
                as usize;
        if piece_hashes.len() / 20 != expected_piece_count {
            return Err(Error::BadDescriptor(
                "piece hash count doesn't match file length".into(),
            ));
        }

        let info_hash = {
            let canonical = bencode::encode(info_value);
            let digest = Sha1::digest(&canonical);
            let mut out = [0u8; 20];
            out.copy_from_slice(&digest);
            out
        };

        Ok(Self {
            announce,
            name,
            piece_len,
            total_len,
            piece_hashes,
            info_hash,
        })
    }

    /// Returns the 20-byte info hash identifying this torrent.
    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`, or `None` if
    /// `index` is out of range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(20)?;
        let end = start.checked_add(20)?;
        let slice = self.piece_hashes.get(start..end)?;
        let mut out = [0u8; 20];
        out.copy_from_slice(slice);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_descriptor(piece_hashes: &[u8]) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::str("greeting.txt"));
        info.insert(b"piece length".to_vec(), Value::Int(4));
        info.insert(b"length".to_vec(), Value::Int(9));
        info.insert(b"pieces".to_vec(), Value::bytes(piece_hashes.to_vec()));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::str("http://tracker.example/announce"),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        bencode::encode(&Value::Dict(root))
    }

    #[test]
    fn parses_single_file_descriptor() {
        // 9 bytes / 4-byte pieces => 3 pieces (4, 4, 1)
        let hashes = vec![0u8; 20 * 3];
        let bytes = sample_descriptor(&hashes);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.example/announce");
        assert_eq!(metainfo.name, "greeting.txt");
        assert_eq!(metainfo.piece_len, 4);
        assert_eq!(metainfo.total_len, 9);
        assert_eq!(metainfo.piece_count(), 3);
    }

    #[test]
    fn rejects_mismatched_piece_hash_count() {
        let hashes = vec![0u8; 20 * 2]; // should be 3
        let bytes = sample_descriptor(&hashes);
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::str("http://tracker.example/announce"),
        );
        // no `info` key
        let bytes = bencode::encode(&Value::Dict(root));
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn info_hash_is_independent_of_top_level_key_order() {
        let hashes = vec![1u8; 20 * 3];

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::str("greeting.txt"));
        info.insert(b"piece length".to_vec(), Value::Int(4));
        info.insert(b"length".to_vec(), Value::Int(9));
        info.insert(b"pieces".to_vec(), Value::bytes(hashes));
        let info_value = Value::Dict(info);

        // Two descriptors differing only in the order fields were inserted
        // before encoding; since both use the same canonical `BTreeMap`
        // encoding, the bytes (and thus info hash) must be identical.
        let mut root_a = BTreeMap::new();
        root_a.insert(b"announce".to_vec(), Value::str("http://a/"));
        root_a.insert(b"info".to_vec(), info_value.clone());

        let mut root_b = BTreeMap::new();
        root_b.insert(b"info".to_vec(), info_value);
        root_b.insert(b"announce".to_vec(), Value::str("http://a/"));

        let a = Metainfo::from_bytes(&bencode::encode(&Value::Dict(root_a)))
            .unwrap();
        let b = Metainfo::from_bytes(&bencode::encode(&Value::Dict(root_b)))
            .unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
    }
}
