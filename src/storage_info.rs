use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about the torrent's (single) file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's absolute path on disk.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The total length of the file.
    pub download_len: u64,
    /// The file this torrent is stored in.
    pub file: FileInfo,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: &PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.total_len;
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            download_len - u64::from(piece_len) * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file: FileInfo {
                path: download_dir.join(&metainfo.name),
                len: download_len,
            },
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the byte offset of the piece at the given index within the
    /// torrent's single file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * u64::from(self.piece_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_len_reports_last_piece_as_shorter() {
        let info = StorageInfo {
            piece_count: 4,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 3 * 4 + 2,
            file: FileInfo {
                path: PathBuf::from("/bogus"),
                len: 3 * 4 + 2,
            },
        };
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn piece_offset_is_index_times_piece_len() {
        let info = StorageInfo {
            piece_count: 4,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 64,
            file: FileInfo {
                path: PathBuf::from("/bogus"),
                len: 64,
            },
        };
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(3), 48);
    }
}
