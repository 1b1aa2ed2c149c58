//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::{PeerId, BLOCK_LEN};

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents
/// by default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download and
    /// from which it is seeded.
    pub download_dir: PathBuf,

    /// The port on which the inbound listener accepts connections.
    pub listen_port: u16,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The number of outstanding block requests a single peer session keeps
    /// in flight at any given time.
    pub pipeline_depth: usize,

    /// The length of a block request, in bytes.
    pub block_len: u32,

    /// How long a session waits for a requested block before releasing its
    /// reservation back to the piece store.
    pub request_timeout: Duration,

    /// How long a session may remain idle (no message sent) before it sends
    /// a keepalive frame.
    pub keepalive_timeout: Duration,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to announcing at this cadence.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            listen_port: 6881,
            // We always request at least 10 peers as anything less is
            // a waste of network round trip and it allows us to buffer up a
            // bit more than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            pipeline_depth: 5,
            block_len: BLOCK_LEN,
            request_timeout: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(120),
            // needs testing
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
        }
    }
}
