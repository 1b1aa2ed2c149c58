//! HTTP(S) tracker communication.
//!
//! Announces are plain GET requests with the parameters BEP 3 specifies;
//! the response is a bencoded dictionary, parsed here with the [`bencode`]
//! module rather than a derive, since the one field that needs special
//! handling (`peers`, which may arrive either as a compact byte string or
//! as a list of `{ip, port}` dictionaries) doesn't fit a declarative
//! deserializer any better than a few lines of manual matching.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

use crate::{
    bencode::{self, Value},
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Percent-encode everything except the characters BEP 3 allows to pass
/// through unescaped in query parameters.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The announce event accompanying a request, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// The parameters of a single announce request.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub ip: Option<IpAddr>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub peer_count: Option<usize>,
    pub tracker_id: Option<String>,
    pub event: Option<Event>,
}

/// The tracker's response to an announce.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    /// An opaque id some trackers expect to be echoed back on subsequent
    /// announces.
    pub tracker_id: Option<String>,
    /// If present, the announce failed for the reason given here and the
    /// rest of the response's fields should not be trusted.
    pub failure_reason: Option<String>,
    /// A human readable warning that doesn't prevent the announce from
    /// succeeding.
    pub warning_message: Option<String>,
    /// How long to wait before the next announce.
    pub interval: Option<Duration>,
    /// The tracker's requested minimum between announces; if present, the
    /// client must not announce more often than this even if it otherwise
    /// would.
    pub min_interval: Option<Duration>,
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
    pub peers: Vec<SocketAddr>,
}

impl Response {
    fn from_bencode(buf: &[u8]) -> Result<Self> {
        let root = bencode::decode(buf)
            .map_err(|e| Error::Tracker(format!("malformed response: {}", e)))?;
        let root = root.as_dict().ok_or_else(|| {
            Error::Tracker("response is not a dictionary".into())
        })?;

        let string_field = |key: &str| -> Option<String> {
            root.get(key.as_bytes())
                .and_then(Value::as_bytes)
                .map(|b| String::from_utf8_lossy(b).into_owned())
        };
        let duration_field = |key: &str| -> Option<Duration> {
            root.get(key.as_bytes())
                .and_then(Value::as_int)
                .and_then(|secs| u64::try_from(secs).ok())
                .map(Duration::from_secs)
        };
        let count_field = |key: &str| -> Option<usize> {
            root.get(key.as_bytes())
                .and_then(Value::as_int)
                .and_then(|n| usize::try_from(n).ok())
        };

        Ok(Self {
            tracker_id: string_field("tracker id"),
            failure_reason: string_field("failure reason"),
            warning_message: string_field("warning message"),
            interval: duration_field("interval"),
            min_interval: duration_field("min interval"),
            seeder_count: count_field("complete"),
            leecher_count: count_field("incomplete"),
            peers: parse_peers(root.get("peers".as_bytes()))?,
        })
    }
}

/// Parses the `peers` field, which trackers may send either as a single
/// byte string of 6-byte `(ipv4, port)` entries ("compact" form, the one we
/// request via `compact=1`) or, for trackers that don't support compact
/// responses, as a list of `{ip, port}` dictionaries.
fn parse_peers(value: Option<&Value>) -> Result<Vec<SocketAddr>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    match value {
        Value::Bytes(bytes) => {
            const ENTRY_LEN: usize = 6;
            if bytes.len() % ENTRY_LEN != 0 {
                return Err(Error::Tracker(
                    "compact peers field length is not a multiple of 6"
                        .into(),
                ));
            }
            Ok(bytes
                .chunks_exact(ENTRY_LEN)
                .map(|entry| {
                    let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                    let port = u16::from_be_bytes([entry[4], entry[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .collect())
        }
        Value::List(items) => {
            let mut peers = Vec::with_capacity(items.len());
            for item in items {
                let dict = item.as_dict().ok_or_else(|| {
                    Error::Tracker("peer list entry is not a dictionary".into())
                })?;
                let ip = dict
                    .get("ip".as_bytes())
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| {
                        Error::Tracker("peer entry missing ip".into())
                    })?;
                let ip = String::from_utf8_lossy(ip);
                let port = dict
                    .get("port".as_bytes())
                    .and_then(Value::as_int)
                    .ok_or_else(|| {
                        Error::Tracker("peer entry missing port".into())
                    })?;
                let ip: IpAddr = ip.parse().map_err(|_| {
                    Error::Tracker(format!("invalid peer ip {:?}", ip))
                })?;
                peers.push(SocketAddr::new(ip, port as u16));
            }
            Ok(peers)
        }
        _ => Err(Error::Tracker(
            "peers field is neither a byte string nor a list".into(),
        )),
    }
}

/// An HTTP tracker client, bound to a single torrent's info hash and our
/// client's peer id.
#[derive(Clone)]
pub(crate) struct Tracker {
    client: reqwest::Client,
    url: Url,
}

impl Tracker {
    pub(crate) fn new(url: Url) -> Self {
        Self { client: reqwest::Client::new(), url }
    }

    /// Sends an announce request and parses the tracker's response.
    ///
    /// Fails with [`Error::Tracker`] if the tracker is unreachable, returns
    /// a non-2xx status, or its response doesn't parse as a tracker
    /// response; a `failure_reason` present in an otherwise well formed
    /// response is also turned into an error.
    pub(crate) async fn announce(&self, params: Announce) -> Result<Response> {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "info_hash",
                &percent_encoding::percent_encode(
                    &params.info_hash,
                    URL_ENCODE_RESERVED,
                )
                .to_string(),
            );
            query.append_pair(
                "peer_id",
                &percent_encoding::percent_encode(
                    &params.peer_id,
                    URL_ENCODE_RESERVED,
                )
                .to_string(),
            );
            query.append_pair("port", &params.port.to_string());
            query.append_pair("downloaded", &params.downloaded.to_string());
            query.append_pair("uploaded", &params.uploaded.to_string());
            query.append_pair("left", &params.left.to_string());
            query.append_pair("compact", "1");
            if let Some(count) = params.peer_count {
                query.append_pair("numwant", &count.to_string());
            }
            if let Some(ip) = params.ip {
                query.append_pair("ip", &ip.to_string());
            }
            if let Some(event) = params.event {
                query.append_pair("event", event.as_str());
            }
            if let Some(tracker_id) = &params.tracker_id {
                query.append_pair("trackerid", tracker_id);
            }
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let response = Response::from_bencode(&bytes)?;
        if let Some(reason) = &response.failure_reason {
            return Err(Error::Tracker(reason.clone()));
        }
        if let Some(warning) = &response.warning_message {
            log::warn!("tracker warning: {}", warning);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response_dict(peers: Value) -> Vec<u8> {
        use std::collections::BTreeMap;
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), bencode::Value::Int(1800));
        dict.insert(b"complete".to_vec(), bencode::Value::Int(5));
        dict.insert(b"incomplete".to_vec(), bencode::Value::Int(2));
        dict.insert(b"peers".to_vec(), peers);
        bencode::encode(&bencode::Value::Dict(dict))
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut compact = Vec::new();
        compact.extend_from_slice(&[127, 0, 0, 1]);
        compact.extend_from_slice(&6881u16.to_be_bytes());
        let bytes =
            sample_response_dict(bencode::Value::bytes(compact));
        let response = Response::from_bencode(&bytes).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.seeder_count, Some(5));
        assert_eq!(response.leecher_count, Some(2));
        assert_eq!(
            response.peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)]
        );
    }

    #[test]
    fn parses_dictionary_peer_list() {
        use std::collections::BTreeMap;
        let mut peer = BTreeMap::new();
        peer.insert(b"ip".to_vec(), Value::str("10.0.0.5"));
        peer.insert(b"port".to_vec(), Value::Int(51413));
        let peers = Value::List(vec![Value::Dict(peer)]);
        let bytes = sample_response_dict(peers);
        let response = Response::from_bencode(&bytes).unwrap();
        assert_eq!(
            response.peers,
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                51413
            )]
        );
    }

    #[test]
    fn rejects_malformed_compact_length() {
        let bytes =
            sample_response_dict(bencode::Value::bytes(vec![1, 2, 3]));
        assert!(Response::from_bencode(&bytes).is_err());
    }

    #[test]
    fn surfaces_failure_reason_as_an_error() {
        use std::collections::BTreeMap;
        let mut dict = BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            Value::str("torrent not registered"),
        );
        let bytes = bencode::encode(&Value::Dict(dict));
        let response = Response::from_bencode(&bytes).unwrap();
        assert_eq!(
            response.failure_reason.as_deref(),
            Some("torrent not registered")
        );
    }
}
