//! Wire codecs for the peer protocol.
//!
//! The handshake is a fixed 68 byte frame exchanged once at the start of a
//! connection; everything after it is a stream of 4-byte-length-prefixed
//! messages. [`HandshakeCodec`] and [`PeerCodec`] implement
//! [`tokio_util::codec::Decoder`]/[`Encoder`] for each half, so a session can
//! start out `Framed` with the former and swap to the latter via
//! [`tokio_util::codec::FramedParts`] once the handshake completes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(super) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// `pstrlen (1) + pstr (19) + reserved (8) + info_hash (20) + peer_id (20)`.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The largest peer message we're willing to accept, guarding against a
/// malicious or buggy peer claiming an unbounded length prefix and
/// exhausting our memory.
const MAX_MESSAGE_LEN: u32 = crate::MAX_BLOCK_LEN + 13;

mod tags {
    pub(super) const CHOKE: u8 = 0;
    pub(super) const UNCHOKE: u8 = 1;
    pub(super) const INTERESTED: u8 = 2;
    pub(super) const NOT_INTERESTED: u8 = 3;
    pub(super) const HAVE: u8 = 4;
    pub(super) const BITFIELD: u8 = 5;
    pub(super) const REQUEST: u8 = 6;
    pub(super) const PIECE: u8 = 7;
    pub(super) const CANCEL: u8 = 8;
}

/// The handshake message, the first thing sent and received on a
/// connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

pub(super) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let pstr_len = buf[0] as usize;
        if pstr_len != PROTOCOL_STRING.len() {
            return Err(Error::BadHandshake(format!(
                "unexpected protocol string length {}",
                pstr_len
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        buf.advance(1);
        let pstr = buf.split_to(pstr_len);
        if pstr != PROTOCOL_STRING.as_bytes() {
            return Err(Error::BadHandshake(
                "unexpected protocol string".into(),
            ));
        }
        buf.advance(8); // reserved bytes, currently unused by any extension

        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A post-handshake peer protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum Message {
    /// Sent periodically to keep the connection alive when there's nothing
    /// else to say; carries no payload and no message id.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

pub(super) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(tags::CHOKE);
            }
            Message::Unchoke => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(tags::UNCHOKE);
            }
            Message::Interested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(tags::INTERESTED);
            }
            Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(tags::NOT_INTERESTED);
            }
            Message::Have { piece_index } => {
                buf.reserve(9);
                buf.put_u32(5);
                buf.put_u8(tags::HAVE);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.into_vec();
                buf.reserve(5 + raw.len());
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(tags::BITFIELD);
                buf.put_slice(&raw);
            }
            Message::Request(info) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(tags::REQUEST);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Cancel(info) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(tags::CANCEL);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Piece { piece_index, offset, data } => {
                let len = 9 + data.len();
                buf.reserve(4 + len);
                buf.put_u32(len as u32);
                buf.put_u8(tags::PIECE);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_bytes);

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::ProtocolViolation(format!(
                "message length {} exceeds maximum of {}",
                len, MAX_MESSAGE_LEN
            )));
        }

        let frame_len = 4 + len as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(len as usize);
        let id = frame.get_u8();

        let msg = match id {
            tags::CHOKE => Message::Choke,
            tags::UNCHOKE => Message::Unchoke,
            tags::INTERESTED => Message::Interested,
            tags::NOT_INTERESTED => Message::NotInterested,
            tags::HAVE => {
                if frame.len() != 4 {
                    return Err(Error::ProtocolViolation(
                        "have payload must be 4 bytes".into(),
                    ));
                }
                Message::Have { piece_index: frame.get_u32() as PieceIndex }
            }
            tags::BITFIELD => Message::Bitfield(Bitfield::from_vec(
                frame.to_vec(),
            )),
            tags::REQUEST | tags::CANCEL => {
                if frame.len() != 12 {
                    return Err(Error::ProtocolViolation(
                        "request/cancel payload must be 12 bytes".into(),
                    ));
                }
                let info = BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                };
                if id == tags::REQUEST {
                    Message::Request(info)
                } else {
                    Message::Cancel(info)
                }
            }
            tags::PIECE => {
                if frame.len() < 8 {
                    return Err(Error::ProtocolViolation(
                        "piece payload shorter than its header".into(),
                    ));
                }
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                Message::Piece { piece_index, offset, data: frame.to_vec() }
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown message id {}",
                    other
                )))
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        codec.encode(hs.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hs);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_slice(b"ftp!");
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 20]);
        buf.put_slice(&[0u8; 20]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        // incomplete: missing reserved/info_hash/peer_id
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn simple_messages_round_trip() {
        let mut codec = PeerCodec;
        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 7 },
        ] {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn request_and_piece_round_trip() {
        let mut codec = PeerCodec;
        let info = BlockInfo { piece_index: 3, offset: 0x4000, len: 0x4000 };

        let mut buf = BytesMut::new();
        codec.encode(Message::Request(info), &mut buf).unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Request(info)
        );

        let piece = Message::Piece {
            piece_index: 3,
            offset: 0x4000,
            data: vec![9u8; 16],
        };
        let mut buf = BytesMut::new();
        codec.encode(piece.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), piece);
    }

    #[test]
    fn rejects_oversized_message_length() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(tags::HAVE);
        // missing the 4-byte piece index payload
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
