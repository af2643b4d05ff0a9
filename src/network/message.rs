//! Wire message types and the signed multipart codec
//!
//! Every message travels as an ordered sequence of opaque frames:
//! `[signature, signer-public-key, type-tag, reply-identity-or-empty,
//! ..payload]`. The signature is ECDSA over the SHA-256 of every frame
//! after the signature itself, so a parsed message is authenticated
//! against the public key it claims to come from.

use bytes::{BufMut, Bytes, BytesMut};
use secp256k1::PublicKey;
use thiserror::Error;

use crate::chain::{BlockHash, TxId};
use crate::crypto::{
    public_key_from_slice, sha256, verify_signature, Address, KeyError, KeyPair,
};
use crate::network::peer::PeerSetDelta;

/// Frames every message carries before the payload:
/// signature, public key, type tag, reply identity
pub const HEADER_FRAMES: usize = 4;

/// Cap on the number of hashes returned for one `GetBlockHashes`
pub const MAX_HASHES_PER_REPLY: usize = 500;

const TAG_PING: u8 = 0x01;
const TAG_PONG: u8 = 0x02;
const TAG_GET_BLOCK_HASHES: u8 = 0x03;
const TAG_BLOCK_HASHES: u8 = 0x04;
const TAG_GET_BLOCKS: u8 = 0x05;
const TAG_BLOCK: u8 = 0x06;
const TAG_GET_TXS: u8 = 0x07;
const TAG_TX: u8 = 0x08;
const TAG_TX_IDS: u8 = 0x09;
const TAG_PEER_SET_DELTA: u8 = 0x0A;

/// Errors raised while framing or parsing messages
///
/// Every variant other than `Key` maps to the "invalid message" class:
/// the dispatcher logs it and keeps running.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message truncated: got {0} frames")]
    Truncated(usize),
    #[error("Unknown message type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("Signature does not verify against the sender key")]
    BadSignature,
    #[error("Invalid public key frame")]
    BadPublicKey,
    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Delta encode/decode failed: {0}")]
    Delta(#[from] serde_json::Error),
}

/// Network message kinds
#[derive(Debug, Clone)]
pub enum Message {
    /// Liveness probe sent during the dial handshake
    Ping,
    /// Reply to `Ping`, carrying the responder's protocol version
    Pong { version: i32 },
    /// Request hashes after the deepest common ancestor of `locator`
    GetBlockHashes {
        locator: Vec<BlockHash>,
        stop: Option<BlockHash>,
    },
    /// Hash announcement or `GetBlockHashes` reply
    BlockHashes {
        sender: Address,
        hashes: Vec<BlockHash>,
    },
    /// Request the blocks for the given hashes, answered one `Block` each
    GetBlocks { hashes: Vec<BlockHash> },
    /// A single encoded block
    Block { payload: Bytes },
    /// Request the transactions for the given ids, answered one `Tx` each
    GetTxs { ids: Vec<TxId> },
    /// A single encoded transaction
    Tx { payload: Bytes },
    /// Transaction id announcement
    TxIds { sender: Address, ids: Vec<TxId> },
    /// Peer membership changes since the sender's last broadcast
    PeerSetDelta(PeerSetDelta),
}

impl Message {
    /// Wire tag for this message kind
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::Ping => TAG_PING,
            Message::Pong { .. } => TAG_PONG,
            Message::GetBlockHashes { .. } => TAG_GET_BLOCK_HASHES,
            Message::BlockHashes { .. } => TAG_BLOCK_HASHES,
            Message::GetBlocks { .. } => TAG_GET_BLOCKS,
            Message::Block { .. } => TAG_BLOCK,
            Message::GetTxs { .. } => TAG_GET_TXS,
            Message::Tx { .. } => TAG_TX,
            Message::TxIds { .. } => TAG_TX_IDS,
            Message::PeerSetDelta(_) => TAG_PEER_SET_DELTA,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping => "Ping",
            Message::Pong { .. } => "Pong",
            Message::GetBlockHashes { .. } => "GetBlockHashes",
            Message::BlockHashes { .. } => "BlockHashes",
            Message::GetBlocks { .. } => "GetBlocks",
            Message::Block { .. } => "Block",
            Message::GetTxs { .. } => "GetTxs",
            Message::Tx { .. } => "Tx",
            Message::TxIds { .. } => "TxIds",
            Message::PeerSetDelta(_) => "PeerSetDelta",
        }
    }

    fn payload_frames(&self) -> Result<Vec<Bytes>, MessageError> {
        let frames = match self {
            Message::Ping => vec![],
            Message::Pong { version } => {
                vec![Bytes::copy_from_slice(&version.to_be_bytes())]
            }
            Message::GetBlockHashes { locator, stop } => {
                let mut frames = vec![hash_list_frame(locator.iter().map(|h| h.as_bytes()))];
                if let Some(stop) = stop {
                    frames.push(Bytes::copy_from_slice(stop.as_bytes()));
                }
                frames
            }
            Message::BlockHashes { sender, hashes } => vec![
                Bytes::copy_from_slice(sender.as_bytes()),
                hash_list_frame(hashes.iter().map(|h| h.as_bytes())),
            ],
            Message::GetBlocks { hashes } => {
                vec![hash_list_frame(hashes.iter().map(|h| h.as_bytes()))]
            }
            Message::Block { payload } => vec![payload.clone()],
            Message::GetTxs { ids } => {
                vec![hash_list_frame(ids.iter().map(|id| id.as_bytes()))]
            }
            Message::Tx { payload } => vec![payload.clone()],
            Message::TxIds { sender, ids } => vec![
                Bytes::copy_from_slice(sender.as_bytes()),
                hash_list_frame(ids.iter().map(|id| id.as_bytes())),
            ],
            Message::PeerSetDelta(delta) => {
                vec![Bytes::from(serde_json::to_vec(delta)?)]
            }
        };
        Ok(frames)
    }
}

/// A parsed, authenticated message
///
/// `identity` is the routing identity a reply must carry: the
/// transport-prepended connection identity for router-received requests,
/// or the in-message reply identity for dealer-received replies.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    pub signer: PublicKey,
    pub identity: Bytes,
}

/// Frame a message for the wire, signing it with the local key
///
/// `reply_identity` is set when answering a request and left empty on
/// outbound requests and announcements.
pub fn encode(
    message: &Message,
    keys: &KeyPair,
    reply_identity: Option<&Bytes>,
) -> Result<Vec<Bytes>, MessageError> {
    let mut frames = Vec::with_capacity(HEADER_FRAMES + 2);
    frames.push(Bytes::new()); // signature placeholder
    frames.push(Bytes::copy_from_slice(&keys.public_key.serialize()));
    frames.push(Bytes::copy_from_slice(&[message.type_tag()]));
    frames.push(reply_identity.cloned().unwrap_or_default());
    frames.extend(message.payload_frames()?);

    let digest = signing_digest(&frames[1..]);
    frames[0] = Bytes::from(keys.sign(&digest)?);
    Ok(frames)
}

/// Parse and authenticate a multipart message
///
/// With `reply` false (router side) a transport-prepended connection
/// identity frame is consumed first and becomes the reply identity;
/// with `reply` true (dealer side) the in-message identity frame is used.
pub fn parse(frames: &[Bytes], reply: bool) -> Result<ReceivedMessage, MessageError> {
    let (conn_identity, body) = if reply {
        (None, frames)
    } else {
        let (first, rest) = frames
            .split_first()
            .ok_or(MessageError::Truncated(0))?;
        (Some(first.clone()), rest)
    };

    if body.len() < HEADER_FRAMES {
        return Err(MessageError::Truncated(body.len()));
    }

    let signer = public_key_from_slice(&body[1]).map_err(|_| MessageError::BadPublicKey)?;
    let digest = signing_digest(&body[1..]);
    if !verify_signature(&signer, &digest, &body[0]).map_err(|_| MessageError::BadSignature)? {
        return Err(MessageError::BadSignature);
    }

    if body[2].len() != 1 {
        return Err(MessageError::MalformedPayload("type tag"));
    }
    let tag = body[2][0];

    let identity = match conn_identity {
        Some(identity) => identity,
        None => body[3].clone(),
    };

    let payload = &body[HEADER_FRAMES..];
    let message = decode_payload(tag, payload)?;
    Ok(ReceivedMessage {
        message,
        signer,
        identity,
    })
}

fn decode_payload(tag: u8, payload: &[Bytes]) -> Result<Message, MessageError> {
    match tag {
        TAG_PING => {
            expect_frames(payload, 0, "Ping")?;
            Ok(Message::Ping)
        }
        TAG_PONG => {
            expect_frames(payload, 1, "Pong")?;
            let bytes: [u8; 4] = payload[0]
                .as_ref()
                .try_into()
                .map_err(|_| MessageError::MalformedPayload("Pong"))?;
            Ok(Message::Pong {
                version: i32::from_be_bytes(bytes),
            })
        }
        TAG_GET_BLOCK_HASHES => {
            if payload.is_empty() || payload.len() > 2 {
                return Err(MessageError::MalformedPayload("GetBlockHashes"));
            }
            let locator = parse_hash_list(&payload[0], "GetBlockHashes")?
                .into_iter()
                .map(BlockHash)
                .collect();
            let stop = match payload.get(1) {
                Some(frame) => Some(BlockHash(parse_hash(frame, "GetBlockHashes")?)),
                None => None,
            };
            Ok(Message::GetBlockHashes { locator, stop })
        }
        TAG_BLOCK_HASHES => {
            expect_frames(payload, 2, "BlockHashes")?;
            let sender = Address::from_slice(&payload[0])
                .map_err(|_| MessageError::MalformedPayload("BlockHashes"))?;
            let hashes = parse_hash_list(&payload[1], "BlockHashes")?
                .into_iter()
                .map(BlockHash)
                .collect();
            Ok(Message::BlockHashes { sender, hashes })
        }
        TAG_GET_BLOCKS => {
            expect_frames(payload, 1, "GetBlocks")?;
            let hashes = parse_hash_list(&payload[0], "GetBlocks")?
                .into_iter()
                .map(BlockHash)
                .collect();
            Ok(Message::GetBlocks { hashes })
        }
        TAG_BLOCK => {
            expect_frames(payload, 1, "Block")?;
            Ok(Message::Block {
                payload: payload[0].clone(),
            })
        }
        TAG_GET_TXS => {
            expect_frames(payload, 1, "GetTxs")?;
            let ids = parse_hash_list(&payload[0], "GetTxs")?
                .into_iter()
                .map(TxId)
                .collect();
            Ok(Message::GetTxs { ids })
        }
        TAG_TX => {
            expect_frames(payload, 1, "Tx")?;
            Ok(Message::Tx {
                payload: payload[0].clone(),
            })
        }
        TAG_TX_IDS => {
            expect_frames(payload, 2, "TxIds")?;
            let sender = Address::from_slice(&payload[0])
                .map_err(|_| MessageError::MalformedPayload("TxIds"))?;
            let ids = parse_hash_list(&payload[1], "TxIds")?
                .into_iter()
                .map(TxId)
                .collect();
            Ok(Message::TxIds { sender, ids })
        }
        TAG_PEER_SET_DELTA => {
            expect_frames(payload, 1, "PeerSetDelta")?;
            let delta: PeerSetDelta = serde_json::from_slice(&payload[0])?;
            Ok(Message::PeerSetDelta(delta))
        }
        other => Err(MessageError::UnknownTag(other)),
    }
}

fn signing_digest(frames: &[Bytes]) -> [u8; 32] {
    let mut data = Vec::with_capacity(frames.iter().map(Bytes::len).sum());
    for frame in frames {
        data.extend_from_slice(frame);
    }
    sha256(&data)
}

fn expect_frames(payload: &[Bytes], count: usize, what: &'static str) -> Result<(), MessageError> {
    if payload.len() != count {
        return Err(MessageError::MalformedPayload(what));
    }
    Ok(())
}

/// Build a count-prefixed frame of 32-byte items
fn hash_list_frame<'a>(items: impl ExactSizeIterator<Item = &'a [u8; 32]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + items.len() * 32);
    buf.put_u32(items.len() as u32);
    for item in items {
        buf.put_slice(item);
    }
    buf.freeze()
}

fn parse_hash(frame: &Bytes, what: &'static str) -> Result<[u8; 32], MessageError> {
    frame
        .as_ref()
        .try_into()
        .map_err(|_| MessageError::MalformedPayload(what))
}

fn parse_hash_list(frame: &Bytes, what: &'static str) -> Result<Vec<[u8; 32]>, MessageError> {
    if frame.len() < 4 {
        return Err(MessageError::MalformedPayload(what));
    }
    let count_bytes: [u8; 4] = frame[..4]
        .try_into()
        .map_err(|_| MessageError::MalformedPayload(what))?;
    let count = u32::from_be_bytes(count_bytes) as usize;
    if frame.len() != 4 + count * 32 {
        return Err(MessageError::MalformedPayload(what));
    }
    let mut out = Vec::with_capacity(count);
    for chunk in frame[4..].chunks_exact(32) {
        out.push(
            chunk
                .try_into()
                .map_err(|_| MessageError::MalformedPayload(what))?,
        );
    }
    Ok(out)
}
