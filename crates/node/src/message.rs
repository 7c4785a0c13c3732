//! Wire messages exchanged with peers. Framing (header, magic, checksum)
//! lives in the transport module; this file is the payload codec.

use meridian_consensus::constants::{
    MAX_BLOCKS_PER_MSG, MAX_INV_PER_MSG, REQUEST_CONSENSUS_SIZE, RESPONSE_BLOCKS_MAX_SIZE,
};
use meridian_primitives::encoding::{DecodeError, Decoder, Encoder};
use meridian_primitives::{Block, BlockHeader, Hash256, Transaction};

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;

/// Default payload cap for commands without a dedicated bound.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
/// Payload cap for full block messages.
pub const MAX_BLOCK_PAYLOAD_SIZE: usize = 8 * 1024 * 1024 + 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Tx => MSG_TX,
            InvType::Block => MSG_BLOCK,
            InvType::FilteredBlock => MSG_FILTERED_BLOCK,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, DecodeError> {
        match value {
            MSG_TX => Ok(InvType::Tx),
            MSG_BLOCK => Ok(InvType::Block),
            MSG_FILTERED_BLOCK => Ok(InvType::FilteredBlock),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvVect {
    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

impl RejectCode {
    pub fn to_byte(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0x01 => Ok(RejectCode::Malformed),
            0x10 => Ok(RejectCode::Invalid),
            0x11 => Ok(RejectCode::Obsolete),
            0x12 => Ok(RejectCode::Duplicate),
            0x40 => Ok(RejectCode::Nonstandard),
            0x41 => Ok(RejectCode::Dust),
            0x42 => Ok(RejectCode::InsufficientFee),
            0x43 => Ok(RejectCode::Checkpoint),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub port: u16,
    pub nonce: u64,
    pub height: u32,
    pub relay: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterLoadPayload {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBlockPayload {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    VerAck,
    Ping(u64),
    Pong(u64),
    FilterLoad(FilterLoadPayload),
    GetBlocks {
        locator: Vec<Hash256>,
        hash_stop: Hash256,
    },
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    Block(Block),
    Tx(Transaction),
    NotFound(Vec<InvVect>),
    MemPool,
    Reject {
        message: String,
        code: RejectCode,
        reason: String,
        hash: Hash256,
    },
    MerkleBlock(MerkleBlockPayload),
    RequestConsensus {
        height: u32,
    },
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FilterLoad(_) => "filterload",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::NotFound(_) => "notfound",
            Message::MemPool => "mempool",
            Message::Reject { .. } => "reject",
            Message::MerkleBlock(_) => "merkleblock",
            Message::RequestConsensus { .. } => "reqconsensus",
        }
    }

    /// Per-command payload bound enforced before a frame body is read.
    pub fn max_payload_size(command: &str) -> usize {
        match command {
            "block" => MAX_BLOCK_PAYLOAD_SIZE,
            "responseblocks" => RESPONSE_BLOCKS_MAX_SIZE,
            "reqconsensus" => REQUEST_CONSENSUS_SIZE,
            _ => MAX_PAYLOAD_SIZE,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => {
                encoder.write_u32_le(version.version);
                encoder.write_u64_le(version.services);
                encoder.write_i64_le(version.timestamp);
                encoder.write_u16_le(version.port);
                encoder.write_u64_le(version.nonce);
                encoder.write_u32_le(version.height);
                encoder.write_u8(u8::from(version.relay));
            }
            Message::VerAck | Message::MemPool => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::FilterLoad(payload) => {
                encoder.write_var_bytes(&payload.filter);
                encoder.write_u32_le(payload.hash_funcs);
                encoder.write_u32_le(payload.tweak);
                encoder.write_u8(payload.flags);
            }
            Message::GetBlocks { locator, hash_stop } => {
                encoder.write_varint(locator.len() as u64);
                for hash in locator {
                    encoder.write_hash(hash);
                }
                encoder.write_hash(hash_stop);
            }
            Message::Inv(vectors) | Message::GetData(vectors) | Message::NotFound(vectors) => {
                encode_inv_vectors(&mut encoder, vectors);
            }
            Message::Block(block) => encoder.write_bytes(&block.serialize()),
            Message::Tx(tx) => encoder.write_bytes(&tx.serialize()),
            Message::Reject {
                message,
                code,
                reason,
                hash,
            } => {
                encoder.write_var_str(message);
                encoder.write_u8(code.to_byte());
                encoder.write_var_str(reason);
                encoder.write_hash(hash);
            }
            Message::MerkleBlock(payload) => {
                payload.header.encode(&mut encoder);
                encoder.write_u32_le(payload.total_transactions);
                encoder.write_varint(payload.hashes.len() as u64);
                for hash in &payload.hashes {
                    encoder.write_hash(hash);
                }
                encoder.write_var_bytes(&payload.flags);
            }
            Message::RequestConsensus { height } => encoder.write_u32_le(*height),
        }
        encoder.into_inner()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => Message::Version(VersionPayload {
                version: decoder.read_u32_le()?,
                services: decoder.read_u64_le()?,
                timestamp: decoder.read_i64_le()?,
                port: decoder.read_u16_le()?,
                nonce: decoder.read_u64_le()?,
                height: decoder.read_u32_le()?,
                relay: decoder.read_u8()? != 0,
            }),
            "verack" => Message::VerAck,
            "ping" => Message::Ping(decoder.read_u64_le()?),
            "pong" => Message::Pong(decoder.read_u64_le()?),
            "filterload" => Message::FilterLoad(FilterLoadPayload {
                filter: decoder.read_var_bytes()?,
                hash_funcs: decoder.read_u32_le()?,
                tweak: decoder.read_u32_le()?,
                flags: decoder.read_u8()?,
            }),
            "getblocks" => {
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
                if count > MAX_BLOCKS_PER_MSG {
                    return Err(DecodeError::Overflow);
                }
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(decoder.read_hash()?);
                }
                let hash_stop = decoder.read_hash()?;
                Message::GetBlocks { locator, hash_stop }
            }
            "inv" => Message::Inv(decode_inv_vectors(&mut decoder)?),
            "getdata" => Message::GetData(decode_inv_vectors(&mut decoder)?),
            "notfound" => Message::NotFound(decode_inv_vectors(&mut decoder)?),
            "block" => Message::Block(Block::deserialize(payload)?),
            "tx" => Message::Tx(Transaction::deserialize(payload)?),
            "mempool" => Message::MemPool,
            "reject" => Message::Reject {
                message: decoder.read_var_str()?,
                code: RejectCode::from_byte(decoder.read_u8()?)?,
                reason: decoder.read_var_str()?,
                hash: decoder.read_hash()?,
            },
            "merkleblock" => {
                let header = BlockHeader::decode(&mut decoder)?;
                let total_transactions = decoder.read_u32_le()?;
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
                if count > MAX_INV_PER_MSG {
                    return Err(DecodeError::Overflow);
                }
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(decoder.read_hash()?);
                }
                let flags = decoder.read_var_bytes()?;
                Message::MerkleBlock(MerkleBlockPayload {
                    header,
                    total_transactions,
                    hashes,
                    flags,
                })
            }
            "reqconsensus" => Message::RequestConsensus {
                height: decoder.read_u32_le()?,
            },
            _ => return Err(DecodeError::InvalidValue),
        };
        if !matches!(command, "block" | "tx") {
            decoder.finish()?;
        }
        Ok(message)
    }
}

fn encode_inv_vectors(encoder: &mut Encoder, vectors: &[InvVect]) {
    encoder.write_varint(vectors.len() as u64);
    for vector in vectors {
        encoder.write_u32_le(vector.inv_type.to_u32());
        encoder.write_hash(&vector.hash);
    }
}

fn decode_inv_vectors(decoder: &mut Decoder<'_>) -> Result<Vec<InvVect>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
    if count > MAX_INV_PER_MSG {
        return Err(DecodeError::Overflow);
    }
    let mut vectors = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let inv_type = InvType::from_u32(decoder.read_u32_le()?)?;
        let hash = decoder.read_hash()?;
        vectors.push(InvVect { inv_type, hash });
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let payload = message.encode_payload();
        let decoded =
            Message::decode_payload(message.command(), &payload).expect("decode payload");
        assert_eq!(decoded, message);
    }

    #[test]
    fn control_messages_round_trip() {
        round_trip(Message::Version(VersionPayload {
            version: 1,
            services: 4,
            timestamp: 1_700_000_000,
            port: 20866,
            nonce: 99,
            height: 1234,
            relay: true,
        }));
        round_trip(Message::VerAck);
        round_trip(Message::Ping(7));
        round_trip(Message::MemPool);
        round_trip(Message::RequestConsensus { height: 42 });
    }

    #[test]
    fn inventory_messages_round_trip() {
        let vectors = vec![InvVect::block([0x01; 32]), InvVect::tx([0x02; 32])];
        round_trip(Message::Inv(vectors.clone()));
        round_trip(Message::GetData(vectors.clone()));
        round_trip(Message::NotFound(vectors));
        round_trip(Message::GetBlocks {
            locator: vec![[0x03; 32], [0x04; 32]],
            hash_stop: [0x05; 32],
        });
    }

    #[test]
    fn reject_round_trip() {
        round_trip(Message::Reject {
            message: "tx".to_string(),
            code: RejectCode::Duplicate,
            reason: "duplicate transaction".to_string(),
            hash: [0x66; 32],
        });
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(
            Message::decode_payload("nonsense", &[]),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn inv_count_is_capped() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_INV_PER_MSG as u64 + 1);
        let payload = encoder.into_inner();
        assert_eq!(
            Message::decode_payload("inv", &payload),
            Err(DecodeError::Overflow)
        );
    }

    #[test]
    fn request_consensus_is_four_bytes() {
        let payload = Message::RequestConsensus { height: 7 }.encode_payload();
        assert_eq!(payload.len(), REQUEST_CONSENSUS_SIZE);
        assert_eq!(
            Message::max_payload_size("reqconsensus"),
            REQUEST_CONSENSUS_SIZE
        );
    }
}
