//! Transaction types and consensus serialization.
//!
//! A transaction is immutable once constructed: the payload variant doubles
//! as the transaction type tag on the wire. `serialize_unsigned` covers
//! everything except the programs and is the image both the transaction hash
//! and signature verification are computed over.

use crate::asset::Asset;
use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::fixed64::Fixed64;
use crate::hash::{sha256d, Hash256, ZERO_HASH};
use crate::program_hash::ProgramHash;

/// Index value of the coinbase sentinel input.
pub const COINBASE_INPUT_INDEX: u16 = u16::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutPoint {
    pub tx_id: Hash256,
    pub index: u16,
}

impl OutPoint {
    pub const fn new(tx_id: Hash256, index: u16) -> Self {
        Self { tx_id, index }
    }

    /// Canonical byte form of `(prev_tx_id, prev_index)` used for intra-tx
    /// duplicate detection.
    pub fn refer_key(&self) -> [u8; 34] {
        let mut key = [0u8; 34];
        key[..32].copy_from_slice(&self.tx_id);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn is_coinbase_sentinel(&self) -> bool {
        self.tx_id == ZERO_HASH && self.index == COINBASE_INPUT_INDEX
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.tx_id);
        encoder.write_u16_le(self.index);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tx_id = decoder.read_hash()?;
        let index = decoder.read_u16_le()?;
        Ok(Self { tx_id, index })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Input {
    pub previous: OutPoint,
    pub sequence: u32,
}

impl Input {
    pub fn encode(&self, encoder: &mut Encoder) {
        self.previous.encode(encoder);
        encoder.write_u32_le(self.sequence);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let previous = OutPoint::decode(decoder)?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self { previous, sequence })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Output {
    pub asset_id: Hash256,
    pub value: Fixed64,
    pub output_lock: u32,
    pub program_hash: ProgramHash,
}

impl Output {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.asset_id);
        encoder.write_i64_le(self.value.raw());
        encoder.write_u32_le(self.output_lock);
        encoder.write_bytes(self.program_hash.as_bytes());
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let asset_id = decoder.read_hash()?;
        let value = Fixed64::new(decoder.read_i64_le()?);
        let output_lock = decoder.read_u32_le()?;
        let program_hash = ProgramHash::new(decoder.read_fixed::<21>()?);
        Ok(Self {
            asset_id,
            value,
            output_lock,
            program_hash,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttributeUsage {
    Nonce,
    Script,
    Memo,
    Description,
    DescriptionUrl,
    Confirmations,
}

impl AttributeUsage {
    pub fn to_byte(self) -> u8 {
        match self {
            AttributeUsage::Nonce => 0x00,
            AttributeUsage::Script => 0x20,
            AttributeUsage::Memo => 0x81,
            AttributeUsage::Description => 0x90,
            AttributeUsage::DescriptionUrl => 0x91,
            AttributeUsage::Confirmations => 0x92,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(AttributeUsage::Nonce),
            0x20 => Some(AttributeUsage::Script),
            0x81 => Some(AttributeUsage::Memo),
            0x90 => Some(AttributeUsage::Description),
            0x91 => Some(AttributeUsage::DescriptionUrl),
            0x92 => Some(AttributeUsage::Confirmations),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub usage: AttributeUsage,
    pub data: Vec<u8>,
}

impl Attribute {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.usage.to_byte());
        encoder.write_var_bytes(&self.data);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let usage_byte = decoder.read_u8()?;
        let usage = AttributeUsage::from_byte(usage_byte).ok_or(DecodeError::InvalidValue)?;
        let data = decoder.read_var_bytes()?;
        Ok(Self { usage, data })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Program {
    pub code: Vec<u8>,
    pub parameter: Vec<u8>,
}

impl Program {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.code);
        encoder.write_var_bytes(&self.parameter);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let code = decoder.read_var_bytes()?;
        let parameter = decoder.read_var_bytes()?;
        Ok(Self { code, parameter })
    }
}

/// Number of leading serialized payload bytes covered by the arbitrator
/// signature of a sidechain-pow transaction.
pub const SIDECHAIN_POW_SIGNED_LEN: usize = 68;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    CoinBase {
        data: Vec<u8>,
    },
    RegisterAsset {
        asset: Asset,
        amount: Fixed64,
        controller: ProgramHash,
    },
    TransferAsset,
    Record {
        record_type: String,
        record_data: Vec<u8>,
    },
    SideChainPow {
        side_block_hash: Hash256,
        side_genesis_hash: Hash256,
        block_height: u32,
        signed_data: Vec<u8>,
    },
    WithdrawFromSideChain {
        block_height: u32,
        genesis_block_address: String,
        side_chain_transaction_hashes: Vec<Hash256>,
    },
    TransferCrossChainAsset {
        cross_chain_addresses: Vec<String>,
        cross_chain_amounts: Vec<Fixed64>,
        output_indexes: Vec<u64>,
    },
}

impl Payload {
    pub fn type_byte(&self) -> u8 {
        match self {
            Payload::CoinBase { .. } => 0x00,
            Payload::RegisterAsset { .. } => 0x01,
            Payload::TransferAsset => 0x02,
            Payload::Record { .. } => 0x03,
            Payload::SideChainPow { .. } => 0x05,
            Payload::WithdrawFromSideChain { .. } => 0x07,
            Payload::TransferCrossChainAsset { .. } => 0x08,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::CoinBase { .. } => "CoinBase",
            Payload::RegisterAsset { .. } => "RegisterAsset",
            Payload::TransferAsset => "TransferAsset",
            Payload::Record { .. } => "Record",
            Payload::SideChainPow { .. } => "SideChainPow",
            Payload::WithdrawFromSideChain { .. } => "WithdrawFromSideChain",
            Payload::TransferCrossChainAsset { .. } => "TransferCrossChainAsset",
        }
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        match self {
            Payload::CoinBase { data } => encoder.write_var_bytes(data),
            Payload::RegisterAsset {
                asset,
                amount,
                controller,
            } => {
                asset.encode(encoder);
                encoder.write_i64_le(amount.raw());
                encoder.write_bytes(controller.as_bytes());
            }
            Payload::TransferAsset => {}
            Payload::Record {
                record_type,
                record_data,
            } => {
                encoder.write_var_str(record_type);
                encoder.write_var_bytes(record_data);
            }
            Payload::SideChainPow {
                side_block_hash,
                side_genesis_hash,
                block_height,
                signed_data,
            } => {
                encoder.write_hash(side_block_hash);
                encoder.write_hash(side_genesis_hash);
                encoder.write_u32_le(*block_height);
                encoder.write_var_bytes(signed_data);
            }
            Payload::WithdrawFromSideChain {
                block_height,
                genesis_block_address,
                side_chain_transaction_hashes,
            } => {
                encoder.write_u32_le(*block_height);
                encoder.write_var_str(genesis_block_address);
                encoder.write_varint(side_chain_transaction_hashes.len() as u64);
                for hash in side_chain_transaction_hashes {
                    encoder.write_hash(hash);
                }
            }
            Payload::TransferCrossChainAsset {
                cross_chain_addresses,
                cross_chain_amounts,
                output_indexes,
            } => {
                encoder.write_varint(cross_chain_addresses.len() as u64);
                for address in cross_chain_addresses {
                    encoder.write_var_str(address);
                }
                encoder.write_varint(cross_chain_amounts.len() as u64);
                for amount in cross_chain_amounts {
                    encoder.write_i64_le(amount.raw());
                }
                encoder.write_varint(output_indexes.len() as u64);
                for index in output_indexes {
                    encoder.write_varint(*index);
                }
            }
        }
    }

    pub fn decode(type_byte: u8, decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        match type_byte {
            0x00 => Ok(Payload::CoinBase {
                data: decoder.read_var_bytes()?,
            }),
            0x01 => {
                let asset = Asset::decode(decoder)?;
                let amount = Fixed64::new(decoder.read_i64_le()?);
                let controller = ProgramHash::new(decoder.read_fixed::<21>()?);
                Ok(Payload::RegisterAsset {
                    asset,
                    amount,
                    controller,
                })
            }
            0x02 => Ok(Payload::TransferAsset),
            0x03 => Ok(Payload::Record {
                record_type: decoder.read_var_str()?,
                record_data: decoder.read_var_bytes()?,
            }),
            0x05 => Ok(Payload::SideChainPow {
                side_block_hash: decoder.read_hash()?,
                side_genesis_hash: decoder.read_hash()?,
                block_height: decoder.read_u32_le()?,
                signed_data: decoder.read_var_bytes()?,
            }),
            0x07 => {
                let block_height = decoder.read_u32_le()?;
                let genesis_block_address = decoder.read_var_str()?;
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
                let mut hashes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    hashes.push(decoder.read_hash()?);
                }
                Ok(Payload::WithdrawFromSideChain {
                    block_height,
                    genesis_block_address,
                    side_chain_transaction_hashes: hashes,
                })
            }
            0x08 => {
                let address_count = decoder.read_varint()?;
                let address_count =
                    usize::try_from(address_count).map_err(|_| DecodeError::Overflow)?;
                let mut addresses = Vec::with_capacity(address_count.min(1024));
                for _ in 0..address_count {
                    addresses.push(decoder.read_var_str()?);
                }
                let amount_count = decoder.read_varint()?;
                let amount_count =
                    usize::try_from(amount_count).map_err(|_| DecodeError::Overflow)?;
                let mut amounts = Vec::with_capacity(amount_count.min(1024));
                for _ in 0..amount_count {
                    amounts.push(Fixed64::new(decoder.read_i64_le()?));
                }
                let index_count = decoder.read_varint()?;
                let index_count =
                    usize::try_from(index_count).map_err(|_| DecodeError::Overflow)?;
                let mut indexes = Vec::with_capacity(index_count.min(1024));
                for _ in 0..index_count {
                    indexes.push(decoder.read_varint()?);
                }
                Ok(Payload::TransferCrossChainAsset {
                    cross_chain_addresses: addresses,
                    cross_chain_amounts: amounts,
                    output_indexes: indexes,
                })
            }
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub payload: Payload,
    pub payload_version: u8,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub lock_time: u32,
    pub programs: Vec<Program>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        matches!(self.payload, Payload::CoinBase { .. })
    }

    pub fn is_sidechain_pow(&self) -> bool {
        matches!(self.payload, Payload::SideChainPow { .. })
    }

    pub fn is_withdraw_from_sidechain(&self) -> bool {
        matches!(self.payload, Payload::WithdrawFromSideChain { .. })
    }

    pub fn is_transfer_cross_chain_asset(&self) -> bool {
        matches!(self.payload, Payload::TransferCrossChainAsset { .. })
    }

    /// Serialized image without programs: the preimage of both the
    /// transaction hash and every program signature.
    pub fn serialize_unsigned(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_unsigned(&mut encoder);
        encoder.into_inner()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_unsigned(&mut encoder);
        encoder.write_varint(self.programs.len() as u64);
        for program in &self.programs {
            program.encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let type_byte = decoder.read_u8()?;
        let payload_version = decoder.read_u8()?;
        let payload = Payload::decode(type_byte, decoder)?;

        let attribute_count = decoder.read_varint()?;
        let attribute_count =
            usize::try_from(attribute_count).map_err(|_| DecodeError::Overflow)?;
        let mut attributes = Vec::with_capacity(attribute_count.min(1024));
        for _ in 0..attribute_count {
            attributes.push(Attribute::decode(decoder)?);
        }

        let input_count = decoder.read_varint()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::Overflow)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(Input::decode(decoder)?);
        }

        let output_count = decoder.read_varint()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::Overflow)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(Output::decode(decoder)?);
        }

        let lock_time = decoder.read_u32_le()?;

        let program_count = decoder.read_varint()?;
        let program_count = usize::try_from(program_count).map_err(|_| DecodeError::Overflow)?;
        let mut programs = Vec::with_capacity(program_count.min(1024));
        for _ in 0..program_count {
            programs.push(Program::decode(decoder)?);
        }

        Ok(Self {
            payload,
            payload_version,
            attributes,
            inputs,
            outputs,
            lock_time,
            programs,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize_unsigned())
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    fn encode_unsigned(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.payload.type_byte());
        encoder.write_u8(self.payload_version);
        self.payload.encode(encoder);
        encoder.write_varint(self.attributes.len() as u64);
        for attribute in &self.attributes {
            attribute.encode(encoder);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transfer() -> Transaction {
        Transaction {
            payload: Payload::TransferAsset,
            payload_version: 0,
            attributes: vec![Attribute {
                usage: AttributeUsage::Nonce,
                data: vec![1, 2, 3, 4],
            }],
            inputs: vec![Input {
                previous: OutPoint::new([0x11; 32], 3),
                sequence: 0,
            }],
            outputs: vec![Output {
                asset_id: [0x22; 32],
                value: Fixed64::from_whole(5),
                output_lock: 0,
                program_hash: ProgramHash::new([0x21; 21]),
            }],
            lock_time: 0,
            programs: vec![Program {
                code: vec![0x21, 0xAC],
                parameter: vec![0x40],
            }],
        }
    }

    #[test]
    fn transaction_round_trip() {
        let tx = sample_transfer();
        let bytes = tx.serialize();
        let decoded = Transaction::deserialize(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn hash_ignores_programs() {
        let mut tx = sample_transfer();
        let before = tx.hash();
        tx.programs[0].parameter = vec![0x41, 0x42];
        assert_eq!(tx.hash(), before);
    }

    #[test]
    fn coinbase_sentinel_detection() {
        let sentinel = OutPoint::new(ZERO_HASH, COINBASE_INPUT_INDEX);
        assert!(sentinel.is_coinbase_sentinel());
        assert!(!OutPoint::new(ZERO_HASH, 0).is_coinbase_sentinel());
        assert!(!OutPoint::new([1u8; 32], COINBASE_INPUT_INDEX).is_coinbase_sentinel());
    }

    #[test]
    fn refer_key_distinguishes_index() {
        let a = OutPoint::new([0x11; 32], 0).refer_key();
        let b = OutPoint::new([0x11; 32], 1).refer_key();
        assert_ne!(a, b);
    }

    #[test]
    fn sidechain_pow_signed_prefix_is_68_bytes() {
        let payload = Payload::SideChainPow {
            side_block_hash: [0xAA; 32],
            side_genesis_hash: [0xBB; 32],
            block_height: 7,
            signed_data: vec![0x01, 0x02],
        };
        let mut encoder = Encoder::new();
        payload.encode(&mut encoder);
        let bytes = encoder.into_inner();
        assert!(bytes.len() > SIDECHAIN_POW_SIGNED_LEN);
        assert_eq!(&bytes[..32], &[0xAA; 32]);
        assert_eq!(&bytes[32..64], &[0xBB; 32]);
        assert_eq!(&bytes[64..68], &7u32.to_le_bytes());
    }
}
