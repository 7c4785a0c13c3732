//! Core block/transaction types and consensus serialization.

pub mod asset;
pub mod block;
pub mod encoding;
pub mod fixed64;
pub mod hash;
pub mod program_hash;
pub mod transaction;

pub use asset::{Asset, MAX_PRECISION, MIN_PRECISION};
pub use block::{compute_merkle_root, merkle_hash_pair, Block, BlockHeader};
pub use fixed64::Fixed64;
pub use hash::{hash256_to_hex, sha256, sha256d, Hash256, ZERO_HASH};
pub use program_hash::{
    to_program_hash, ProgramHash, ProgramHashError, PREFIX_CROSS_CHAIN, PREFIX_MULTISIG,
    PREFIX_STANDARD,
};
pub use transaction::{
    Attribute, AttributeUsage, Input, OutPoint, Output, Payload, Program, Transaction,
    COINBASE_INPUT_INDEX, SIDECHAIN_POW_SIGNED_LEN,
};
