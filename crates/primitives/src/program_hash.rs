//! 21-byte script identities. Byte 0 tags the script kind, the remaining 20
//! bytes are ripemd160(sha256(code)).

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PROGRAM_HASH_LEN: usize = 21;

pub const PREFIX_STANDARD: u8 = 0x21;
pub const PREFIX_MULTISIG: u8 = 0x12;
pub const PREFIX_CROSS_CHAIN: u8 = 0x4B;

/// Trailing opcode of a standard single-signature redeem script.
pub const OP_CHECKSIG: u8 = 0xAC;
/// Trailing opcode of a multi-signature redeem script.
pub const OP_CHECKMULTISIG: u8 = 0xAE;
/// Trailing opcode of a cross-chain redeem script.
pub const OP_CROSSCHAIN: u8 = 0xAF;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ProgramHashError {
    #[error("program code is empty")]
    EmptyCode,
    #[error("unknown trailing opcode {0:#04x}")]
    UnknownOpcode(u8),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProgramHash(pub [u8; PROGRAM_HASH_LEN]);

impl ProgramHash {
    pub const NULL: ProgramHash = ProgramHash([0u8; PROGRAM_HASH_LEN]);

    pub const fn new(bytes: [u8; PROGRAM_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8; PROGRAM_HASH_LEN] {
        &self.0
    }

    /// Valid destinations for transaction outputs: standard, multisig,
    /// cross-chain, or the null hash.
    pub fn is_valid_output_destination(&self) -> bool {
        matches!(
            self.prefix(),
            PREFIX_STANDARD | PREFIX_MULTISIG | PREFIX_CROSS_CHAIN
        ) || self.is_null()
    }
}

/// Derives the 21-byte program hash of a redeem script. The prefix comes
/// from the script's trailing opcode, the body from ripemd160(sha256(code)).
pub fn to_program_hash(code: &[u8]) -> Result<ProgramHash, ProgramHashError> {
    let last = *code.last().ok_or(ProgramHashError::EmptyCode)?;
    let prefix = match last {
        OP_CHECKSIG => PREFIX_STANDARD,
        OP_CHECKMULTISIG => PREFIX_MULTISIG,
        OP_CROSSCHAIN => PREFIX_CROSS_CHAIN,
        other => return Err(ProgramHashError::UnknownOpcode(other)),
    };

    let sha = Sha256::digest(code);
    let rip = Ripemd160::digest(sha);
    let mut out = [0u8; PROGRAM_HASH_LEN];
    out[0] = prefix;
    out[1..].copy_from_slice(&rip);
    Ok(ProgramHash(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_hash_is_deterministic() {
        let code = [0x21, 0x02, 0x03, OP_CHECKSIG];
        let first = to_program_hash(&code).expect("hash");
        let second = to_program_hash(&code).expect("hash");
        assert_eq!(first, second);
        assert_eq!(first.prefix(), PREFIX_STANDARD);
    }

    #[test]
    fn prefix_follows_trailing_opcode() {
        let multisig = to_program_hash(&[0x52, OP_CHECKMULTISIG]).expect("hash");
        assert_eq!(multisig.prefix(), PREFIX_MULTISIG);
        let cross = to_program_hash(&[0x01, OP_CROSSCHAIN]).expect("hash");
        assert_eq!(cross.prefix(), PREFIX_CROSS_CHAIN);
    }

    #[test]
    fn empty_and_unknown_codes_are_rejected() {
        assert_eq!(to_program_hash(&[]), Err(ProgramHashError::EmptyCode));
        assert_eq!(
            to_program_hash(&[0x00]),
            Err(ProgramHashError::UnknownOpcode(0x00))
        );
    }
}
