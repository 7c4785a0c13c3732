//! Program collection and execution for transaction signature checks.
//!
//! Programs and the data hashes they must satisfy are sorted into the same
//! canonical byte order before execution, so a transaction's programs may
//! arrive in any order.

use std::collections::{BTreeMap, BTreeSet};

use meridian_primitives::program_hash::{PREFIX_CROSS_CHAIN, PREFIX_MULTISIG, PREFIX_STANDARD};
use meridian_primitives::{
    to_program_hash, Input, Output, Payload, Program, ProgramHash, Transaction,
};
use thiserror::Error;

use crate::crypto::{self, CryptoError, SIGNATURE_LEN};

const PUBKEY_LEN: usize = 33;
const PUSH_PUBKEY: u8 = 0x21;
const OP_1: u8 = 0x51;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProgramError {
    #[error("transaction implies no program hashes")]
    NoHashes,
    #[error("program count {programs} does not match hash count {hashes}")]
    CountMismatch { hashes: usize, programs: usize },
    #[error("program code does not hash to the expected program hash")]
    HashMismatch,
    #[error("malformed program code: {0}")]
    InvalidCode(&'static str),
    #[error("malformed program parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("unknown program hash prefix {0:#04x}")]
    UnknownPrefix(u8),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Collects the distinct program hashes a transaction must be signed for:
/// the owner of every referenced output, plus the controller of a newly
/// registered asset.
pub fn get_tx_program_hashes(
    tx: &Transaction,
    references: &BTreeMap<Input, Output>,
) -> Result<Vec<ProgramHash>, ProgramError> {
    let mut hashes: BTreeSet<ProgramHash> = BTreeSet::new();
    for output in references.values() {
        hashes.insert(output.program_hash);
    }
    if let Payload::RegisterAsset { controller, .. } = &tx.payload {
        if !controller.is_null() {
            hashes.insert(*controller);
        }
    }
    if hashes.is_empty() {
        return Err(ProgramError::NoHashes);
    }
    Ok(hashes.into_iter().collect())
}

pub fn sort_program_hashes(hashes: &mut [ProgramHash]) {
    hashes.sort();
}

/// Sorts programs by the program hash of their code. Fails when any code is
/// not a valid redeem script.
pub fn sort_programs(programs: &mut Vec<Program>) -> Result<(), ProgramError> {
    let mut keyed = Vec::with_capacity(programs.len());
    for program in programs.drain(..) {
        let key = to_program_hash(&program.code)
            .map_err(|_| ProgramError::InvalidCode("unhashable program code"))?;
        keyed.push((key, program));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    *programs = keyed.into_iter().map(|(_, program)| program).collect();
    Ok(())
}

/// Executes every program against the unsigned transaction image. Hashes and
/// programs must already be sorted into canonical order.
pub fn run_programs(
    data: &[u8],
    hashes: &[ProgramHash],
    programs: &[Program],
) -> Result<(), ProgramError> {
    if hashes.len() != programs.len() {
        return Err(ProgramError::CountMismatch {
            hashes: hashes.len(),
            programs: programs.len(),
        });
    }

    for (hash, program) in hashes.iter().zip(programs) {
        let code_hash = to_program_hash(&program.code)
            .map_err(|_| ProgramError::InvalidCode("unhashable program code"))?;
        if code_hash != *hash {
            return Err(ProgramError::HashMismatch);
        }

        match hash.prefix() {
            PREFIX_STANDARD => check_standard_signature(data, program)?,
            PREFIX_MULTISIG | PREFIX_CROSS_CHAIN => check_multisig_signatures(data, program)?,
            other => return Err(ProgramError::UnknownPrefix(other)),
        }
    }

    Ok(())
}

fn check_standard_signature(data: &[u8], program: &Program) -> Result<(), ProgramError> {
    if program.code.len() != PUBKEY_LEN + 2 || program.code[0] != PUSH_PUBKEY {
        return Err(ProgramError::InvalidCode("standard code layout"));
    }
    let pubkey = crypto::decode_point(&program.code[1..1 + PUBKEY_LEN])?;
    if program.parameter.len() != SIGNATURE_LEN {
        return Err(ProgramError::InvalidParameter("standard signature length"));
    }
    crypto::verify(&pubkey, data, &program.parameter)?;
    Ok(())
}

fn check_multisig_signatures(data: &[u8], program: &Program) -> Result<(), ProgramError> {
    let (threshold, pubkeys) = parse_multisig_code(&program.code)?;

    if program.parameter.is_empty() || program.parameter.len() % SIGNATURE_LEN != 0 {
        return Err(ProgramError::InvalidParameter("multisig signature block"));
    }
    let signature_count = program.parameter.len() / SIGNATURE_LEN;
    if signature_count < threshold || signature_count > pubkeys.len() {
        return Err(ProgramError::InvalidParameter("multisig signature count"));
    }

    // Every provided signature must match a distinct key.
    let mut used = vec![false; pubkeys.len()];
    for chunk in program.parameter.chunks(SIGNATURE_LEN) {
        let mut matched = false;
        for (index, pubkey) in pubkeys.iter().enumerate() {
            if used[index] {
                continue;
            }
            if crypto::verify(pubkey, data, chunk).is_ok() {
                used[index] = true;
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(ProgramError::Crypto(CryptoError::VerifyFailed));
        }
    }

    Ok(())
}

fn parse_multisig_code(
    code: &[u8],
) -> Result<(usize, Vec<secp256k1::PublicKey>), ProgramError> {
    if code.len() < 3 {
        return Err(ProgramError::InvalidCode("multisig code too short"));
    }
    let threshold_op = code[0];
    if !(OP_1..=OP_1 + 15).contains(&threshold_op) {
        return Err(ProgramError::InvalidCode("multisig threshold opcode"));
    }
    let threshold = (threshold_op - OP_1 + 1) as usize;

    let body = &code[1..code.len() - 2];
    if body.len() % (PUBKEY_LEN + 1) != 0 {
        return Err(ProgramError::InvalidCode("multisig key block"));
    }
    let mut pubkeys = Vec::with_capacity(body.len() / (PUBKEY_LEN + 1));
    for entry in body.chunks(PUBKEY_LEN + 1) {
        if entry[0] != PUSH_PUBKEY {
            return Err(ProgramError::InvalidCode("multisig key push"));
        }
        pubkeys.push(crypto::decode_point(&entry[1..])?);
    }

    let count_op = code[code.len() - 2];
    if !(OP_1..=OP_1 + 15).contains(&count_op) {
        return Err(ProgramError::InvalidCode("multisig key count opcode"));
    }
    if (count_op - OP_1 + 1) as usize != pubkeys.len() {
        return Err(ProgramError::InvalidCode("multisig key count"));
    }
    if threshold > pubkeys.len() {
        return Err(ProgramError::InvalidCode("multisig threshold above count"));
    }

    Ok((threshold, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::program_hash::{OP_CHECKMULTISIG, OP_CHECKSIG};
    use meridian_primitives::sha256;
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn test_key(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
        (secret, PublicKey::from_secret_key(&secp, &secret))
    }

    fn sign(secret: &SecretKey, data: &[u8]) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest_slice(&sha256(data)).expect("digest");
        secp.sign_ecdsa(&msg, secret).serialize_compact().to_vec()
    }

    fn standard_code(pubkey: &PublicKey) -> Vec<u8> {
        let mut code = vec![PUSH_PUBKEY];
        code.extend_from_slice(&pubkey.serialize());
        code.push(OP_CHECKSIG);
        code
    }

    fn multisig_code(threshold: usize, pubkeys: &[PublicKey]) -> Vec<u8> {
        let mut code = vec![OP_1 + threshold as u8 - 1];
        for pubkey in pubkeys {
            code.push(PUSH_PUBKEY);
            code.extend_from_slice(&pubkey.serialize());
        }
        code.push(OP_1 + pubkeys.len() as u8 - 1);
        code.push(OP_CHECKMULTISIG);
        code
    }

    #[test]
    fn standard_program_verifies() {
        let (secret, public) = test_key(0x21);
        let data = b"unsigned transaction image".to_vec();
        let code = standard_code(&public);
        let hash = to_program_hash(&code).expect("hash");
        let program = Program {
            code,
            parameter: sign(&secret, &data),
        };
        run_programs(&data, &[hash], &[program]).expect("valid signature");
    }

    #[test]
    fn standard_program_rejects_other_signer() {
        let (_, public) = test_key(0x21);
        let (other_secret, _) = test_key(0x22);
        let data = b"unsigned transaction image".to_vec();
        let code = standard_code(&public);
        let hash = to_program_hash(&code).expect("hash");
        let program = Program {
            code,
            parameter: sign(&other_secret, &data),
        };
        assert_eq!(
            run_programs(&data, &[hash], &[program]),
            Err(ProgramError::Crypto(CryptoError::VerifyFailed))
        );
    }

    #[test]
    fn multisig_threshold_is_enforced() {
        let (secret_a, public_a) = test_key(0x31);
        let (secret_b, public_b) = test_key(0x32);
        let (_, public_c) = test_key(0x33);
        let data = b"multisig image".to_vec();
        let code = multisig_code(2, &[public_a, public_b, public_c]);
        let hash = to_program_hash(&code).expect("hash");

        let mut parameter = sign(&secret_a, &data);
        parameter.extend(sign(&secret_b, &data));
        let program = Program {
            code: code.clone(),
            parameter,
        };
        run_programs(&data, &[hash], &[program]).expect("two of three");

        let one_sig = Program {
            code,
            parameter: sign(&secret_a, &data),
        };
        assert_eq!(
            run_programs(&data, &[hash], &[one_sig]),
            Err(ProgramError::InvalidParameter("multisig signature count"))
        );
    }

    #[test]
    fn duplicate_signatures_do_not_reach_threshold() {
        let (secret_a, public_a) = test_key(0x41);
        let (_, public_b) = test_key(0x42);
        let data = b"dup image".to_vec();
        let code = multisig_code(2, &[public_a, public_b]);
        let hash = to_program_hash(&code).expect("hash");

        let mut parameter = sign(&secret_a, &data);
        parameter.extend(sign(&secret_a, &data));
        let program = Program { code, parameter };
        assert_eq!(
            run_programs(&data, &[hash], &[program]),
            Err(ProgramError::Crypto(CryptoError::VerifyFailed))
        );
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let (_, public) = test_key(0x51);
        let code = standard_code(&public);
        let hash = to_program_hash(&code).expect("hash");
        assert_eq!(
            run_programs(b"data", &[hash], &[]),
            Err(ProgramError::CountMismatch {
                hashes: 1,
                programs: 0
            })
        );
    }

    #[test]
    fn sorted_programs_follow_hash_order() {
        let (_, public_a) = test_key(0x61);
        let (_, public_b) = test_key(0x62);
        let mut programs = vec![
            Program {
                code: standard_code(&public_a),
                parameter: vec![0u8; SIGNATURE_LEN],
            },
            Program {
                code: standard_code(&public_b),
                parameter: vec![0u8; SIGNATURE_LEN],
            },
        ];
        sort_programs(&mut programs).expect("sortable");
        let first = to_program_hash(&programs[0].code).expect("hash");
        let second = to_program_hash(&programs[1].code).expect("hash");
        assert!(first <= second);
    }
}
