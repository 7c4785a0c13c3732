//! Two-phase transaction validation.
//!
//! `check_transaction_sanity` needs no chain access; `check_transaction_context`
//! validates against committed state. Checks run in a fixed order and the
//! first failure wins, so the returned error kind is a pure function of the
//! transaction, the chain snapshot and the parameters.

use std::collections::{BTreeMap, HashMap, HashSet};

use meridian_consensus::constants::{
    CHECK_TX_OUT, FINAL_SEQUENCE, FOUNDATION_REWARD_DENOMINATOR, FOUNDATION_REWARD_NUMERATOR,
    MAX_TX_OUTPUTS, MIN_COINBASE_OUTPUTS,
};
use meridian_primitives::{
    to_program_hash, Fixed64, Hash256, Input, Output, Payload, Transaction, MAX_PRECISION,
    MIN_PRECISION, PREFIX_CROSS_CHAIN, SIDECHAIN_POW_SIGNED_LEN,
};
use meridian_primitives::encoding::Encoder;
use thiserror::Error;
use tracing::warn;

use crate::context::ValidationContext;
use crate::crypto;
use crate::programs;

/// One kind per check; surfaced to callers and echoed to peers in reject
/// messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RuleErrorKind {
    TransactionSize,
    InvalidInput,
    InvalidOutput,
    AssetPrecision,
    AttributeProgram,
    TransactionPayload,
    SidechainTxDuplicate,
    TransactionDuplicate,
    SideChainPowConsensus,
    DoubleSpend,
    UnknownReferedTx,
    UTXOLocked,
    TransactionBalance,
    TransactionSignature,
    IneffectiveCoinbase,
}

#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct RuleError {
    pub kind: RuleErrorKind,
    pub message: String,
}

impl RuleError {
    pub fn new(kind: RuleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Stateless checks over a single transaction, in fixed order.
pub fn check_transaction_sanity(
    version: u32,
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    check_transaction_size(tx, ctx).inspect_err(|err| warn!(%err))?;
    check_transaction_input(tx).inspect_err(|err| warn!(%err))?;
    check_transaction_output(version, tx, ctx).inspect_err(|err| warn!(%err))?;
    check_asset_precision(tx, ctx).inspect_err(|err| warn!(%err))?;
    check_attribute_program(tx).inspect_err(|err| warn!(%err))?;
    check_transaction_payload(tx).inspect_err(|err| warn!(%err))?;
    check_duplicate_sidechain_tx(tx).inspect_err(|err| warn!(%err))?;
    Ok(())
}

/// Checks against committed chain state, in fixed order. Coinbase
/// transactions only face the duplicate-hash check.
pub fn check_transaction_context(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    let hash = tx.hash();
    if ctx.is_tx_hash_duplicate(&hash) {
        warn!("transaction already in ledger");
        return Err(RuleError::new(
            RuleErrorKind::TransactionDuplicate,
            "duplicate transaction",
        ));
    }

    if tx.is_coinbase() {
        return Ok(());
    }

    if tx.is_sidechain_pow() {
        check_sidechain_pow_consensus(tx, ctx).inspect_err(|err| warn!(%err))?;
    }

    if tx.is_withdraw_from_sidechain() {
        check_withdraw_from_sidechain(tx, ctx).inspect_err(|err| warn!(%err))?;
    }

    if tx.is_transfer_cross_chain_asset() {
        check_transfer_cross_chain_asset(tx, ctx).inspect_err(|err| warn!(%err))?;
    }

    if ctx.is_double_spend(tx) {
        warn!("double spend check failed");
        return Err(RuleError::new(
            RuleErrorKind::DoubleSpend,
            "inputs already spent",
        ));
    }

    let references = ctx.get_tx_reference(tx).map_err(|err| {
        warn!(%err, "transaction reference lookup failed");
        RuleError::new(RuleErrorKind::UnknownReferedTx, "unknown referenced output")
    })?;

    check_transaction_utxo_lock(tx, &references).inspect_err(|err| warn!(%err))?;
    check_transaction_fee(tx, ctx, &references).inspect_err(|err| warn!(%err))?;
    check_destruction_address(ctx, &references).inspect_err(|err| warn!(%err))?;
    check_transaction_signature(tx, &references).inspect_err(|err| warn!(%err))?;
    check_coinbase_output_lock(tx, ctx).inspect_err(|err| warn!(%err))?;
    Ok(())
}

fn check_transaction_size(tx: &Transaction, ctx: &ValidationContext<'_>) -> Result<(), RuleError> {
    let size = tx.size();
    if size == 0 || size > ctx.params.max_block_size {
        return Err(RuleError::new(
            RuleErrorKind::TransactionSize,
            format!("invalid transaction size: {size} bytes"),
        ));
    }
    Ok(())
}

fn check_transaction_input(tx: &Transaction) -> Result<(), RuleError> {
    if tx.is_coinbase() {
        if tx.inputs.len() != 1 {
            return Err(RuleError::new(
                RuleErrorKind::InvalidInput,
                "coinbase must have exactly one input",
            ));
        }
        if !tx.inputs[0].previous.is_coinbase_sentinel() {
            return Err(RuleError::new(
                RuleErrorKind::InvalidInput,
                "invalid coinbase input",
            ));
        }
        return Ok(());
    }

    if tx.inputs.is_empty() {
        return Err(RuleError::new(
            RuleErrorKind::InvalidInput,
            "transaction has no inputs",
        ));
    }
    let mut seen: HashSet<[u8; 34]> = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if input.previous.is_coinbase_sentinel() {
            return Err(RuleError::new(
                RuleErrorKind::InvalidInput,
                "non-coinbase input carries the coinbase sentinel",
            ));
        }
        if !seen.insert(input.previous.refer_key()) {
            return Err(RuleError::new(
                RuleErrorKind::InvalidInput,
                "duplicated transaction inputs",
            ));
        }
    }
    Ok(())
}

fn check_transaction_output(
    version: u32,
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    if tx.outputs.len() > MAX_TX_OUTPUTS {
        return Err(RuleError::new(
            RuleErrorKind::InvalidOutput,
            "output count above 65535",
        ));
    }

    if tx.is_coinbase() {
        if tx.outputs.len() < MIN_COINBASE_OUTPUTS {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "coinbase needs at least two outputs",
            ));
        }
        let mut total: i128 = 0;
        let mut foundation: i128 = 0;
        for output in &tx.outputs {
            if output.asset_id != ctx.params.asset_id {
                return Err(RuleError::new(
                    RuleErrorKind::InvalidOutput,
                    "asset id in coinbase is invalid",
                ));
            }
            total += i128::from(output.value.raw());
            if output.program_hash == ctx.params.foundation_address {
                foundation += i128::from(output.value.raw());
            }
        }
        // Integer form of the 30% floor comparison.
        if foundation * i128::from(FOUNDATION_REWARD_DENOMINATOR)
            < total * i128::from(FOUNDATION_REWARD_NUMERATOR)
        {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "foundation reward in coinbase below 30%",
            ));
        }
        return Ok(());
    }

    if tx.outputs.is_empty() {
        return Err(RuleError::new(
            RuleErrorKind::InvalidOutput,
            "transaction has no outputs",
        ));
    }
    for output in &tx.outputs {
        if output.asset_id != ctx.params.asset_id {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "asset id in output is invalid",
            ));
        }
        if output.value.is_negative() {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "negative output value",
            ));
        }
        if version & CHECK_TX_OUT == CHECK_TX_OUT
            && !output.program_hash.is_valid_output_destination()
        {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "output address is invalid",
            ));
        }
    }
    Ok(())
}

fn check_asset_precision(tx: &Transaction, ctx: &ValidationContext<'_>) -> Result<(), RuleError> {
    if tx.outputs.is_empty() {
        return Ok(());
    }
    let mut by_asset: HashMap<Hash256, Vec<&Output>> = HashMap::new();
    for output in &tx.outputs {
        by_asset.entry(output.asset_id).or_default().push(output);
    }
    for (asset_id, outputs) in by_asset {
        let asset = ctx.get_asset(&asset_id).map_err(|_| {
            RuleError::new(
                RuleErrorKind::AssetPrecision,
                "asset not registered on this chain",
            )
        })?;
        for output in outputs {
            if !check_amount_precise(output.value, asset.precision) {
                return Err(RuleError::new(
                    RuleErrorKind::AssetPrecision,
                    "output value breaks asset precision",
                ));
            }
        }
    }
    Ok(())
}

fn check_attribute_program(tx: &Transaction) -> Result<(), RuleError> {
    // Coinbase transactions carry no attribute or program constraints.
    if tx.is_coinbase() {
        return Ok(());
    }

    if tx.programs.is_empty() {
        return Err(RuleError::new(
            RuleErrorKind::AttributeProgram,
            "no programs found in transaction",
        ));
    }
    for program in &tx.programs {
        if program.code.is_empty() {
            return Err(RuleError::new(
                RuleErrorKind::AttributeProgram,
                "empty program code",
            ));
        }
        if program.parameter.is_empty() {
            return Err(RuleError::new(
                RuleErrorKind::AttributeProgram,
                "empty program parameter",
            ));
        }
        if to_program_hash(&program.code).is_err() {
            return Err(RuleError::new(
                RuleErrorKind::AttributeProgram,
                "program code is not a valid redeem script",
            ));
        }
    }
    Ok(())
}

fn check_transaction_payload(tx: &Transaction) -> Result<(), RuleError> {
    if let Payload::RegisterAsset { asset, amount, .. } = &tx.payload {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&asset.precision) {
            return Err(RuleError::new(
                RuleErrorKind::TransactionPayload,
                "invalid asset precision",
            ));
        }
        if !check_amount_precise(*amount, asset.precision) {
            return Err(RuleError::new(
                RuleErrorKind::TransactionPayload,
                "asset amount out of precision",
            ));
        }
    }
    Ok(())
}

fn check_duplicate_sidechain_tx(tx: &Transaction) -> Result<(), RuleError> {
    if let Payload::WithdrawFromSideChain {
        side_chain_transaction_hashes,
        ..
    } = &tx.payload
    {
        let mut seen: HashSet<Hash256> = HashSet::with_capacity(side_chain_transaction_hashes.len());
        for hash in side_chain_transaction_hashes {
            if !seen.insert(*hash) {
                return Err(RuleError::new(
                    RuleErrorKind::SidechainTxDuplicate,
                    "duplicate sidechain tx inside one transaction",
                ));
            }
        }
    }
    Ok(())
}

fn check_sidechain_pow_consensus(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    let Payload::SideChainPow { signed_data, .. } = &tx.payload else {
        return Err(RuleError::new(
            RuleErrorKind::SideChainPowConsensus,
            "side mining transaction has invalid payload",
        ));
    };

    let height = ctx.get_height();
    let arbitrator = ctx.params.current_arbitrator(height).ok_or_else(|| {
        RuleError::new(
            RuleErrorKind::SideChainPowConsensus,
            "no arbitrator for current height",
        )
    })?;
    let pubkey = crypto::decode_point(arbitrator).map_err(|_| {
        RuleError::new(
            RuleErrorKind::SideChainPowConsensus,
            "arbitrator key is not a valid point",
        )
    })?;

    let mut encoder = Encoder::new();
    tx.payload.encode(&mut encoder);
    let payload_bytes = encoder.into_inner();
    if payload_bytes.len() < SIDECHAIN_POW_SIGNED_LEN {
        return Err(RuleError::new(
            RuleErrorKind::SideChainPowConsensus,
            "sidechain pow payload too short",
        ));
    }

    crypto::verify(
        &pubkey,
        &payload_bytes[..SIDECHAIN_POW_SIGNED_LEN],
        signed_data,
    )
    .map_err(|_| {
        RuleError::new(
            RuleErrorKind::SideChainPowConsensus,
            "arbitrator is not matched",
        )
    })
}

fn check_withdraw_from_sidechain(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    let Payload::WithdrawFromSideChain {
        side_chain_transaction_hashes,
        ..
    } = &tx.payload
    else {
        return Err(RuleError::new(
            RuleErrorKind::SidechainTxDuplicate,
            "invalid withdraw payload",
        ));
    };

    for hash in side_chain_transaction_hashes {
        if ctx.is_sidechain_tx_hash_duplicate(hash) {
            return Err(RuleError::new(
                RuleErrorKind::SidechainTxDuplicate,
                "sidechain tx hash already recorded",
            ));
        }
    }

    let references = ctx.get_tx_reference(tx).map_err(|_| {
        RuleError::new(RuleErrorKind::SidechainTxDuplicate, "invalid transaction inputs")
    })?;
    for output in references.values() {
        if output.program_hash.prefix() != PREFIX_CROSS_CHAIN {
            return Err(RuleError::new(
                RuleErrorKind::SidechainTxDuplicate,
                "withdraw input is not a cross-chain address",
            ));
        }
    }
    Ok(())
}

fn check_transfer_cross_chain_asset(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    let Payload::TransferCrossChainAsset {
        cross_chain_addresses,
        cross_chain_amounts,
        output_indexes,
    } = &tx.payload
    else {
        return Err(RuleError::new(
            RuleErrorKind::InvalidOutput,
            "invalid cross-chain transfer payload",
        ));
    };

    if cross_chain_addresses.is_empty()
        || cross_chain_addresses.len() > tx.outputs.len()
        || cross_chain_addresses.len() != cross_chain_amounts.len()
        || cross_chain_amounts.len() != output_indexes.len()
    {
        return Err(RuleError::new(
            RuleErrorKind::InvalidOutput,
            "invalid cross-chain payload shape",
        ));
    }

    let mut seen_indexes: HashSet<u64> = HashSet::with_capacity(output_indexes.len());
    for index in output_indexes {
        if !seen_indexes.insert(*index) || *index as usize >= tx.outputs.len() {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "invalid cross-chain output index",
            ));
        }
    }

    for (address, index) in cross_chain_addresses.iter().zip(output_indexes) {
        if tx.outputs[*index as usize].program_hash.prefix() != PREFIX_CROSS_CHAIN {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "cross-chain output lacks the cross-chain prefix",
            ));
        }
        if address.is_empty() {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "empty cross-chain address",
            ));
        }
    }

    let fee = i128::from(ctx.params.min_cross_chain_tx_fee.raw());
    for (amount, index) in cross_chain_amounts.iter().zip(output_indexes) {
        let ceiling = i128::from(tx.outputs[*index as usize].value.raw()) - fee;
        let amount = i128::from(amount.raw());
        if amount < 0 || amount > ceiling {
            return Err(RuleError::new(
                RuleErrorKind::InvalidOutput,
                "invalid cross-chain amount",
            ));
        }
    }

    let references = ctx.get_tx_reference(tx).map_err(|_| {
        RuleError::new(RuleErrorKind::InvalidOutput, "invalid transaction inputs")
    })?;
    let total_input: i128 = references
        .values()
        .map(|output| i128::from(output.value.raw()))
        .sum();
    let total_output: i128 = tx
        .outputs
        .iter()
        .map(|output| i128::from(output.value.raw()))
        .sum();
    if total_input - total_output < fee {
        return Err(RuleError::new(
            RuleErrorKind::InvalidOutput,
            "cross-chain fee too low",
        ));
    }
    Ok(())
}

fn check_transaction_utxo_lock(
    tx: &Transaction,
    references: &BTreeMap<Input, Output>,
) -> Result<(), RuleError> {
    if tx.is_coinbase() {
        return Ok(());
    }
    for (input, output) in references {
        if output.output_lock == 0 {
            continue;
        }
        if input.sequence != FINAL_SEQUENCE {
            return Err(RuleError::new(
                RuleErrorKind::UTXOLocked,
                "invalid input sequence for locked output",
            ));
        }
        if tx.lock_time < output.output_lock {
            return Err(RuleError::new(
                RuleErrorKind::UTXOLocked,
                "referenced output is still locked",
            ));
        }
    }
    Ok(())
}

fn check_transaction_fee(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
    references: &BTreeMap<Input, Output>,
) -> Result<(), RuleError> {
    let input_value: i128 = references
        .values()
        .map(|output| i128::from(output.value.raw()))
        .sum();
    let output_value: i128 = tx
        .outputs
        .iter()
        .map(|output| i128::from(output.value.raw()))
        .sum();
    if input_value < output_value + i128::from(ctx.params.min_tx_fee.raw()) {
        return Err(RuleError::new(
            RuleErrorKind::TransactionBalance,
            "transaction fee not enough",
        ));
    }
    Ok(())
}

fn check_destruction_address(
    ctx: &ValidationContext<'_>,
    references: &BTreeMap<Input, Output>,
) -> Result<(), RuleError> {
    // Burned outputs stay burned even if someone holds a key that signs for
    // the destruction address.
    for output in references.values() {
        if output.program_hash == ctx.params.destruction_address {
            return Err(RuleError::new(
                RuleErrorKind::InvalidInput,
                "cannot spend from the destruction address",
            ));
        }
    }
    Ok(())
}

fn check_transaction_signature(
    tx: &Transaction,
    references: &BTreeMap<Input, Output>,
) -> Result<(), RuleError> {
    let signature_error =
        |message: String| RuleError::new(RuleErrorKind::TransactionSignature, message);

    let mut hashes = programs::get_tx_program_hashes(tx, references)
        .map_err(|err| signature_error(err.to_string()))?;
    programs::sort_program_hashes(&mut hashes);

    let mut sorted_programs = tx.programs.clone();
    programs::sort_programs(&mut sorted_programs)
        .map_err(|err| signature_error(err.to_string()))?;

    programs::run_programs(&tx.serialize_unsigned(), &hashes, &sorted_programs)
        .map_err(|err| signature_error(err.to_string()))
}

fn check_coinbase_output_lock(
    tx: &Transaction,
    ctx: &ValidationContext<'_>,
) -> Result<(), RuleError> {
    for input in &tx.inputs {
        let (refer_tx, _) = ctx.get_transaction(&input.previous.tx_id).map_err(|_| {
            RuleError::new(RuleErrorKind::UnknownReferedTx, "unknown referenced output")
        })?;
        if refer_tx.is_coinbase() {
            let lock_height = refer_tx.lock_time;
            let current_height = ctx.get_height();
            if current_height.saturating_sub(lock_height) < ctx.params.coinbase_lock_time {
                return Err(RuleError::new(
                    RuleErrorKind::IneffectiveCoinbase,
                    "cannot unlock coinbase transaction output",
                ));
            }
        }
    }
    Ok(())
}

fn check_amount_precise(amount: Fixed64, precision: u8) -> bool {
    if precision >= 8 {
        return true;
    }
    let divisor = 10i64.pow(u32::from(8 - precision));
    amount.raw() % divisor == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_precision_boundaries() {
        assert!(check_amount_precise(Fixed64::new(100_000_000), 0));
        assert!(!check_amount_precise(Fixed64::new(100_000_001), 0));
        assert!(check_amount_precise(Fixed64::new(123), 8));
        assert!(check_amount_precise(Fixed64::new(10), 7));
        assert!(!check_amount_precise(Fixed64::new(1), 7));
    }
}
