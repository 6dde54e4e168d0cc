//! Deterministic provider-contract derivation and payload builders.
//!
//! The contract address is a pure function of the bag identity and the
//! owner wallet, so it is known the moment packaging finishes and stays
//! stable across restarts. Payload builders are pure too: they assemble
//! what a wallet needs to deploy, top up, or withdraw; nothing here talks
//! to the network.

use num_bigint::BigUint;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::pricing::Offer;
use crate::records::BagSummary;

/// Versioned domain tag mixed into the address digest. Bumping it changes
/// every derived address, so it only moves with the contract code itself.
const ADDRESS_DOMAIN: &[u8] = b"bagvault.storage-contract.v1";

/// Derives the storage contract address for one bag held by one owner.
///
/// Covers every identity field of the bag, so two bags differing only in
/// piece size get distinct contracts. Rendered with the chain's `0:`
/// workchain prefix.
pub fn contract_address(bag: &BagSummary, owner: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ADDRESS_DOMAIN);
    hasher.update(bag.root_hash.as_bytes());
    hasher.update(&bag.merkle_hash);
    hasher.update(bag.full_size.to_be_bytes());
    hasher.update(bag.piece_size.to_be_bytes());
    hasher.update(owner.as_bytes());
    format!("0:{}", hex::encode(hasher.finalize()))
}

/// Everything a wallet needs to deploy and fund the storage contract.
#[derive(Debug, Clone, Serialize)]
pub struct DeployQuote {
    pub contract_address: String,
    /// Suggested initial funding in nano-coins: one proving interval plus
    /// the deployment fee margin.
    pub amount: String,
    /// Nano-coins per day for the full bag.
    pub per_day: String,
    /// Nano-coins paid out per accepted proof.
    pub per_proof: String,
    /// Proving interval in seconds.
    pub span: u32,
}

/// Fixed margin added on top of the first proof payout to cover the
/// deployment fees, in nano-coins.
const DEPLOY_FEE_MARGIN: u64 = 50_000_000;

pub fn deploy_quote(address: String, offer: &Offer) -> DeployQuote {
    let amount = &offer.per_proof + BigUint::from(DEPLOY_FEE_MARGIN);
    DeployQuote {
        contract_address: address,
        amount: amount.to_string(),
        per_day: offer.per_day.to_string(),
        per_proof: offer.per_proof.to_string(),
        span: offer.span,
    }
}

/// Withdrawal instruction for a deployed contract: the owner wallet sends
/// this message to pull the remaining balance back.
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawRequest {
    pub contract_address: String,
    /// Opcode the contract dispatches on.
    pub message: &'static str,
    /// Nano-coins attached to carry the message fees.
    pub amount: String,
}

/// Fee attached to a withdraw message, in nano-coins.
const WITHDRAW_FEE: u64 = 100_000_000;

pub fn withdraw_request(address: String) -> WithdrawRequest {
    WithdrawRequest {
        contract_address: address,
        message: "withdraw",
        amount: BigUint::from(WITHDRAW_FEE).to_string(),
    }
}

/// Top-up target for a deployed contract: a plain transfer to the
/// contract address extends its storage runway.
#[derive(Debug, Clone, Serialize)]
pub struct TopupTarget {
    pub contract_address: String,
    /// Nano-coins needed to keep the bag stored one more day.
    pub per_day: String,
}

pub fn topup_target(address: String, per_day: &str) -> TopupTarget {
    TopupTarget {
        contract_address: address,
        per_day: per_day.to_string(),
    }
}
