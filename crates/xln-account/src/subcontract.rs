//! Subcontracts: conditional effects embedded in account frames.
//!
//! A subcontract is a [`DeltaTransformer`]: once its condition holds it
//! contributes delta changes that are applied atomically with the frame, and
//! every contributed change passes the same credit-collateral checks as a
//! plain payment. The one built-in variant is the hash time-locked contract.

use serde::{Deserialize, Serialize};
use xln_crypto::{sha256, CodecError, RlpValue};

use xln_core::frame::{opt_from_rlp, opt_to_rlp};
use xln_core::{Amount, EntityId, Timestamp, TokenId, XlnError};

use crate::machine::AccountState;

// ── DeltaTransformer ─────────────────────────────────────────────────────────

/// One delta mutation produced by a subcontract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaChange {
    pub token_id: TokenId,
    pub change: Amount,
}

/// A conditional transformation of account deltas.
///
/// During frame application, subcontracts are evaluated in id order; each one
/// whose condition holds contributes its changes exactly once.
pub trait DeltaTransformer {
    fn id(&self) -> &[u8];

    /// Does this subcontract fire against the given account state?
    fn condition(&self, state: &AccountState) -> bool;

    /// The delta changes to apply when the condition holds.
    fn apply(&self, state: &AccountState) -> Vec<DeltaChange>;
}

// ── HTLC ─────────────────────────────────────────────────────────────────────

/// A hash time-locked contract between the two sides of an account.
///
/// Lifecycle: `locked → claimed` (receiver reveals the preimage before the
/// timeout) or `locked → refunded` (sender reclaims at or after the timeout).
/// Timeouts are evaluated against frame timestamps, never a wall clock. Once
/// revealed, the preimage is part of the consensus record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    pub id: Vec<u8>,
    pub token_id: TokenId,
    pub amount: u128,
    pub hash_lock: [u8; 32],
    pub timeout: Timestamp,
    pub sender: EntityId,
    pub receiver: EntityId,
    pub revealed_preimage: Option<Vec<u8>>,
    pub claimed: bool,
    pub refunded: bool,
    /// Set once the transformer pass has applied this contract's outcome.
    pub settled: bool,
    /// Onward hop for multi-hop payments (ids only, no bindings).
    pub next_hop: Option<EntityId>,
}

impl Htlc {
    /// Receiver presents the preimage. Rejected after the timeout, on a hash
    /// mismatch, or if the contract already resolved.
    pub fn claim(&mut self, preimage: &[u8], frame_ts: Timestamp) -> Result<(), XlnError> {
        if self.claimed {
            return Err(XlnError::AlreadyClaimed);
        }
        if self.refunded {
            return Err(XlnError::AlreadyRefunded);
        }
        if frame_ts >= self.timeout {
            return Err(XlnError::ClaimAfterTimeout {
                timeout: self.timeout,
                now: frame_ts,
            });
        }
        if sha256(preimage) != self.hash_lock {
            return Err(XlnError::WrongPreimage);
        }
        self.claimed = true;
        self.revealed_preimage = Some(preimage.to_vec());
        Ok(())
    }

    /// Sender reclaims at or after the timeout.
    pub fn refund(&mut self, frame_ts: Timestamp) -> Result<(), XlnError> {
        if self.claimed {
            return Err(XlnError::AlreadyClaimed);
        }
        if self.refunded {
            return Err(XlnError::AlreadyRefunded);
        }
        if frame_ts < self.timeout {
            return Err(XlnError::RefundBeforeTimeout {
                timeout: self.timeout,
                now: frame_ts,
            });
        }
        self.refunded = true;
        Ok(())
    }

    /// Allowance reserved on the sender's side while the lock is open.
    pub fn sender_is_left(&self, left: &EntityId) -> bool {
        self.sender == *left
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.id.clone()),
            RlpValue::bytes(self.token_id.as_bytes().to_vec()),
            RlpValue::uint(self.amount),
            RlpValue::bytes(self.hash_lock.to_vec()),
            RlpValue::int(self.timeout as i128),
            RlpValue::bytes(self.sender.as_bytes().to_vec()),
            RlpValue::bytes(self.receiver.as_bytes().to_vec()),
            opt_to_rlp(self.revealed_preimage.as_ref(), |p| {
                RlpValue::bytes(p.clone())
            }),
            RlpValue::uint(self.claimed as u128),
            RlpValue::uint(self.refunded as u128),
            RlpValue::uint(self.settled as u128),
            opt_to_rlp(self.next_hop.as_ref(), |e| {
                RlpValue::bytes(e.as_bytes().to_vec())
            }),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(12)?;
        let hash_bytes = items[3].as_bytes()?;
        if hash_bytes.len() != 32 {
            return Err(CodecError::ExpectedBytes);
        }
        let mut hash_lock = [0u8; 32];
        hash_lock.copy_from_slice(hash_bytes);
        Ok(Self {
            id: items[0].as_bytes()?.to_vec(),
            token_id: TokenId::new(items[1].as_bytes()?.to_vec()),
            amount: items[2].as_uint()?,
            hash_lock,
            timeout: items[4].as_int()? as Timestamp,
            sender: EntityId::new(items[5].as_bytes()?.to_vec()),
            receiver: EntityId::new(items[6].as_bytes()?.to_vec()),
            revealed_preimage: opt_from_rlp(&items[7], |v| Ok(v.as_bytes()?.to_vec()))?,
            claimed: items[8].as_uint()? != 0,
            refunded: items[9].as_uint()? != 0,
            settled: items[10].as_uint()? != 0,
            next_hop: opt_from_rlp(&items[11], |v| Ok(EntityId::new(v.as_bytes()?.to_vec())))?,
        })
    }
}

impl DeltaTransformer for Htlc {
    fn id(&self) -> &[u8] {
        &self.id
    }

    fn condition(&self, _state: &AccountState) -> bool {
        (self.claimed || self.refunded) && !self.settled
    }

    fn apply(&self, state: &AccountState) -> Vec<DeltaChange> {
        if !self.claimed {
            // A refund releases the allowance; the net balance never moved.
            return Vec::new();
        }
        let change = if self.sender_is_left(&state.left) {
            -(self.amount as Amount)
        } else {
            self.amount as Amount
        };
        vec![DeltaChange {
            token_id: self.token_id.clone(),
            change,
        }]
    }
}
