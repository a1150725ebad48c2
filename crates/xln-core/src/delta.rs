//! Per-token credit-collateral state and the RCPAN invariant.
//!
//! Each bilateral account tracks one [`Delta`] per token. The stored net
//! balance (`ondelta + offdelta`) is oriented from the left side: a payment
//! by the left entity decreases it, a payment by the right entity increases
//! it. The RCPAN invariant `−Lₗ ≤ Δ ≤ C + Lᵣ` constrains the mirrored
//! left→right flow position `−net`, so the left side can move up to
//! collateral + right credit, and the right side up to left credit.
//!
//! Violations are rejected, never clamped: a mutation that would leave the
//! interval fails with [`XlnError::RcpanViolation`] and the state is
//! untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xln_crypto::{CodecError, RlpValue};

use crate::error::XlnError;
use crate::types::{Amount, TokenId};

// ── Delta ────────────────────────────────────────────────────────────────────

/// Credit-collateral state for one token inside one bilateral account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub token_id: TokenId,
    /// Collateral posted into the account (non-negative).
    pub collateral: Amount,
    /// Net balance component settled on-chain.
    pub ondelta: Amount,
    /// Net balance component accumulated off-chain.
    pub offdelta: Amount,
    /// Credit the left side extends to the right (non-negative).
    pub left_credit_limit: Amount,
    /// Credit the right side extends to the left (non-negative).
    pub right_credit_limit: Amount,
    pub left_allowance: Amount,
    pub right_allowance: Amount,
}

impl Delta {
    pub fn new(token_id: TokenId) -> Self {
        Self {
            token_id,
            collateral: 0,
            ondelta: 0,
            offdelta: 0,
            left_credit_limit: 0,
            right_credit_limit: 0,
            left_allowance: 0,
            right_allowance: 0,
        }
    }

    /// Net balance, left-oriented: negative means the left side has paid net.
    pub fn net(&self) -> Amount {
        self.ondelta + self.offdelta
    }

    /// Net value moved left→right; the quantity the invariant bounds.
    pub fn position(&self) -> Amount {
        -self.net()
    }

    /// Permitted interval for the flow position: `[−Lₗ, C + Lᵣ]`.
    pub fn bounds(&self) -> (Amount, Amount) {
        (
            -self.left_credit_limit,
            self.collateral + self.right_credit_limit,
        )
    }

    /// Would a new net balance keep the invariant?
    pub fn validate_net(&self, new_net: Amount) -> bool {
        let (lower, upper) = self.bounds();
        let position = -new_net;
        lower <= position && position <= upper
    }

    /// How much the given side can still send. Pending allowances (amounts
    /// reserved behind in-flight subcontracts) reduce the headroom.
    pub fn max_send(&self, is_left: bool) -> Amount {
        let (lower, upper) = self.bounds();
        let headroom = if is_left {
            upper - self.position() - self.left_allowance
        } else {
            self.position() - lower - self.right_allowance
        };
        headroom.max(0)
    }

    /// How much the given side can still receive.
    pub fn max_receive(&self, is_left: bool) -> Amount {
        self.max_send(!is_left)
    }

    /// Unused credit currently extended to the given side.
    pub fn available_credit(&self, is_left: bool) -> Amount {
        if is_left {
            let credit_used = (self.position() - self.collateral).max(0);
            self.right_credit_limit - credit_used
        } else {
            let credit_used = (-self.position()).max(0);
            self.left_credit_limit - credit_used
        }
    }

    /// Tokens with zero net and zero credit limits are dropped from frames.
    pub fn is_droppable(&self) -> bool {
        self.net() == 0 && self.left_credit_limit == 0 && self.right_credit_limit == 0
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.token_id.as_bytes().to_vec()),
            RlpValue::uint(self.collateral as u128),
            RlpValue::int(self.ondelta),
            RlpValue::int(self.offdelta),
            RlpValue::uint(self.left_credit_limit as u128),
            RlpValue::uint(self.right_credit_limit as u128),
            RlpValue::uint(self.left_allowance as u128),
            RlpValue::uint(self.right_allowance as u128),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(8)?;
        Ok(Self {
            token_id: TokenId::new(items[0].as_bytes()?.to_vec()),
            collateral: items[1].as_uint()? as Amount,
            ondelta: items[2].as_int()?,
            offdelta: items[3].as_int()?,
            left_credit_limit: items[4].as_uint()? as Amount,
            right_credit_limit: items[5].as_uint()? as Amount,
            left_allowance: items[6].as_uint()? as Amount,
            right_allowance: items[7].as_uint()? as Amount,
        })
    }
}

// ── TokenLedger ──────────────────────────────────────────────────────────────

/// The per-account map `tokenId → Delta`, with invariant enforcement at every
/// mutation point. Iteration order is the canonical token order (BTreeMap).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedger {
    deltas: BTreeMap<TokenId, Delta>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &TokenId) -> Option<&Delta> {
        self.deltas.get(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TokenId, &Delta)> {
        self.deltas.iter()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Insert a fully-formed delta, e.g. when decoding a snapshot.
    pub fn insert_delta(&mut self, delta: Delta) {
        self.deltas.insert(delta.token_id.clone(), delta);
    }

    /// Would `new_net` keep the invariant for `token`? Untracked tokens are
    /// unconstrained (permissionless fallback).
    pub fn validate(&self, token: &TokenId, new_net: Amount) -> bool {
        match self.deltas.get(token) {
            Some(d) => d.validate_net(new_net),
            None => true,
        }
    }

    /// Apply an off-chain change to `token`'s delta, enforcing the invariant.
    /// Returns the new net balance.
    pub fn update_delta(&mut self, token: &TokenId, change: Amount) -> Result<Amount, XlnError> {
        match self.deltas.get_mut(token) {
            Some(d) => {
                let current = d.net();
                let proposed = current
                    .checked_add(change)
                    .ok_or_else(|| XlnError::AmountOverflow {
                        token: token.clone(),
                    })?;
                if !d.validate_net(proposed) {
                    let (lower, upper) = d.bounds();
                    return Err(XlnError::RcpanViolation {
                        token: token.clone(),
                        current,
                        change,
                        proposed,
                        lower,
                        upper,
                    });
                }
                d.offdelta += change;
                Ok(d.net())
            }
            None => {
                // First touch of an untracked token: no limits, no constraint.
                let mut d = Delta::new(token.clone());
                d.offdelta = change;
                self.deltas.insert(token.clone(), d);
                Ok(change)
            }
        }
    }

    pub fn set_collateral(&mut self, token: &TokenId, amount: Amount) -> Result<(), XlnError> {
        if amount < 0 {
            return Err(XlnError::NegativeLimit(amount));
        }
        self.update_limits(token, |d| d.collateral = amount)
    }

    pub fn set_credit_left(&mut self, token: &TokenId, amount: Amount) -> Result<(), XlnError> {
        if amount < 0 {
            return Err(XlnError::NegativeLimit(amount));
        }
        self.update_limits(token, |d| d.left_credit_limit = amount)
    }

    pub fn set_credit_right(&mut self, token: &TokenId, amount: Amount) -> Result<(), XlnError> {
        if amount < 0 {
            return Err(XlnError::NegativeLimit(amount));
        }
        self.update_limits(token, |d| d.right_credit_limit = amount)
    }

    /// Apply an on-chain settlement effect: move value between the net
    /// balance and collateral. The result must still satisfy the invariant.
    pub fn apply_settlement(
        &mut self,
        token: &TokenId,
        ondelta_change: Amount,
        collateral_change: Amount,
    ) -> Result<(), XlnError> {
        let d = self
            .deltas
            .entry(token.clone())
            .or_insert_with(|| Delta::new(token.clone()));
        let new_collateral = d.collateral + collateral_change;
        if new_collateral < 0 {
            return Err(XlnError::NegativeLimit(new_collateral));
        }
        let mut candidate = d.clone();
        candidate.ondelta += ondelta_change;
        candidate.collateral = new_collateral;
        if !candidate.validate_net(candidate.net()) {
            let (lower, upper) = candidate.bounds();
            return Err(XlnError::RcpanViolation {
                token: token.clone(),
                current: d.net(),
                change: ondelta_change,
                proposed: candidate.net(),
                lower,
                upper,
            });
        }
        *d = candidate;
        Ok(())
    }

    pub fn max_send(&self, token: &TokenId, is_left: bool) -> Amount {
        self.deltas
            .get(token)
            .map(|d| d.max_send(is_left))
            .unwrap_or(0)
    }

    /// Reserve `amount` of the given side's headroom behind a subcontract.
    pub fn add_allowance(
        &mut self,
        token: &TokenId,
        is_left: bool,
        amount: Amount,
    ) -> Result<(), XlnError> {
        let d = self
            .deltas
            .get_mut(token)
            .ok_or_else(|| XlnError::CapacityExhausted {
                token: token.clone(),
            })?;
        if d.max_send(is_left) < amount {
            let (lower, upper) = d.bounds();
            return Err(XlnError::RcpanViolation {
                token: token.clone(),
                current: d.net(),
                change: if is_left { -amount } else { amount },
                proposed: if is_left {
                    d.net() - amount
                } else {
                    d.net() + amount
                },
                lower,
                upper,
            });
        }
        if is_left {
            d.left_allowance += amount;
        } else {
            d.right_allowance += amount;
        }
        Ok(())
    }

    /// Release a previously reserved allowance.
    pub fn release_allowance(&mut self, token: &TokenId, is_left: bool, amount: Amount) {
        if let Some(d) = self.deltas.get_mut(token) {
            if is_left {
                d.left_allowance = (d.left_allowance - amount).max(0);
            } else {
                d.right_allowance = (d.right_allowance - amount).max(0);
            }
        }
    }

    pub fn max_receive(&self, token: &TokenId, is_left: bool) -> Amount {
        self.deltas
            .get(token)
            .map(|d| d.max_receive(is_left))
            .unwrap_or(0)
    }

    /// Mutate limits, re-validating the existing net balance against them.
    fn update_limits(
        &mut self,
        token: &TokenId,
        apply: impl FnOnce(&mut Delta),
    ) -> Result<(), XlnError> {
        let d = self
            .deltas
            .entry(token.clone())
            .or_insert_with(|| Delta::new(token.clone()));
        let mut candidate = d.clone();
        apply(&mut candidate);
        if !candidate.validate_net(candidate.net()) {
            let (lower, upper) = candidate.bounds();
            return Err(XlnError::RcpanViolation {
                token: token.clone(),
                current: d.net(),
                change: 0,
                proposed: candidate.net(),
                lower,
                upper,
            });
        }
        *d = candidate;
        Ok(())
    }
}
