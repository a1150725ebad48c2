//! Transaction kinds at both consensus layers.
//!
//! Both enums are closed sets dispatched by exhaustive match; adding a
//! variant is a protocol change. Canonical wire forms tag each variant with a
//! leading discriminant byte.

use serde::{Deserialize, Serialize};
use xln_crypto::{CodecError, RlpValue};

use crate::frame::{opt_from_rlp, opt_to_rlp, AccountInput};
use crate::types::{EntityId, SignerId, Timestamp, TokenId};

// ── AccountTx ────────────────────────────────────────────────────────────────

/// One state-changing operation inside a bilateral account frame.
///
/// Direction is implicit: every transaction acts on behalf of the side that
/// proposed the frame carrying it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTx {
    /// Pay `amount` of `token_id` to the counterparty.
    Payment { token_id: TokenId, amount: u128 },

    /// Post (or adjust) the account's collateral for a token.
    SetCollateral { token_id: TokenId, amount: u128 },

    /// Set the credit limit the proposing side extends to the counterparty.
    SetCreditLimit { token_id: TokenId, amount: u128 },

    /// Lock `amount` behind `hash_lock` until `timeout`. The counterparty
    /// claims with the preimage; the sender refunds at or after `timeout`.
    /// `next_hop` carries onward routing metadata for multi-hop payments.
    HtlcLock {
        id: Vec<u8>,
        token_id: TokenId,
        amount: u128,
        hash_lock: [u8; 32],
        timeout: Timestamp,
        next_hop: Option<EntityId>,
    },

    /// Claim a locked HTLC by revealing its preimage.
    HtlcClaim { id: Vec<u8>, preimage: Vec<u8> },

    /// Reclaim a locked HTLC at or after its timeout.
    HtlcRefund { id: Vec<u8> },
}

impl AccountTx {
    pub fn to_rlp(&self) -> RlpValue {
        match self {
            AccountTx::Payment { token_id, amount } => RlpValue::list(vec![
                RlpValue::uint(0),
                RlpValue::bytes(token_id.as_bytes().to_vec()),
                RlpValue::uint(*amount),
            ]),
            AccountTx::SetCollateral { token_id, amount } => RlpValue::list(vec![
                RlpValue::uint(1),
                RlpValue::bytes(token_id.as_bytes().to_vec()),
                RlpValue::uint(*amount),
            ]),
            AccountTx::SetCreditLimit { token_id, amount } => RlpValue::list(vec![
                RlpValue::uint(2),
                RlpValue::bytes(token_id.as_bytes().to_vec()),
                RlpValue::uint(*amount),
            ]),
            AccountTx::HtlcLock {
                id,
                token_id,
                amount,
                hash_lock,
                timeout,
                next_hop,
            } => RlpValue::list(vec![
                RlpValue::uint(3),
                RlpValue::bytes(id.clone()),
                RlpValue::bytes(token_id.as_bytes().to_vec()),
                RlpValue::uint(*amount),
                RlpValue::bytes(hash_lock.to_vec()),
                RlpValue::int(*timeout as i128),
                opt_to_rlp(next_hop.as_ref(), |e| {
                    RlpValue::bytes(e.as_bytes().to_vec())
                }),
            ]),
            AccountTx::HtlcClaim { id, preimage } => RlpValue::list(vec![
                RlpValue::uint(4),
                RlpValue::bytes(id.clone()),
                RlpValue::bytes(preimage.clone()),
            ]),
            AccountTx::HtlcRefund { id } => {
                RlpValue::list(vec![RlpValue::uint(5), RlpValue::bytes(id.clone())])
            }
        }
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list()?;
        let tag = items
            .first()
            .ok_or(CodecError::WrongItemCount {
                expected: 1,
                found: 0,
            })?
            .as_uint()?;
        match tag {
            0 => {
                let items = value.as_list_of(3)?;
                Ok(AccountTx::Payment {
                    token_id: TokenId::new(items[1].as_bytes()?.to_vec()),
                    amount: items[2].as_uint()?,
                })
            }
            1 => {
                let items = value.as_list_of(3)?;
                Ok(AccountTx::SetCollateral {
                    token_id: TokenId::new(items[1].as_bytes()?.to_vec()),
                    amount: items[2].as_uint()?,
                })
            }
            2 => {
                let items = value.as_list_of(3)?;
                Ok(AccountTx::SetCreditLimit {
                    token_id: TokenId::new(items[1].as_bytes()?.to_vec()),
                    amount: items[2].as_uint()?,
                })
            }
            3 => {
                let items = value.as_list_of(7)?;
                let hash_bytes = items[4].as_bytes()?;
                if hash_bytes.len() != 32 {
                    return Err(CodecError::NonCanonicalInteger);
                }
                let mut hash_lock = [0u8; 32];
                hash_lock.copy_from_slice(hash_bytes);
                Ok(AccountTx::HtlcLock {
                    id: items[1].as_bytes()?.to_vec(),
                    token_id: TokenId::new(items[2].as_bytes()?.to_vec()),
                    amount: items[3].as_uint()?,
                    hash_lock,
                    timeout: items[5].as_int()? as Timestamp,
                    next_hop: opt_from_rlp(&items[6], |v| {
                        Ok(EntityId::new(v.as_bytes()?.to_vec()))
                    })?,
                })
            }
            4 => {
                let items = value.as_list_of(3)?;
                Ok(AccountTx::HtlcClaim {
                    id: items[1].as_bytes()?.to_vec(),
                    preimage: items[2].as_bytes()?.to_vec(),
                })
            }
            5 => {
                let items = value.as_list_of(2)?;
                Ok(AccountTx::HtlcRefund {
                    id: items[1].as_bytes()?.to_vec(),
                })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

// ── EntityTx ─────────────────────────────────────────────────────────────────

/// The payload of an entity-layer transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntityTxKind {
    /// Plain message appended to the entity chat log.
    Chat { message: String },

    /// Record a governance proposal under a key.
    Propose { key: String, action: String },

    /// Credit the entity reserve for a token.
    ReserveCredit { token_id: TokenId, amount: u128 },

    /// Debit the entity reserve for a token.
    ReserveDebit { token_id: TokenId, amount: u128 },

    /// Drive one of the entity's bilateral account machines with an inbound
    /// wire message.
    AccountUpdate { input: AccountInput },

    /// Queue an outbound transaction on one of the entity's bilateral
    /// account machines.
    AccountRequest {
        counterparty: EntityId,
        tx: AccountTx,
    },
}

/// An entity-layer transaction: payload plus replay metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityTx {
    pub from: SignerId,
    pub nonce: u64,
    pub kind: EntityTxKind,
}

impl EntityTx {
    /// Rank used in the proposer's deterministic ordering.
    pub fn kind_rank(&self) -> u8 {
        match self.kind {
            EntityTxKind::Chat { .. } => 0,
            EntityTxKind::Propose { .. } => 1,
            EntityTxKind::ReserveCredit { .. } => 2,
            EntityTxKind::ReserveDebit { .. } => 3,
            EntityTxKind::AccountUpdate { .. } => 4,
            EntityTxKind::AccountRequest { .. } => 5,
        }
    }

    /// Sort key for proposal construction: `(nonce, from, kind, index)`.
    pub fn sort_key(&self, insertion_index: usize) -> (u64, SignerId, u8, usize) {
        (
            self.nonce,
            self.from.clone(),
            self.kind_rank(),
            insertion_index,
        )
    }

    pub fn to_rlp(&self) -> RlpValue {
        let mut items = vec![
            RlpValue::uint(self.kind_rank() as u128),
            RlpValue::bytes(self.from.as_bytes().to_vec()),
            RlpValue::uint(self.nonce as u128),
        ];
        match &self.kind {
            EntityTxKind::Chat { message } => items.push(RlpValue::str(message)),
            EntityTxKind::Propose { key, action } => {
                items.push(RlpValue::str(key));
                items.push(RlpValue::str(action));
            }
            EntityTxKind::ReserveCredit { token_id, amount }
            | EntityTxKind::ReserveDebit { token_id, amount } => {
                items.push(RlpValue::bytes(token_id.as_bytes().to_vec()));
                items.push(RlpValue::uint(*amount));
            }
            EntityTxKind::AccountUpdate { input } => items.push(input.to_rlp()),
            EntityTxKind::AccountRequest { counterparty, tx } => {
                items.push(RlpValue::bytes(counterparty.as_bytes().to_vec()));
                items.push(tx.to_rlp());
            }
        }
        RlpValue::list(items)
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list()?;
        let tag = items
            .first()
            .ok_or(CodecError::WrongItemCount {
                expected: 4,
                found: 0,
            })?
            .as_uint()?;
        let expected = match tag {
            0 | 4 => 4,
            1..=3 | 5 => 5,
            other => return Err(CodecError::UnknownTag(other)),
        };
        let items = value.as_list_of(expected)?;
        let from = SignerId::new(items[1].as_bytes()?.to_vec());
        let nonce = items[2].as_uint()? as u64;
        let kind = match tag {
            0 => EntityTxKind::Chat {
                message: items[3].as_str()?.to_string(),
            },
            1 => EntityTxKind::Propose {
                key: items[3].as_str()?.to_string(),
                action: items[4].as_str()?.to_string(),
            },
            2 => EntityTxKind::ReserveCredit {
                token_id: TokenId::new(items[3].as_bytes()?.to_vec()),
                amount: items[4].as_uint()?,
            },
            3 => EntityTxKind::ReserveDebit {
                token_id: TokenId::new(items[3].as_bytes()?.to_vec()),
                amount: items[4].as_uint()?,
            },
            4 => EntityTxKind::AccountUpdate {
                input: AccountInput::from_rlp(&items[3])?,
            },
            _ => EntityTxKind::AccountRequest {
                counterparty: EntityId::new(items[3].as_bytes()?.to_vec()),
                tx: AccountTx::from_rlp(&items[4])?,
            },
        };
        Ok(EntityTx { from, nonce, kind })
    }
}

/// Sort transactions the way a proposer must before building a frame.
pub fn sort_for_proposal(txs: &mut Vec<EntityTx>) {
    let mut keyed: Vec<_> = txs
        .drain(..)
        .enumerate()
        .map(|(i, tx)| (tx.sort_key(i), tx))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    *txs = keyed.into_iter().map(|(_, tx)| tx).collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_tx_rlp_round_trip() {
        let txs = vec![
            AccountTx::Payment {
                token_id: TokenId::number(1),
                amount: 100,
            },
            AccountTx::SetCreditLimit {
                token_id: TokenId::number(2),
                amount: 5_000,
            },
            AccountTx::HtlcLock {
                id: vec![7; 8],
                token_id: TokenId::number(1),
                amount: 42,
                hash_lock: [9u8; 32],
                timeout: 1_700_000_060,
                next_hop: Some(EntityId::new(*b"carol")),
            },
            AccountTx::HtlcClaim {
                id: vec![7; 8],
                preimage: b"preimage".to_vec(),
            },
            AccountTx::HtlcRefund { id: vec![7; 8] },
        ];
        for tx in txs {
            assert_eq!(AccountTx::from_rlp(&tx.to_rlp()).unwrap(), tx);
        }
    }

    #[test]
    fn entity_tx_rlp_round_trip() {
        let tx = EntityTx {
            from: SignerId::new(*b"val-1"),
            nonce: 3,
            kind: EntityTxKind::Chat {
                message: "hello".into(),
            },
        };
        assert_eq!(EntityTx::from_rlp(&tx.to_rlp()).unwrap(), tx);
    }

    #[test]
    fn proposal_sort_is_by_nonce_then_signer() {
        let tx = |from: &[u8], nonce| EntityTx {
            from: SignerId::new(from.to_vec()),
            nonce,
            kind: EntityTxKind::Chat {
                message: String::new(),
            },
        };
        let mut txs = vec![tx(b"bob", 2), tx(b"alice", 2), tx(b"bob", 1)];
        sort_for_proposal(&mut txs);
        assert_eq!(txs[0].nonce, 1);
        assert_eq!(txs[1].from, SignerId::new(*b"alice"));
        assert_eq!(txs[2].from, SignerId::new(*b"bob"));
    }
}
