//! Frames and wire messages for the bilateral account layer and the entity
//! BFT layer.
//!
//! A frame's `state_hash` is keccak-256 over the canonical RLP of the frame
//! *without* its `state_hash` and `signatures` fields; signatures cover the
//! state hash. Frames are append-only: once committed they are never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xln_crypto::{keccak256, rlp_encode, CodecError, RlpValue};

use crate::constants::GENESIS_PREV_HASH;
use crate::delta::Delta;
use crate::tx::{AccountTx, EntityTx};
use crate::types::{Amount, EntityId, Height, Signature, SignerId, Timestamp, TokenId};

// ── PrevHash ─────────────────────────────────────────────────────────────────

/// Reference to the previous frame in a chain: the literal genesis marker at
/// height 0, or the state hash of the frame below.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrevHash {
    Genesis,
    Hash([u8; 32]),
}

impl PrevHash {
    pub fn to_rlp(&self) -> RlpValue {
        match self {
            PrevHash::Genesis => RlpValue::str(GENESIS_PREV_HASH),
            PrevHash::Hash(h) => RlpValue::bytes(h.to_vec()),
        }
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let bytes = value.as_bytes()?;
        if bytes == GENESIS_PREV_HASH.as_bytes() {
            return Ok(PrevHash::Genesis);
        }
        if bytes.len() == 32 {
            let mut h = [0u8; 32];
            h.copy_from_slice(bytes);
            return Ok(PrevHash::Hash(h));
        }
        Err(CodecError::ExpectedBytes)
    }
}

impl fmt::Display for PrevHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrevHash::Genesis => write!(f, "{GENESIS_PREV_HASH}"),
            PrevHash::Hash(h) => write!(f, "{}", hex::encode(h)),
        }
    }
}

impl fmt::Debug for PrevHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrevHash({self})")
    }
}

// ── Option helpers ───────────────────────────────────────────────────────────

/// Optionals on the wire are zero-or-one-element lists.
pub fn opt_to_rlp<T>(value: Option<&T>, encode: impl Fn(&T) -> RlpValue) -> RlpValue {
    match value {
        Some(v) => RlpValue::list(vec![encode(v)]),
        None => RlpValue::list(vec![]),
    }
}

pub fn opt_from_rlp<T>(
    value: &RlpValue,
    decode: impl Fn(&RlpValue) -> Result<T, CodecError>,
) -> Result<Option<T>, CodecError> {
    let items = value.as_list()?;
    match items.len() {
        0 => Ok(None),
        1 => Ok(Some(decode(&items[0])?)),
        n => Err(CodecError::WrongItemCount {
            expected: 1,
            found: n,
        }),
    }
}

fn sigs_to_rlp(sigs: &[Signature]) -> RlpValue {
    RlpValue::list(sigs.iter().map(|s| RlpValue::bytes(s.0.clone())).collect())
}

fn sigs_from_rlp(value: &RlpValue) -> Result<Vec<Signature>, CodecError> {
    value
        .as_list()?
        .iter()
        .map(|v| Ok(Signature(v.as_bytes()?.to_vec())))
        .collect()
}

// ── AccountFrame ─────────────────────────────────────────────────────────────

/// One step of a bilateral account chain.
///
/// `token_ids` and `deltas` are the filtered canonical summary both sides
/// must reproduce byte-exactly; `full_delta_states` carries the complete
/// per-token state needed for dispute proofs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountFrame {
    pub height: Height,
    pub timestamp: Timestamp,
    pub prev_frame_hash: PrevHash,
    pub account_txs: Vec<AccountTx>,
    pub token_ids: Vec<TokenId>,
    pub deltas: Vec<Amount>,
    pub full_delta_states: Vec<Delta>,
    pub state_hash: [u8; 32],
    /// Up to two signatures in canonical left/right order.
    pub signatures: Vec<Signature>,
}

impl AccountFrame {
    /// Canonical items covered by the state hash, in wire order.
    fn hashable_items(&self) -> Vec<RlpValue> {
        vec![
            RlpValue::uint(self.height as u128),
            RlpValue::int(self.timestamp as i128),
            self.prev_frame_hash.to_rlp(),
            RlpValue::list(self.account_txs.iter().map(|t| t.to_rlp()).collect()),
            RlpValue::list(
                self.token_ids
                    .iter()
                    .map(|t| RlpValue::bytes(t.as_bytes().to_vec()))
                    .collect(),
            ),
            RlpValue::list(self.deltas.iter().map(|d| RlpValue::int(*d)).collect()),
            RlpValue::list(self.full_delta_states.iter().map(|d| d.to_rlp()).collect()),
        ]
    }

    /// keccak-256 over the canonical signature-free form.
    pub fn compute_state_hash(&self) -> [u8; 32] {
        keccak256(&rlp_encode(&RlpValue::list(self.hashable_items())))
    }

    /// Recompute and store the state hash; returns it for convenience.
    pub fn seal(&mut self) -> [u8; 32] {
        self.state_hash = self.compute_state_hash();
        self.state_hash
    }

    pub fn to_rlp(&self) -> RlpValue {
        let mut items = self.hashable_items();
        items.push(RlpValue::bytes(self.state_hash.to_vec()));
        items.push(sigs_to_rlp(&self.signatures));
        RlpValue::list(items)
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(9)?;
        let state_bytes = items[7].as_bytes()?;
        if state_bytes.len() != 32 {
            return Err(CodecError::ExpectedBytes);
        }
        let mut state_hash = [0u8; 32];
        state_hash.copy_from_slice(state_bytes);
        Ok(Self {
            height: items[0].as_uint()? as Height,
            timestamp: items[1].as_int()? as Timestamp,
            prev_frame_hash: PrevHash::from_rlp(&items[2])?,
            account_txs: items[3]
                .as_list()?
                .iter()
                .map(AccountTx::from_rlp)
                .collect::<Result<_, _>>()?,
            token_ids: items[4]
                .as_list()?
                .iter()
                .map(|v| Ok::<TokenId, CodecError>(TokenId::new(v.as_bytes()?.to_vec())))
                .collect::<Result<_, _>>()?,
            deltas: items[5]
                .as_list()?
                .iter()
                .map(|v| v.as_int())
                .collect::<Result<_, _>>()?,
            full_delta_states: items[6]
                .as_list()?
                .iter()
                .map(Delta::from_rlp)
                .collect::<Result<_, _>>()?,
            state_hash,
            signatures: sigs_from_rlp(&items[8])?,
        })
    }

    /// Size of the canonical encoding, checked against the frame cap.
    pub fn encoded_size(&self) -> usize {
        rlp_encode(&self.to_rlp()).len()
    }
}

// ── AccountInput ─────────────────────────────────────────────────────────────

/// The single wire message of the bilateral protocol. One message may carry
/// an ACK of the previously proposed frame (`prev_signatures`), a new frame
/// proposal (`new_account_frame` + `new_signatures`), or both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountInput {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub height: Height,
    /// Must equal the receiver's `acked_transitions + 1`.
    pub counter: u64,
    pub new_account_frame: Option<AccountFrame>,
    pub new_signatures: Vec<Signature>,
    pub prev_signatures: Vec<Signature>,
}

impl AccountInput {
    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.from_entity.as_bytes().to_vec()),
            RlpValue::bytes(self.to_entity.as_bytes().to_vec()),
            RlpValue::uint(self.height as u128),
            RlpValue::uint(self.counter as u128),
            opt_to_rlp(self.new_account_frame.as_ref(), |f| f.to_rlp()),
            sigs_to_rlp(&self.new_signatures),
            sigs_to_rlp(&self.prev_signatures),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(7)?;
        Ok(Self {
            from_entity: EntityId::new(items[0].as_bytes()?.to_vec()),
            to_entity: EntityId::new(items[1].as_bytes()?.to_vec()),
            height: items[2].as_uint()? as Height,
            counter: items[3].as_uint()? as u64,
            new_account_frame: opt_from_rlp(&items[4], AccountFrame::from_rlp)?,
            new_signatures: sigs_from_rlp(&items[5])?,
            prev_signatures: sigs_from_rlp(&items[6])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp_encode(&self.to_rlp())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_rlp(&xln_crypto::rlp_decode(bytes)?)
    }
}

// ── EntityFrame ──────────────────────────────────────────────────────────────

/// One step of an entity BFT chain. The signature map is keyed by signer and
/// iterated in sorted order wherever it is encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityFrame {
    pub height: Height,
    pub prev_frame_hash: PrevHash,
    pub txs: Vec<EntityTx>,
    pub timestamp: Timestamp,
    pub signatures: BTreeMap<SignerId, Signature>,
}

impl EntityFrame {
    fn hashable_items(&self) -> Vec<RlpValue> {
        vec![
            RlpValue::uint(self.height as u128),
            self.prev_frame_hash.to_rlp(),
            RlpValue::list(self.txs.iter().map(|t| t.to_rlp()).collect()),
            RlpValue::int(self.timestamp as i128),
        ]
    }

    /// keccak-256 over the canonical signature-free form.
    pub fn frame_hash(&self) -> [u8; 32] {
        keccak256(&rlp_encode(&RlpValue::list(self.hashable_items())))
    }

    pub fn to_rlp(&self) -> RlpValue {
        let mut items = self.hashable_items();
        items.push(RlpValue::list(
            self.signatures
                .iter()
                .map(|(signer, sig)| {
                    RlpValue::list(vec![
                        RlpValue::bytes(signer.as_bytes().to_vec()),
                        RlpValue::bytes(sig.0.clone()),
                    ])
                })
                .collect(),
        ));
        RlpValue::list(items)
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(5)?;
        let mut signatures = BTreeMap::new();
        for pair in items[4].as_list()? {
            let pair = pair.as_list_of(2)?;
            signatures.insert(
                SignerId::new(pair[0].as_bytes()?.to_vec()),
                Signature(pair[1].as_bytes()?.to_vec()),
            );
        }
        Ok(Self {
            height: items[0].as_uint()? as Height,
            prev_frame_hash: PrevHash::from_rlp(&items[1])?,
            txs: items[2]
                .as_list()?
                .iter()
                .map(EntityTx::from_rlp)
                .collect::<Result<_, _>>()?,
            timestamp: items[3].as_int()? as Timestamp,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::EntityTxKind;

    fn sample_frame() -> AccountFrame {
        let mut delta = Delta::new(TokenId::number(1));
        delta.collateral = 1000;
        delta.offdelta = -100;
        let mut frame = AccountFrame {
            height: 1,
            timestamp: 1_700_000_000,
            prev_frame_hash: PrevHash::Genesis,
            account_txs: vec![AccountTx::Payment {
                token_id: TokenId::number(1),
                amount: 100,
            }],
            token_ids: vec![TokenId::number(1)],
            deltas: vec![-100],
            full_delta_states: vec![delta],
            state_hash: [0u8; 32],
            signatures: vec![],
        };
        frame.seal();
        frame
    }

    #[test]
    fn state_hash_ignores_signatures() {
        let mut frame = sample_frame();
        let sealed = frame.state_hash;
        frame.signatures.push(Signature(vec![1, 2, 3]));
        assert_eq!(frame.compute_state_hash(), sealed);
    }

    #[test]
    fn state_hash_covers_every_body_field() {
        let base = sample_frame();
        let mut changed = base.clone();
        changed.timestamp += 1;
        assert_ne!(base.state_hash, changed.compute_state_hash());

        let mut changed = base.clone();
        changed.deltas[0] = -99;
        assert_ne!(base.state_hash, changed.compute_state_hash());
    }

    #[test]
    fn account_frame_rlp_round_trip() {
        let mut frame = sample_frame();
        frame.signatures.push(Signature(vec![0xaa; 64]));
        assert_eq!(AccountFrame::from_rlp(&frame.to_rlp()).unwrap(), frame);
    }

    #[test]
    fn account_input_round_trip_with_batched_content() {
        let input = AccountInput {
            from_entity: EntityId::new(*b"alice"),
            to_entity: EntityId::new(*b"bob"),
            height: 1,
            counter: 1,
            new_account_frame: Some(sample_frame()),
            new_signatures: vec![Signature(vec![1; 64])],
            prev_signatures: vec![Signature(vec![2; 64])],
        };
        assert_eq!(AccountInput::decode(&input.encode()).unwrap(), input);
    }

    #[test]
    fn genesis_prev_hash_survives_round_trip() {
        assert_eq!(
            PrevHash::from_rlp(&PrevHash::Genesis.to_rlp()).unwrap(),
            PrevHash::Genesis
        );
        let h = PrevHash::Hash([5u8; 32]);
        assert_eq!(PrevHash::from_rlp(&h.to_rlp()).unwrap(), h);
    }

    #[test]
    fn entity_frame_hash_is_signature_independent() {
        let mut frame = EntityFrame {
            height: 3,
            prev_frame_hash: PrevHash::Hash([7u8; 32]),
            txs: vec![EntityTx {
                from: SignerId::new(*b"val-1"),
                nonce: 0,
                kind: EntityTxKind::Chat {
                    message: "gm".into(),
                },
            }],
            timestamp: 1_700_000_100,
            signatures: BTreeMap::new(),
        };
        let unsigned = frame.frame_hash();
        frame
            .signatures
            .insert(SignerId::new(*b"val-1"), Signature(vec![9; 64]));
        assert_eq!(frame.frame_hash(), unsigned);
        assert_eq!(EntityFrame::from_rlp(&frame.to_rlp()).unwrap(), frame);
    }
}
