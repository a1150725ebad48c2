//! The entity BFT state machine.
//!
//! A fixed validator set agrees on a chain of [`EntityFrame`]s with weighted
//! ⅔ quorum: propose → precommit → commit. A validator that precommits a
//! frame locks on it and will not precommit a different frame at that
//! height; the lock is released when a frame at or above the locked height
//! commits.
//!
//! Entity state embeds the bilateral [`AccountMachine`]s. Every mutation of
//! an embedded machine flows through a committed entity transaction
//! (`AccountRequest` queues outbound work, `AccountUpdate` applies inbound
//! wire messages), so replicas that execute the same frames hold identical
//! account state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use xln_crypto::{keccak256, rlp_encode, CodecError, RlpValue};

use xln_account::{AccountMachine, ForwardInstruction};
use xln_core::frame::{opt_from_rlp, opt_to_rlp};
use xln_core::{
    sort_for_proposal, AccountInput, EntityFrame, EntityId, EntityTx, EntityTxKind, Height,
    PrevHash, Signature, Signer, SignerId, Timestamp, TokenId, XlnError, MEMPOOL_LIMIT,
};

use crate::quorum::ValidatorSet;

// ── Messages ─────────────────────────────────────────────────────────────────

/// Wire messages of the entity consensus protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityMessage {
    /// Proposer broadcasts a candidate frame (carrying its own signature).
    Proposal { frame: EntityFrame },
    /// A validator's signed endorsement of a proposal.
    Precommit {
        height: Height,
        frame_hash: [u8; 32],
        signer: SignerId,
        signature: Signature,
    },
    /// A frame plus a quorum of precommit signatures.
    Commit { frame: EntityFrame },
}

impl EntityMessage {
    pub fn to_rlp(&self) -> RlpValue {
        match self {
            EntityMessage::Proposal { frame } => {
                RlpValue::list(vec![RlpValue::uint(0), frame.to_rlp()])
            }
            EntityMessage::Precommit {
                height,
                frame_hash,
                signer,
                signature,
            } => RlpValue::list(vec![
                RlpValue::uint(1),
                RlpValue::uint(*height as u128),
                RlpValue::bytes(frame_hash.to_vec()),
                RlpValue::bytes(signer.as_bytes().to_vec()),
                RlpValue::bytes(signature.0.clone()),
            ]),
            EntityMessage::Commit { frame } => {
                RlpValue::list(vec![RlpValue::uint(2), frame.to_rlp()])
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
                let items = value.as_list_of(2)?;
                Ok(EntityMessage::Proposal {
                    frame: EntityFrame::from_rlp(&items[1])?,
                })
            }
            1 => {
                let items = value.as_list_of(5)?;
                let hash_bytes = items[2].as_bytes()?;
                if hash_bytes.len() != 32 {
                    return Err(CodecError::ExpectedBytes);
                }
                let mut frame_hash = [0u8; 32];
                frame_hash.copy_from_slice(hash_bytes);
                Ok(EntityMessage::Precommit {
                    height: items[1].as_uint()? as Height,
                    frame_hash,
                    signer: SignerId::new(items[3].as_bytes()?.to_vec()),
                    signature: Signature(items[4].as_bytes()?.to_vec()),
                })
            }
            2 => {
                let items = value.as_list_of(2)?;
                Ok(EntityMessage::Commit {
                    frame: EntityFrame::from_rlp(&items[1])?,
                })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// Two distinct signed frames from one signer at one height. Reported, never
/// acted on here; slashing is the jurisdiction's business.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoubleSignEvidence {
    pub signer: SignerId,
    pub height: Height,
    pub first: [u8; 32],
    pub second: [u8; 32],
}

/// Everything a replica transition hands back to the host.
#[derive(Debug, Default)]
pub struct EntityOutputs {
    pub message: Option<EntityMessage>,
    pub evidence: Vec<DoubleSignEvidence>,
    /// Outbound bilateral wire messages produced by committed account txs.
    pub account_messages: Vec<AccountInput>,
    /// Multi-hop forward instructions surfaced by committed account frames.
    pub forwards: Vec<ForwardInstruction>,
}

// ── EntityState ──────────────────────────────────────────────────────────────

/// The replicated state of one entity: replay nonces, token reserves, the
/// chat log, governance proposals, and the bilateral account machines keyed
/// by counterparty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub nonces: BTreeMap<SignerId, u64>,
    pub reserves: BTreeMap<TokenId, u128>,
    pub messages: Vec<String>,
    pub proposals: BTreeMap<String, String>,
    pub accounts: BTreeMap<EntityId, AccountMachine>,
}

/// Side effects of applying one entity transaction.
#[derive(Debug, Default)]
pub struct EntityEffects {
    pub account_message: Option<AccountInput>,
    pub forward: Option<ForwardInstruction>,
}

impl EntityState {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            nonces: BTreeMap::new(),
            reserves: BTreeMap::new(),
            messages: Vec::new(),
            proposals: BTreeMap::new(),
            accounts: BTreeMap::new(),
        }
    }

    /// Apply one transaction. The signer nonce advances only on success.
    pub fn apply_tx(
        &mut self,
        tx: &EntityTx,
        signer: &dyn Signer,
        frame_ts: Timestamp,
    ) -> Result<EntityEffects, XlnError> {
        let expected = self.nonces.get(&tx.from).copied().unwrap_or(0);
        if tx.nonce != expected {
            return Err(XlnError::ReplayCounter {
                expected,
                got: tx.nonce,
            });
        }

        let mut effects = EntityEffects::default();
        match &tx.kind {
            EntityTxKind::Chat { message } => {
                self.messages.push(message.clone());
            }
            EntityTxKind::Propose { key, action } => {
                self.proposals.insert(key.clone(), action.clone());
            }
            EntityTxKind::ReserveCredit { token_id, amount } => {
                *self.reserves.entry(token_id.clone()).or_insert(0) += amount;
            }
            EntityTxKind::ReserveDebit { token_id, amount } => {
                let have = self.reserves.get(token_id).copied().unwrap_or(0);
                if have < *amount {
                    return Err(XlnError::InsufficientReserve {
                        token: token_id.clone(),
                        need: *amount,
                        have,
                    });
                }
                // Zero entries are dropped so the canonical encoding stays
                // free of dead keys.
                if have == *amount {
                    self.reserves.remove(token_id);
                } else {
                    self.reserves.insert(token_id.clone(), have - amount);
                }
            }
            EntityTxKind::AccountUpdate { input } => {
                if input.to_entity != self.entity_id {
                    return Err(XlnError::MalformedMessage(
                        "account update addressed to another entity".into(),
                    ));
                }
                let machine = self.account_machine(&input.from_entity);
                let out = machine.receive(input, signer, frame_ts)?;
                effects.account_message = out.message;
                effects.forward = out.forward;
            }
            EntityTxKind::AccountRequest { counterparty, tx } => {
                if *counterparty == self.entity_id {
                    return Err(XlnError::MalformedMessage(
                        "account with self is not a thing".into(),
                    ));
                }
                let machine = self.account_machine(counterparty);
                machine.add_to_mempool(tx.clone(), frame_ts)?;
                effects.account_message = machine.propose(signer, frame_ts)?;
            }
        }

        self.nonces.insert(tx.from.clone(), expected + 1);
        Ok(effects)
    }

    fn account_machine(&mut self, counterparty: &EntityId) -> &mut AccountMachine {
        let entity_id = self.entity_id.clone();
        self.accounts
            .entry(counterparty.clone())
            .or_insert_with(|| AccountMachine::new(entity_id, counterparty.clone()))
    }

    /// keccak-256 over the canonical encoding; the per-replica hash that
    /// snapshots commit to.
    pub fn state_hash(&self) -> [u8; 32] {
        keccak256(&rlp_encode(&self.to_rlp()))
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.entity_id.as_bytes().to_vec()),
            RlpValue::list(
                self.nonces
                    .iter()
                    .map(|(s, n)| {
                        RlpValue::list(vec![
                            RlpValue::bytes(s.as_bytes().to_vec()),
                            RlpValue::uint(*n as u128),
                        ])
                    })
                    .collect(),
            ),
            RlpValue::list(
                self.reserves
                    .iter()
                    .map(|(t, a)| {
                        RlpValue::list(vec![
                            RlpValue::bytes(t.as_bytes().to_vec()),
                            RlpValue::uint(*a),
                        ])
                    })
                    .collect(),
            ),
            RlpValue::list(self.messages.iter().map(|m| RlpValue::str(m)).collect()),
            RlpValue::list(
                self.proposals
                    .iter()
                    .map(|(k, v)| RlpValue::list(vec![RlpValue::str(k), RlpValue::str(v)]))
                    .collect(),
            ),
            RlpValue::list(self.accounts.values().map(|m| m.to_rlp()).collect()),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(6)?;
        let mut nonces = BTreeMap::new();
        for pair in items[1].as_list()? {
            let pair = pair.as_list_of(2)?;
            nonces.insert(
                SignerId::new(pair[0].as_bytes()?.to_vec()),
                pair[1].as_uint()? as u64,
            );
        }
        let mut reserves = BTreeMap::new();
        for pair in items[2].as_list()? {
            let pair = pair.as_list_of(2)?;
            reserves.insert(TokenId::new(pair[0].as_bytes()?.to_vec()), pair[1].as_uint()?);
        }
        let mut proposals = BTreeMap::new();
        for pair in items[4].as_list()? {
            let pair = pair.as_list_of(2)?;
            proposals.insert(pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string());
        }
        let mut accounts = BTreeMap::new();
        for m in items[5].as_list()? {
            let machine = AccountMachine::from_rlp(m)?;
            accounts.insert(machine.counterparty.clone(), machine);
        }
        Ok(Self {
            entity_id: EntityId::new(items[0].as_bytes()?.to_vec()),
            nonces,
            reserves,
            messages: items[3]
                .as_list()?
                .iter()
                .map(|m| Ok(m.as_str()?.to_string()))
                .collect::<Result<_, CodecError>>()?,
            proposals,
            accounts,
        })
    }
}

// ── EntityReplica ────────────────────────────────────────────────────────────

/// One validator's replica of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityReplica {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub validators: ValidatorSet,
    pub state: EntityState,
    pub mempool: Vec<EntityTx>,
    /// The frame currently in flight at `current_height + 1`, if any.
    pub proposal: Option<EntityFrame>,
    /// Precommit signatures collected for `proposal`.
    pub precommits: BTreeMap<SignerId, Signature>,
    /// The frame this validator has precommitted at the in-flight height.
    pub locked_frame: Option<EntityFrame>,
    pub last_committed: Option<EntityFrame>,
    pub current_height: Height,
    /// Frame hashes observed per signer per height, for double-sign
    /// detection. Pruned on commit.
    seen: BTreeMap<Height, BTreeMap<SignerId, [u8; 32]>>,
}

impl EntityReplica {
    pub fn new(entity_id: EntityId, signer_id: SignerId, validators: ValidatorSet) -> Self {
        let state = EntityState::new(entity_id.clone());
        Self {
            entity_id,
            signer_id,
            validators,
            state,
            mempool: Vec::new(),
            proposal: None,
            precommits: BTreeMap::new(),
            locked_frame: None,
            last_committed: None,
            current_height: 0,
            seen: BTreeMap::new(),
        }
    }

    pub fn is_proposer(&self) -> bool {
        self.validators.proposer() == Some(&self.signer_id)
    }

    pub fn add_tx(&mut self, tx: EntityTx) -> Result<(), XlnError> {
        if self.mempool.len() >= MEMPOOL_LIMIT {
            return Err(XlnError::MempoolFull {
                limit: MEMPOOL_LIMIT,
            });
        }
        self.mempool.push(tx);
        Ok(())
    }

    fn prev_hash(&self) -> PrevHash {
        match &self.last_committed {
            Some(f) => PrevHash::Hash(f.frame_hash()),
            None => PrevHash::Genesis,
        }
    }

    /// Record that `signer` signed `hash` at `height`; returns evidence if a
    /// different hash was already seen from them.
    fn observe_signature(
        &mut self,
        height: Height,
        signer: &SignerId,
        hash: [u8; 32],
    ) -> Option<DoubleSignEvidence> {
        let by_signer = self.seen.entry(height).or_default();
        match by_signer.get(signer) {
            Some(first) if *first != hash => Some(DoubleSignEvidence {
                signer: signer.clone(),
                height,
                first: *first,
                second: hash,
            }),
            Some(_) => None,
            None => {
                by_signer.insert(signer.clone(), hash);
                None
            }
        }
    }

    // ── Propose ──────────────────────────────────────────────────────────────

    /// Build and sign a frame from the mempool. Only the designated proposer
    /// may call this.
    pub fn propose(
        &mut self,
        signer: &dyn Signer,
        now: Timestamp,
    ) -> Result<Option<EntityMessage>, XlnError> {
        if !self.is_proposer() {
            return Err(XlnError::NotProposer);
        }
        if self.proposal.is_some() || self.mempool.is_empty() {
            return Ok(None);
        }

        let mut txs: Vec<EntityTx> = self.mempool.drain(..).collect();
        sort_for_proposal(&mut txs);

        // Filter transactions that no longer apply; what ships must
        // re-execute cleanly on every validator.
        let mut probe = self.state.clone();
        let mut valid = Vec::with_capacity(txs.len());
        for tx in txs {
            let mut attempt = probe.clone();
            match attempt.apply_tx(&tx, signer, now) {
                Ok(_) => {
                    probe = attempt;
                    valid.push(tx);
                }
                Err(e) => warn!(error = %e, "dropping entity tx that no longer applies"),
            }
        }
        if valid.is_empty() {
            return Ok(None);
        }

        let mut frame = EntityFrame {
            height: self.current_height + 1,
            prev_frame_hash: self.prev_hash(),
            txs: valid,
            timestamp: now,
            signatures: BTreeMap::new(),
        };
        let hash = frame.frame_hash();
        let signature = signer.sign(&self.signer_id, &hash)?;
        frame.signatures.insert(self.signer_id.clone(), signature.clone());

        self.observe_signature(frame.height, &self.signer_id.clone(), hash);
        self.locked_frame = Some(frame.clone());
        self.proposal = Some(frame.clone());
        self.precommits.clear();
        self.precommits.insert(self.signer_id.clone(), signature);
        info!(height = frame.height, txs = frame.txs.len(), "proposed entity frame");
        Ok(Some(EntityMessage::Proposal { frame }))
    }

    // ── Precommit ────────────────────────────────────────────────────────────

    /// Validate a proposal, lock on it, and answer with a precommit.
    pub fn handle_proposal(
        &mut self,
        frame: &EntityFrame,
        signer: &dyn Signer,
    ) -> Result<EntityOutputs, XlnError> {
        let mut outputs = EntityOutputs::default();

        let expected_height = self.current_height + 1;
        if frame.height != expected_height {
            return Err(XlnError::WrongHeight {
                expected: expected_height,
                got: frame.height,
            });
        }
        let expected_prev = self.prev_hash();
        if frame.prev_frame_hash != expected_prev {
            return Err(XlnError::WrongPrevFrameHash {
                height: frame.height,
                expected: expected_prev.to_string(),
                got: frame.prev_frame_hash.to_string(),
            });
        }
        let proposer = self
            .validators
            .proposer()
            .cloned()
            .ok_or_else(|| XlnError::MalformedMessage("validator set has no proposer".into()))?;
        let hash = frame.frame_hash();
        let proposer_sig = frame.signatures.get(&proposer).ok_or_else(|| {
            XlnError::MalformedMessage("proposal missing proposer signature".into())
        })?;
        if !signer.verify(&proposer, &hash, proposer_sig) {
            return Err(XlnError::BadSignature {
                signer: proposer.to_string(),
            });
        }

        if let Some(evidence) = self.observe_signature(frame.height, &proposer, hash) {
            warn!(signer = %evidence.signer, height = evidence.height, "double-signed proposal");
            outputs.evidence.push(evidence);
            return Ok(outputs);
        }

        // A locked validator does not precommit a different frame at the
        // same height.
        if let Some(locked) = &self.locked_frame {
            if locked.height == frame.height && locked.frame_hash() != hash {
                debug!(height = frame.height, "locked on a different frame; withholding precommit");
                return Ok(outputs);
            }
        }

        // Independent re-execution; a frame that fails to apply is rejected.
        let mut probe = self.state.clone();
        for tx in &frame.txs {
            probe.apply_tx(tx, signer, frame.timestamp)?;
        }

        self.locked_frame = Some(frame.clone());
        self.proposal = Some(frame.clone());
        let signature = signer.sign(&self.signer_id, &hash)?;
        self.observe_signature(frame.height, &self.signer_id.clone(), hash);
        debug!(height = frame.height, "precommitted");
        outputs.message = Some(EntityMessage::Precommit {
            height: frame.height,
            frame_hash: hash,
            signer: self.signer_id.clone(),
            signature,
        });
        Ok(outputs)
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Collect a precommit. When the accumulated voting power reaches the
    /// quorum, the frame commits locally and a `Commit` carrying the
    /// signature set is returned for broadcast.
    pub fn collect_precommit(
        &mut self,
        height: Height,
        frame_hash: [u8; 32],
        from: &SignerId,
        signature: &Signature,
        signer: &dyn Signer,
    ) -> Result<EntityOutputs, XlnError> {
        let mut outputs = EntityOutputs::default();

        if !self.validators.is_validator(from) {
            return Err(XlnError::UnknownEntity(from.to_string()));
        }
        if !signer.verify(from, &frame_hash, signature) {
            return Err(XlnError::BadSignature {
                signer: from.to_string(),
            });
        }
        if let Some(evidence) = self.observe_signature(height, from, frame_hash) {
            warn!(signer = %evidence.signer, height, "double-signed precommit");
            outputs.evidence.push(evidence);
            return Ok(outputs);
        }

        let proposal = match &self.proposal {
            Some(p) if p.height == height && p.frame_hash() == frame_hash => p.clone(),
            _ => {
                debug!(height, "precommit for a frame we are not collecting");
                return Ok(outputs);
            }
        };

        self.precommits.insert(from.clone(), signature.clone());
        let power: u64 = self
            .precommits
            .keys()
            .map(|s| self.validators.power_of(s))
            .sum();
        let quorum = self.validators.quorum();
        if power < quorum {
            debug!(height, power, quorum, "quorum not yet reached");
            return Ok(outputs);
        }

        let mut committed = proposal;
        committed.signatures = self.precommits.clone();
        let effects = self.commit_frame(&committed, signer)?;
        outputs.account_messages = effects.0;
        outputs.forwards = effects.1;
        outputs.message = Some(EntityMessage::Commit { frame: committed });
        Ok(outputs)
    }

    /// Apply a quorum commit received from the network.
    pub fn handle_commit(
        &mut self,
        frame: &EntityFrame,
        signer: &dyn Signer,
    ) -> Result<EntityOutputs, XlnError> {
        let mut outputs = EntityOutputs::default();

        let expected_height = self.current_height + 1;
        if frame.height != expected_height {
            return Err(XlnError::WrongHeight {
                expected: expected_height,
                got: frame.height,
            });
        }
        let expected_prev = self.prev_hash();
        if frame.prev_frame_hash != expected_prev {
            return Err(XlnError::WrongPrevFrameHash {
                height: frame.height,
                expected: expected_prev.to_string(),
                got: frame.prev_frame_hash.to_string(),
            });
        }
        let hash = frame.frame_hash();
        let mut power = 0u64;
        for (signer_id, signature) in &frame.signatures {
            if !self.validators.is_validator(signer_id) {
                return Err(XlnError::UnknownEntity(signer_id.to_string()));
            }
            if !signer.verify(signer_id, &hash, signature) {
                return Err(XlnError::BadSignature {
                    signer: signer_id.to_string(),
                });
            }
            power += self.validators.power_of(signer_id);
        }
        let quorum = self.validators.quorum();
        if power < quorum {
            return Err(XlnError::QuorumNotReached {
                have: power,
                need: quorum,
            });
        }

        let effects = self.commit_frame(frame, signer)?;
        outputs.account_messages = effects.0;
        outputs.forwards = effects.1;
        Ok(outputs)
    }

    /// Re-execute and commit a frame, advancing height and releasing any
    /// lock at or below it.
    fn commit_frame(
        &mut self,
        frame: &EntityFrame,
        signer: &dyn Signer,
    ) -> Result<(Vec<AccountInput>, Vec<ForwardInstruction>), XlnError> {
        let mut post = self.state.clone();
        let mut account_messages = Vec::new();
        let mut forwards = Vec::new();
        for tx in &frame.txs {
            let effects = post.apply_tx(tx, signer, frame.timestamp)?;
            if let Some(m) = effects.account_message {
                account_messages.push(m);
            }
            if let Some(f) = effects.forward {
                forwards.push(f);
            }
        }

        self.state = post;
        self.current_height = frame.height;
        self.last_committed = Some(frame.clone());
        self.proposal = None;
        self.precommits.clear();
        if let Some(locked) = &self.locked_frame {
            if locked.height <= frame.height {
                self.locked_frame = None;
            }
        }
        self.seen = self.seen.split_off(&(frame.height + 1));
        info!(height = frame.height, entity = %self.entity_id, "committed entity frame");
        Ok((account_messages, forwards))
    }

    /// External view-change hook. Liveness is the host's responsibility.
    pub fn change_proposer(&mut self, new_proposer: SignerId) -> Result<(), XlnError> {
        if !self.validators.change_proposer(new_proposer.clone()) {
            return Err(XlnError::UnknownEntity(new_proposer.to_string()));
        }
        Ok(())
    }

    /// The replica's state hash, for divergence detection across validators.
    pub fn state_hash(&self) -> [u8; 32] {
        self.state.state_hash()
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.entity_id.as_bytes().to_vec()),
            RlpValue::bytes(self.signer_id.as_bytes().to_vec()),
            self.validators.to_rlp(),
            self.state.to_rlp(),
            RlpValue::list(self.mempool.iter().map(|t| t.to_rlp()).collect()),
            opt_to_rlp(self.proposal.as_ref(), |f| f.to_rlp()),
            RlpValue::list(
                self.precommits
                    .iter()
                    .map(|(s, sig)| {
                        RlpValue::list(vec![
                            RlpValue::bytes(s.as_bytes().to_vec()),
                            RlpValue::bytes(sig.0.clone()),
                        ])
                    })
                    .collect(),
            ),
            opt_to_rlp(self.locked_frame.as_ref(), |f| f.to_rlp()),
            opt_to_rlp(self.last_committed.as_ref(), |f| f.to_rlp()),
            RlpValue::uint(self.current_height as u128),
            RlpValue::list(
                self.seen
                    .iter()
                    .flat_map(|(h, by_signer)| {
                        by_signer.iter().map(move |(s, hash)| {
                            RlpValue::list(vec![
                                RlpValue::uint(*h as u128),
                                RlpValue::bytes(s.as_bytes().to_vec()),
                                RlpValue::bytes(hash.to_vec()),
                            ])
                        })
                    })
                    .collect(),
            ),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(11)?;
        let mut precommits = BTreeMap::new();
        for pair in items[6].as_list()? {
            let pair = pair.as_list_of(2)?;
            precommits.insert(
                SignerId::new(pair[0].as_bytes()?.to_vec()),
                Signature(pair[1].as_bytes()?.to_vec()),
            );
        }
        let mut seen: BTreeMap<Height, BTreeMap<SignerId, [u8; 32]>> = BTreeMap::new();
        for entry in items[10].as_list()? {
            let entry = entry.as_list_of(3)?;
            let hash_bytes = entry[2].as_bytes()?;
            if hash_bytes.len() != 32 {
                return Err(CodecError::ExpectedBytes);
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(hash_bytes);
            seen.entry(entry[0].as_uint()? as Height)
                .or_default()
                .insert(SignerId::new(entry[1].as_bytes()?.to_vec()), hash);
        }
        Ok(Self {
            entity_id: EntityId::new(items[0].as_bytes()?.to_vec()),
            signer_id: SignerId::new(items[1].as_bytes()?.to_vec()),
            validators: ValidatorSet::from_rlp(&items[2])?,
            state: EntityState::from_rlp(&items[3])?,
            mempool: items[4]
                .as_list()?
                .iter()
                .map(EntityTx::from_rlp)
                .collect::<Result<_, _>>()?,
            proposal: opt_from_rlp(&items[5], EntityFrame::from_rlp)?,
            precommits,
            locked_frame: opt_from_rlp(&items[7], EntityFrame::from_rlp)?,
            last_committed: opt_from_rlp(&items[8], EntityFrame::from_rlp)?,
            current_height: items[9].as_uint()? as Height,
            seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::ValidatorInfo;
    use xln_core::{AccountTx, HashSigner, TokenId};

    const NOW: Timestamp = 1_700_000_000;

    fn validators(n: usize) -> (ValidatorSet, Vec<SignerId>) {
        let mut vs = ValidatorSet::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = SignerId::new(vec![b'v', i as u8]);
            vs.add(ValidatorInfo {
                signer_id: id.clone(),
                voting_power: 1,
            });
            ids.push(id);
        }
        (vs, ids)
    }

    fn chat(from: &SignerId, nonce: u64, message: &str) -> EntityTx {
        EntityTx {
            from: from.clone(),
            nonce,
            kind: EntityTxKind::Chat {
                message: message.into(),
            },
        }
    }

    fn group(n: usize) -> (Vec<EntityReplica>, Vec<SignerId>) {
        let (vs, ids) = validators(n);
        let entity = EntityId::new(*b"ent-1");
        let replicas = ids
            .iter()
            .map(|id| EntityReplica::new(entity.clone(), id.clone(), vs.clone()))
            .collect();
        (replicas, ids)
    }

    /// Run one height to commitment across all replicas and return the
    /// commit frame.
    fn run_height(replicas: &mut [EntityReplica], txs: Vec<EntityTx>) -> EntityFrame {
        for tx in txs {
            replicas[0].add_tx(tx).unwrap();
        }
        let proposal = match replicas[0].propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("expected proposal, got {other:?}"),
        };

        let mut precommits = Vec::new();
        for replica in replicas.iter_mut().skip(1) {
            let out = replica.handle_proposal(&proposal, &HashSigner).unwrap();
            match out.message {
                Some(EntityMessage::Precommit {
                    height,
                    frame_hash,
                    signer,
                    signature,
                }) => precommits.push((height, frame_hash, signer, signature)),
                other => panic!("expected precommit, got {other:?}"),
            }
        }

        let mut commit = None;
        for (height, frame_hash, signer, signature) in precommits {
            let out = replicas[0]
                .collect_precommit(height, frame_hash, &signer, &signature, &HashSigner)
                .unwrap();
            if let Some(EntityMessage::Commit { frame }) = out.message {
                commit = Some(frame);
                break;
            }
        }
        let commit = commit.expect("quorum commit");
        for replica in replicas.iter_mut().skip(1) {
            replica.handle_commit(&commit, &HashSigner).unwrap();
        }
        commit
    }

    #[test]
    fn three_validators_commit_with_two_precommits() {
        let (mut replicas, ids) = group(3);
        let commit = run_height(&mut replicas, vec![chat(&ids[0], 0, "hello")]);

        // Proposer + one precommit = 2 of 3 power, exactly the quorum.
        assert!(commit.signatures.len() >= 2);
        for r in &replicas {
            assert_eq!(r.current_height, 1);
            assert_eq!(r.state.messages, vec!["hello".to_string()]);
            assert!(r.proposal.is_none());
            assert!(r.locked_frame.is_none());
        }
        // Identical state hashes across the group.
        let h0 = replicas[0].state_hash();
        assert!(replicas.iter().all(|r| r.state_hash() == h0));
    }

    #[test]
    fn single_precommit_is_not_quorum() {
        let (mut replicas, ids) = group(3);
        replicas[0].add_tx(chat(&ids[0], 0, "gm")).unwrap();
        let proposal = match replicas[0].propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("unexpected {other:?}"),
        };
        // Proposer's own signature alone: power 1 < quorum 2.
        assert_eq!(replicas[0].current_height, 0);

        let out = replicas[1].handle_proposal(&proposal, &HashSigner).unwrap();
        let (height, frame_hash, signer, signature) = match out.message {
            Some(EntityMessage::Precommit {
                height,
                frame_hash,
                signer,
                signature,
            }) => (height, frame_hash, signer, signature),
            other => panic!("unexpected {other:?}"),
        };
        let out = replicas[0]
            .collect_precommit(height, frame_hash, &signer, &signature, &HashSigner)
            .unwrap();
        assert!(matches!(out.message, Some(EntityMessage::Commit { .. })));
        assert_eq!(replicas[0].current_height, 1);
    }

    #[test]
    fn commit_without_quorum_rejected() {
        let (mut replicas, ids) = group(3);
        replicas[0].add_tx(chat(&ids[0], 0, "gm")).unwrap();
        let mut frame = match replicas[0].propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("unexpected {other:?}"),
        };
        // Only the proposer's signature: 1 of 3 power.
        frame.signatures.retain(|s, _| *s == ids[0]);
        let err = replicas[1].handle_commit(&frame, &HashSigner).unwrap_err();
        assert_eq!(err, XlnError::QuorumNotReached { have: 1, need: 2 });
        assert_eq!(replicas[1].current_height, 0);
    }

    #[test]
    fn conflicting_proposal_is_double_sign_evidence() {
        let (mut replicas, ids) = group(3);
        replicas[0].add_tx(chat(&ids[0], 0, "one")).unwrap();
        let proposal = match replicas[0].propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("unexpected {other:?}"),
        };
        replicas[1].handle_proposal(&proposal, &HashSigner).unwrap();

        // The proposer equivocates: a different frame at the same height.
        let mut conflicting = proposal.clone();
        conflicting.txs = vec![chat(&ids[0], 0, "two")];
        let hash = conflicting.frame_hash();
        conflicting.signatures.clear();
        conflicting
            .signatures
            .insert(ids[0].clone(), HashSigner.sign(&ids[0], &hash).unwrap());

        let out = replicas[1]
            .handle_proposal(&conflicting, &HashSigner)
            .unwrap();
        assert!(out.message.is_none(), "no precommit for an equivocation");
        assert_eq!(out.evidence.len(), 1);
        let ev = &out.evidence[0];
        assert_eq!(ev.signer, ids[0]);
        assert_eq!(ev.height, 1);
        assert_ne!(ev.first, ev.second);
        // Still locked on the first frame.
        assert_eq!(
            replicas[1].locked_frame.as_ref().unwrap().frame_hash(),
            proposal.frame_hash()
        );
    }

    #[test]
    fn stale_nonce_tx_rejected_on_reexecution() {
        let (mut replicas, ids) = group(3);
        run_height(&mut replicas, vec![chat(&ids[0], 0, "first")]);

        // A frame replaying nonce 0 must fail every validator's re-execution.
        let mut frame = EntityFrame {
            height: 2,
            prev_frame_hash: replicas[1].prev_hash(),
            txs: vec![chat(&ids[0], 0, "replayed")],
            timestamp: NOW,
            signatures: BTreeMap::new(),
        };
        let hash = frame.frame_hash();
        frame
            .signatures
            .insert(ids[0].clone(), HashSigner.sign(&ids[0], &hash).unwrap());
        let err = replicas[1].handle_proposal(&frame, &HashSigner).unwrap_err();
        assert_eq!(err, XlnError::ReplayCounter { expected: 1, got: 0 });
    }

    #[test]
    fn reserves_credit_and_debit() {
        let (mut replicas, ids) = group(3);
        let token = TokenId::number(7);
        run_height(
            &mut replicas,
            vec![EntityTx {
                from: ids[0].clone(),
                nonce: 0,
                kind: EntityTxKind::ReserveCredit {
                    token_id: token.clone(),
                    amount: 500,
                },
            }],
        );
        assert_eq!(replicas[2].state.reserves[&token], 500);

        run_height(
            &mut replicas,
            vec![EntityTx {
                from: ids[0].clone(),
                nonce: 1,
                kind: EntityTxKind::ReserveDebit {
                    token_id: token.clone(),
                    amount: 500,
                },
            }],
        );
        // Fully debited entries disappear from the canonical state.
        assert!(replicas[2].state.reserves.get(&token).is_none());
    }

    #[test]
    fn change_proposer_requires_known_validator() {
        let (mut replicas, ids) = group(3);
        assert!(replicas[0]
            .change_proposer(SignerId::new(*b"nobody"))
            .is_err());
        replicas[0].change_proposer(ids[1].clone()).unwrap();
        assert!(!replicas[0].is_proposer());
        assert_eq!(
            replicas[0].propose(&HashSigner, NOW).unwrap_err(),
            XlnError::NotProposer
        );
    }

    #[test]
    fn replica_rlp_round_trip() {
        let (mut replicas, ids) = group(3);
        run_height(&mut replicas, vec![chat(&ids[0], 0, "persisted")]);
        replicas[0].add_tx(chat(&ids[0], 1, "queued")).unwrap();
        let restored = EntityReplica::from_rlp(&replicas[0].to_rlp()).unwrap();
        assert_eq!(restored, replicas[0]);
    }

    // ── Two entities joined by their account machines ────────────────────────

    fn single_validator_entity(name: &[u8]) -> (EntityReplica, SignerId) {
        let mut vs = ValidatorSet::new();
        // The entity signs bilateral frames under its own id.
        let signer = SignerId::new(name.to_vec());
        vs.add(ValidatorInfo {
            signer_id: signer.clone(),
            voting_power: 1,
        });
        (
            EntityReplica::new(EntityId::new(name.to_vec()), signer.clone(), vs),
            signer,
        )
    }

    /// Commit one entity tx on a single-validator entity and return the
    /// account messages it produced.
    fn commit_one(replica: &mut EntityReplica, tx: EntityTx) -> Vec<AccountInput> {
        replica.add_tx(tx).unwrap();
        let frame = match replica.propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("unexpected {other:?}"),
        };
        let hash = frame.frame_hash();
        let own_sig = frame.signatures[&replica.signer_id.clone()].clone();
        let signer_id = replica.signer_id.clone();
        let out = replica
            .collect_precommit(frame.height, hash, &signer_id, &own_sig, &HashSigner)
            .unwrap();
        assert!(matches!(out.message, Some(EntityMessage::Commit { .. })));
        out.account_messages
    }

    #[test]
    fn entity_frames_drive_bilateral_payment() {
        let (mut alice, alice_signer) = single_validator_entity(b"alice");
        let (mut bob, bob_signer) = single_validator_entity(b"bob");
        let token = TokenId::number(1);

        // Alice provisions the account, producing the height-1 frame.
        let msgs = commit_one(
            &mut alice,
            EntityTx {
                from: alice_signer.clone(),
                nonce: 0,
                kind: EntityTxKind::AccountRequest {
                    counterparty: bob.entity_id.clone(),
                    tx: AccountTx::SetCollateral {
                        token_id: token.clone(),
                        amount: 1000,
                    },
                },
            },
        );
        assert_eq!(msgs.len(), 1);

        // Bob applies the frame and answers with an ACK.
        let acks = commit_one(
            &mut bob,
            EntityTx {
                from: bob_signer.clone(),
                nonce: 0,
                kind: EntityTxKind::AccountUpdate {
                    input: msgs[0].clone(),
                },
            },
        );
        assert_eq!(acks.len(), 1);

        // Alice commits on the ACK, then pays.
        let out = commit_one(
            &mut alice,
            EntityTx {
                from: alice_signer.clone(),
                nonce: 1,
                kind: EntityTxKind::AccountUpdate {
                    input: acks[0].clone(),
                },
            },
        );
        assert!(out.is_empty());

        let pay_msgs = commit_one(
            &mut alice,
            EntityTx {
                from: alice_signer.clone(),
                nonce: 2,
                kind: EntityTxKind::AccountRequest {
                    counterparty: bob.entity_id.clone(),
                    tx: AccountTx::Payment {
                        token_id: token.clone(),
                        amount: 100,
                    },
                },
            },
        );
        let acks = commit_one(
            &mut bob,
            EntityTx {
                from: bob_signer.clone(),
                nonce: 1,
                kind: EntityTxKind::AccountUpdate {
                    input: pay_msgs[0].clone(),
                },
            },
        );
        commit_one(
            &mut alice,
            EntityTx {
                from: alice_signer,
                nonce: 3,
                kind: EntityTxKind::AccountUpdate {
                    input: acks[0].clone(),
                },
            },
        );

        let a_machine = &alice.state.accounts[&bob.entity_id];
        let b_machine = &bob.state.accounts[&alice.entity_id];
        assert_eq!(a_machine.current_height, 2);
        assert_eq!(b_machine.current_height, 2);
        assert_eq!(a_machine.state.ledger.get(&token).unwrap().net(), -100);
        assert_eq!(b_machine.state.ledger.get(&token).unwrap().net(), -100);
    }
}
