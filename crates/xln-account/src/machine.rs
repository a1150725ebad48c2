//! The bilateral account state machine.
//!
//! Two entities agree on a chain of [`AccountFrame`]s with exactly-once,
//! ordered, replay-safe semantics. The machine is a pure transition function:
//! `(state, input) → (state', outputs)`. It never reads a clock; frame
//! timestamps come from the surrounding host and are carried, not branched
//! on, except by subcontract timeouts which use them deterministically.
//!
//! Canonical orientation: between entities A and B, `left = min(A, B)` by
//! lexicographic order. The left side wins the simultaneous-proposal
//! tiebreak; the right side rolls back and re-queues its transactions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};
use xln_crypto::{CodecError, RlpValue};

use xln_core::frame::{opt_from_rlp, opt_to_rlp};
use xln_core::{
    AccountFrame, AccountInput, AccountTx, Amount, Delta, EntityId, Height, PrevHash, Signature,
    Signer, SignerId, Timestamp, TokenId, TokenLedger, XlnError, FRAME_HISTORY_LIMIT,
    MAX_FRAME_BYTES, MAX_FRAME_TXS, MEMPOOL_LIMIT,
};

use crate::subcontract::{DeltaTransformer, Htlc};

// ── ForwardInstruction ───────────────────────────────────────────────────────

/// Next-hop handoff for an in-flight multi-hop payment. Carries ids only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInstruction {
    pub subcontract_id: Vec<u8>,
    pub next_hop: EntityId,
    pub token_id: TokenId,
    pub amount: u128,
    pub hash_lock: [u8; 32],
    pub timeout: Timestamp,
}

impl ForwardInstruction {
    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.subcontract_id.clone()),
            RlpValue::bytes(self.next_hop.as_bytes().to_vec()),
            RlpValue::bytes(self.token_id.as_bytes().to_vec()),
            RlpValue::uint(self.amount),
            RlpValue::bytes(self.hash_lock.to_vec()),
            RlpValue::int(self.timeout as i128),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(6)?;
        let hash_bytes = items[4].as_bytes()?;
        if hash_bytes.len() != 32 {
            return Err(CodecError::ExpectedBytes);
        }
        let mut hash_lock = [0u8; 32];
        hash_lock.copy_from_slice(hash_bytes);
        Ok(Self {
            subcontract_id: items[0].as_bytes()?.to_vec(),
            next_hop: EntityId::new(items[1].as_bytes()?.to_vec()),
            token_id: TokenId::new(items[2].as_bytes()?.to_vec()),
            amount: items[3].as_uint()?,
            hash_lock,
            timeout: items[5].as_int()? as Timestamp,
        })
    }
}

// ── AccountState ─────────────────────────────────────────────────────────────

/// The replicated substance of a bilateral account: per-token deltas plus
/// attached subcontracts. Cloned, mutated, and swapped in atomically by the
/// machine; never mutated in place by a half-applied frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub left: EntityId,
    pub right: EntityId,
    pub ledger: TokenLedger,
    pub subcontracts: BTreeMap<Vec<u8>, Htlc>,
}

impl AccountState {
    pub fn new(a: &EntityId, b: &EntityId) -> Self {
        let (left, right) = if a.is_left_of(b) {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        Self {
            left,
            right,
            ledger: TokenLedger::new(),
            subcontracts: BTreeMap::new(),
        }
    }

    /// Apply one transaction authored by `proposer`.
    pub fn apply_tx(
        &mut self,
        tx: &AccountTx,
        proposer: &EntityId,
        frame_ts: Timestamp,
    ) -> Result<(), XlnError> {
        let proposer_is_left = *proposer == self.left;
        match tx {
            AccountTx::Payment { token_id, amount } => {
                if *amount == 0 {
                    return Err(XlnError::ZeroAmount);
                }
                let change = if proposer_is_left {
                    -(*amount as Amount)
                } else {
                    *amount as Amount
                };
                // Reserved allowances must stay spendable for their
                // subcontracts, so payments check the allowance-adjusted
                // headroom first. Untracked tokens stay permissionless.
                if let Some(d) = self.ledger.get(token_id) {
                    if d.max_send(proposer_is_left) < *amount as Amount {
                        let (lower, upper) = d.bounds();
                        return Err(XlnError::RcpanViolation {
                            token: token_id.clone(),
                            current: d.net(),
                            change,
                            proposed: d.net() + change,
                            lower,
                            upper,
                        });
                    }
                }
                self.ledger.update_delta(token_id, change)?;
                Ok(())
            }

            AccountTx::SetCollateral { token_id, amount } => {
                self.ledger.set_collateral(token_id, *amount as Amount)
            }

            AccountTx::SetCreditLimit { token_id, amount } => {
                // A side may only set the credit it extends to the other.
                if proposer_is_left {
                    self.ledger.set_credit_left(token_id, *amount as Amount)
                } else {
                    self.ledger.set_credit_right(token_id, *amount as Amount)
                }
            }

            AccountTx::HtlcLock {
                id,
                token_id,
                amount,
                hash_lock,
                timeout,
                next_hop,
            } => {
                if *amount == 0 {
                    return Err(XlnError::ZeroAmount);
                }
                if self.subcontracts.contains_key(id) {
                    return Err(XlnError::MalformedMessage(format!(
                        "duplicate subcontract id {}",
                        hex::encode(id)
                    )));
                }
                self.ledger
                    .add_allowance(token_id, proposer_is_left, *amount as Amount)?;
                let receiver = if proposer_is_left {
                    self.right.clone()
                } else {
                    self.left.clone()
                };
                self.subcontracts.insert(
                    id.clone(),
                    Htlc {
                        id: id.clone(),
                        token_id: token_id.clone(),
                        amount: *amount,
                        hash_lock: *hash_lock,
                        timeout: *timeout,
                        sender: proposer.clone(),
                        receiver,
                        revealed_preimage: None,
                        claimed: false,
                        refunded: false,
                        settled: false,
                        next_hop: next_hop.clone(),
                    },
                );
                Ok(())
            }

            AccountTx::HtlcClaim { id, preimage } => {
                let htlc = self
                    .subcontracts
                    .get_mut(id)
                    .ok_or_else(|| XlnError::SubcontractNotFound(hex::encode(id)))?;
                if htlc.receiver != *proposer {
                    return Err(XlnError::MalformedMessage(
                        "only the receiver may claim".into(),
                    ));
                }
                htlc.claim(preimage, frame_ts)
            }

            AccountTx::HtlcRefund { id } => {
                let htlc = self
                    .subcontracts
                    .get_mut(id)
                    .ok_or_else(|| XlnError::SubcontractNotFound(hex::encode(id)))?;
                if htlc.sender != *proposer {
                    return Err(XlnError::MalformedMessage(
                        "only the sender may refund".into(),
                    ));
                }
                htlc.refund(frame_ts)
            }
        }
    }

    /// Evaluate subcontracts in id order; resolved ones contribute their
    /// delta changes exactly once and release their allowance.
    pub fn run_transformers(&mut self) -> Result<(), XlnError> {
        let ids: Vec<Vec<u8>> = self.subcontracts.keys().cloned().collect();
        for id in ids {
            let (changes, token_id, sender_is_left, amount) = {
                let htlc = match self.subcontracts.get(&id) {
                    Some(h) => h,
                    None => continue,
                };
                if !htlc.condition(self) {
                    continue;
                }
                (
                    htlc.apply(self),
                    htlc.token_id.clone(),
                    htlc.sender_is_left(&self.left),
                    htlc.amount as Amount,
                )
            };
            self.ledger
                .release_allowance(&token_id, sender_is_left, amount);
            for change in &changes {
                self.ledger.update_delta(&change.token_id, change.change)?;
            }
            if let Some(htlc) = self.subcontracts.get_mut(&id) {
                htlc.settled = true;
            }
        }
        Ok(())
    }

    /// The filtered canonical summary both sides must reproduce byte-exactly:
    /// tokens in sorted order, minus those with zero net and zero limits.
    pub fn canonical_summary(&self) -> (Vec<TokenId>, Vec<Amount>) {
        let mut token_ids = Vec::new();
        let mut deltas = Vec::new();
        for (token, delta) in self.ledger.iter() {
            if delta.is_droppable() {
                continue;
            }
            token_ids.push(token.clone());
            deltas.push(delta.net());
        }
        (token_ids, deltas)
    }

    /// Full per-token states for the given canonical token list.
    pub fn full_states(&self, token_ids: &[TokenId]) -> Vec<Delta> {
        token_ids
            .iter()
            .filter_map(|t| self.ledger.get(t).cloned())
            .collect()
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.left.as_bytes().to_vec()),
            RlpValue::bytes(self.right.as_bytes().to_vec()),
            RlpValue::list(self.ledger.iter().map(|(_, d)| d.to_rlp()).collect()),
            RlpValue::list(self.subcontracts.values().map(|h| h.to_rlp()).collect()),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(4)?;
        let mut ledger = TokenLedger::new();
        for d in items[2].as_list()? {
            ledger.insert_delta(Delta::from_rlp(d)?);
        }
        let mut subcontracts = BTreeMap::new();
        for h in items[3].as_list()? {
            let htlc = Htlc::from_rlp(h)?;
            subcontracts.insert(htlc.id.clone(), htlc);
        }
        Ok(Self {
            left: EntityId::new(items[0].as_bytes()?.to_vec()),
            right: EntityId::new(items[1].as_bytes()?.to_vec()),
            ledger,
            subcontracts,
        })
    }
}

// ── Proof caches ─────────────────────────────────────────────────────────────

/// Header of the dispute proof both sides keep current at every commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofHeader {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub cooperative_nonce: u64,
    pub dispute_nonce: u64,
}

impl ProofHeader {
    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.from_entity.as_bytes().to_vec()),
            RlpValue::bytes(self.to_entity.as_bytes().to_vec()),
            RlpValue::uint(self.cooperative_nonce as u128),
            RlpValue::uint(self.dispute_nonce as u128),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(4)?;
        Ok(Self {
            from_entity: EntityId::new(items[0].as_bytes()?.to_vec()),
            to_entity: EntityId::new(items[1].as_bytes()?.to_vec()),
            cooperative_nonce: items[2].as_uint()? as u64,
            dispute_nonce: items[3].as_uint()? as u64,
        })
    }
}

/// Body of the dispute proof: the canonical token summary at the last commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBody {
    pub token_ids: Vec<TokenId>,
    pub deltas: Vec<Amount>,
}

impl ProofBody {
    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::list(
                self.token_ids
                    .iter()
                    .map(|t| RlpValue::bytes(t.as_bytes().to_vec()))
                    .collect(),
            ),
            RlpValue::list(self.deltas.iter().map(|d| RlpValue::int(*d)).collect()),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(2)?;
        Ok(Self {
            token_ids: items[0]
                .as_list()?
                .iter()
                .map(|v| Ok(TokenId::new(v.as_bytes()?.to_vec())))
                .collect::<Result<_, CodecError>>()?,
            deltas: items[1]
                .as_list()?
                .iter()
                .map(|v| v.as_int())
                .collect::<Result<_, _>>()?,
        })
    }
}

// ── Outputs ──────────────────────────────────────────────────────────────────

/// What a receive transition hands back to the host: at most one wire
/// message, and at most one multi-hop forward instruction.
#[derive(Debug, Default)]
pub struct AccountOutputs {
    pub message: Option<AccountInput>,
    pub forward: Option<ForwardInstruction>,
}

// ── AccountMachine ───────────────────────────────────────────────────────────

/// One entity's half of a bilateral account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountMachine {
    pub entity_id: EntityId,
    pub counterparty: EntityId,
    pub mempool: VecDeque<AccountTx>,
    pub state: AccountState,
    /// Last committed frame; `None` until height 1 commits (height 0 is the
    /// implicit genesis).
    pub current_frame: Option<AccountFrame>,
    /// Proposed frame awaiting the counterparty's ACK.
    pub pending_frame: Option<AccountFrame>,
    /// Post-state of the pending frame, swapped in when the ACK arrives.
    pub pending_state: Option<AccountState>,
    pub frame_history: VecDeque<AccountFrame>,
    /// Supplementary cap on the absolute flow position per token.
    pub global_credit_limits: BTreeMap<TokenId, Amount>,
    pub current_height: Height,
    pub proof_header: ProofHeader,
    pub proof_body: ProofBody,
    pub send_counter: u64,
    pub receive_counter: u64,
    /// Transactions in flight inside the pending frame.
    pub sent_transitions: u64,
    /// Inbound messages accepted; the replay check compares against this.
    pub acked_transitions: u64,
    /// 0 or 1. Two rollbacks without an intervening commit are fatal.
    pub rollback_count: u8,
    pub pending_forward: Option<ForwardInstruction>,
}

impl AccountMachine {
    pub fn new(entity_id: EntityId, counterparty: EntityId) -> Self {
        let state = AccountState::new(&entity_id, &counterparty);
        let proof_header = ProofHeader {
            from_entity: entity_id.clone(),
            to_entity: counterparty.clone(),
            cooperative_nonce: 0,
            dispute_nonce: 0,
        };
        Self {
            entity_id,
            counterparty,
            mempool: VecDeque::new(),
            state,
            current_frame: None,
            pending_frame: None,
            pending_state: None,
            frame_history: VecDeque::new(),
            global_credit_limits: BTreeMap::new(),
            current_height: 0,
            proof_header,
            proof_body: ProofBody::default(),
            send_counter: 0,
            receive_counter: 0,
            sent_transitions: 0,
            acked_transitions: 0,
            rollback_count: 0,
            pending_forward: None,
        }
    }

    pub fn is_left(&self) -> bool {
        self.entity_id.is_left_of(&self.counterparty)
    }

    fn our_signer(&self) -> SignerId {
        SignerId::new(self.entity_id.as_bytes().to_vec())
    }

    fn their_signer(&self) -> SignerId {
        SignerId::new(self.counterparty.as_bytes().to_vec())
    }

    fn local_prev_hash(&self) -> PrevHash {
        match &self.current_frame {
            Some(f) => PrevHash::Hash(f.state_hash),
            None => PrevHash::Genesis,
        }
    }

    /// Queue a transaction, pre-validating it against the current state plus
    /// everything already queued. Invalid transactions never enter the
    /// mempool.
    pub fn add_to_mempool(&mut self, tx: AccountTx, now: Timestamp) -> Result<(), XlnError> {
        if self.mempool.len() >= MEMPOOL_LIMIT {
            return Err(XlnError::MempoolFull {
                limit: MEMPOOL_LIMIT,
            });
        }
        let mut probe = self.state.clone();
        for queued in &self.mempool {
            // Already validated at queue time; a failure here means earlier
            // txs consumed capacity, which the propose path handles.
            let _ = probe.apply_tx(queued, &self.entity_id, now);
        }
        probe.apply_tx(&tx, &self.entity_id, now)?;
        self.mempool.push_back(tx);
        Ok(())
    }

    // ── Propose ──────────────────────────────────────────────────────────────

    /// Drain the mempool into a new frame proposal. Returns `None` when there
    /// is nothing to propose or a frame is already in flight.
    pub fn propose(
        &mut self,
        signer: &dyn Signer,
        now: Timestamp,
    ) -> Result<Option<AccountInput>, XlnError> {
        if self.pending_frame.is_some() || self.mempool.is_empty() {
            return Ok(None);
        }
        let queued: Vec<AccountTx> = self.mempool.iter().cloned().collect();
        match self.build_frame(queued, signer, now)? {
            Some((frame, post_state, signature)) => {
                self.mempool.clear();
                self.sent_transitions = frame.account_txs.len() as u64;
                self.pending_frame = Some(frame.clone());
                self.pending_state = Some(post_state);
                self.send_counter += 1;
                debug!(
                    height = frame.height,
                    txs = frame.account_txs.len(),
                    counterparty = %self.counterparty,
                    "proposed account frame"
                );
                Ok(Some(AccountInput {
                    from_entity: self.entity_id.clone(),
                    to_entity: self.counterparty.clone(),
                    height: frame.height,
                    counter: self.send_counter,
                    new_account_frame: Some(frame),
                    new_signatures: vec![signature],
                    prev_signatures: vec![],
                }))
            }
            None => {
                // Every queued tx was stale against the committed state.
                self.mempool.clear();
                Ok(None)
            }
        }
    }

    /// Apply transactions to a clone of the current state and assemble a
    /// sealed, signed frame. Queued transactions that fail against the
    /// current state are dropped (they never reach the wire).
    fn build_frame(
        &self,
        txs: Vec<AccountTx>,
        signer: &dyn Signer,
        now: Timestamp,
    ) -> Result<Option<(AccountFrame, AccountState, Signature)>, XlnError> {
        let mut post = self.state.clone();
        let mut applied = Vec::with_capacity(txs.len());
        for tx in txs {
            let mut probe = post.clone();
            match probe.apply_tx(&tx, &self.entity_id, now) {
                Ok(()) => {
                    post = probe;
                    applied.push(tx);
                }
                Err(e) => warn!(error = %e, "dropping queued tx that no longer applies"),
            }
        }
        if applied.is_empty() {
            return Ok(None);
        }
        post.run_transformers()?;
        self.check_global_limits(&post)?;

        let (token_ids, deltas) = post.canonical_summary();
        let full_delta_states = post.full_states(&token_ids);
        let mut frame = AccountFrame {
            height: self.current_height + 1,
            timestamp: now,
            prev_frame_hash: self.local_prev_hash(),
            account_txs: applied,
            token_ids,
            deltas,
            full_delta_states,
            state_hash: [0u8; 32],
            signatures: vec![],
        };
        frame.seal();
        if frame.account_txs.len() > MAX_FRAME_TXS {
            return Err(XlnError::TooManyFrameTxs {
                count: frame.account_txs.len(),
                max: MAX_FRAME_TXS,
            });
        }
        let size = frame.encoded_size();
        if size > MAX_FRAME_BYTES {
            return Err(XlnError::FrameTooLarge {
                size,
                max: MAX_FRAME_BYTES,
            });
        }
        let signature = signer.sign(&self.our_signer(), &frame.state_hash)?;
        Ok(Some((frame, post, signature)))
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Process one inbound [`AccountInput`]: replay check, ACK handling,
    /// simultaneous-proposal tiebreak, frame verification, commit, and the
    /// batched ACK+propose response.
    pub fn receive(
        &mut self,
        input: &AccountInput,
        signer: &dyn Signer,
        now: Timestamp,
    ) -> Result<AccountOutputs, XlnError> {
        self.receive_counter += 1;
        if input.counter != self.acked_transitions + 1 {
            return Err(XlnError::ReplayCounter {
                expected: self.acked_transitions + 1,
                got: input.counter,
            });
        }
        self.acked_transitions += 1;

        let mut outputs = AccountOutputs::default();

        // ── ACK of our pending frame ─────────────────────────────────────────
        if !input.prev_signatures.is_empty() {
            let pending = self
                .pending_frame
                .as_ref()
                .ok_or_else(|| XlnError::MalformedMessage("ack without pending frame".into()))?;
            let their_sig = &input.prev_signatures[0];
            if !signer.verify(&self.their_signer(), &pending.state_hash, their_sig) {
                return Err(XlnError::BadSignature {
                    signer: self.counterparty.to_string(),
                });
            }
            if let (Some(mut frame), Some(state)) =
                (self.pending_frame.take(), self.pending_state.take())
            {
                let our_sig = signer.sign(&self.our_signer(), &frame.state_hash)?;
                frame.signatures = if self.is_left() {
                    vec![our_sig, their_sig.clone()]
                } else {
                    vec![their_sig.clone(), our_sig]
                };
                info!(height = frame.height, counterparty = %self.counterparty, "frame acked");
                self.commit(frame, state);
                self.sent_transitions = 0;
                if self.rollback_count > 0 {
                    self.rollback_count -= 1;
                }
            }
        }

        // ── New frame (possibly batched behind the ACK) ──────────────────────
        let frame = match &input.new_account_frame {
            Some(f) => f,
            None => return Ok(outputs),
        };

        // Simultaneous proposals at the same height: left keeps its frame and
        // stays silent; right rolls back and accepts.
        if let Some(pending) = &self.pending_frame {
            if frame.height == pending.height {
                if self.is_left() {
                    debug!(height = frame.height, "simultaneous proposal: left side holds");
                    return Ok(outputs);
                }
                if self.rollback_count >= 1 {
                    return Err(XlnError::DoubleRollback);
                }
                self.rollback_count += 1;
                if let Some(rolled) = self.pending_frame.take() {
                    self.pending_state = None;
                    self.sent_transitions = 0;
                    for tx in rolled.account_txs.into_iter().rev() {
                        self.mempool.push_front(tx);
                    }
                }
                info!(
                    height = frame.height,
                    "simultaneous proposal: rolled back, txs restored to mempool head"
                );
            }
        }

        self.verify_frame(frame, &input.new_signatures, signer)?;

        // Independent re-execution must reproduce the proposer's summary.
        let mut post = self.state.clone();
        for tx in &frame.account_txs {
            post.apply_tx(tx, &self.counterparty, frame.timestamp)?;
        }
        post.run_transformers()?;
        self.check_global_limits(&post)?;
        let (token_ids, deltas) = post.canonical_summary();
        if token_ids != frame.token_ids || deltas != frame.deltas {
            return Err(XlnError::StateDivergence {
                height: frame.height,
                ours: hex::encode(xln_crypto::keccak256(&summary_bytes(&token_ids, &deltas))),
                theirs: hex::encode(xln_crypto::keccak256(&summary_bytes(
                    &frame.token_ids,
                    &frame.deltas,
                ))),
            });
        }
        if post.full_states(&token_ids) != frame.full_delta_states {
            return Err(XlnError::StateDivergence {
                height: frame.height,
                ours: "full delta states".into(),
                theirs: "diverged".into(),
            });
        }

        // Commit the counterparty's frame with both signatures attached.
        let their_sig = input.new_signatures[0].clone();
        let our_ack = signer.sign(&self.our_signer(), &frame.state_hash)?;
        let mut committed = frame.clone();
        committed.signatures = if self.is_left() {
            vec![our_ack.clone(), their_sig]
        } else {
            vec![their_sig, our_ack.clone()]
        };
        let height = committed.height;
        self.commit(committed, post);
        info!(height, counterparty = %self.counterparty, "committed counterparty frame");

        // Surface multi-hop forwards for locks routed through us.
        if let Some(forward) = self.extract_forward(frame) {
            self.pending_forward = Some(forward.clone());
            outputs.forward = Some(forward);
        }

        // ACK, with a bundled counter-proposal when we have queued work.
        self.send_counter += 1;
        let mut response = AccountInput {
            from_entity: self.entity_id.clone(),
            to_entity: self.counterparty.clone(),
            height,
            counter: self.send_counter,
            new_account_frame: None,
            new_signatures: vec![],
            prev_signatures: vec![our_ack],
        };
        if !self.mempool.is_empty() && self.pending_frame.is_none() {
            let queued: Vec<AccountTx> = self.mempool.iter().cloned().collect();
            if let Some((new_frame, post_state, signature)) =
                self.build_frame(queued, signer, now)?
            {
                self.mempool.clear();
                self.sent_transitions = new_frame.account_txs.len() as u64;
                self.pending_frame = Some(new_frame.clone());
                self.pending_state = Some(post_state);
                response.height = new_frame.height;
                response.new_account_frame = Some(new_frame);
                response.new_signatures = vec![signature];
            }
        }
        outputs.message = Some(response);
        Ok(outputs)
    }

    /// Stateless checks on an incoming frame: height, chain linkage, size,
    /// hash integrity, proposer signature.
    fn verify_frame(
        &self,
        frame: &AccountFrame,
        new_signatures: &[Signature],
        signer: &dyn Signer,
    ) -> Result<(), XlnError> {
        let expected_height = self.current_height + 1;
        if frame.height != expected_height {
            return Err(XlnError::WrongHeight {
                expected: expected_height,
                got: frame.height,
            });
        }
        let expected_prev = self.local_prev_hash();
        if frame.prev_frame_hash != expected_prev {
            return Err(XlnError::WrongPrevFrameHash {
                height: frame.height,
                expected: expected_prev.to_string(),
                got: frame.prev_frame_hash.to_string(),
            });
        }
        if frame.account_txs.len() > MAX_FRAME_TXS {
            return Err(XlnError::TooManyFrameTxs {
                count: frame.account_txs.len(),
                max: MAX_FRAME_TXS,
            });
        }
        let size = frame.encoded_size();
        if size > MAX_FRAME_BYTES {
            return Err(XlnError::FrameTooLarge {
                size,
                max: MAX_FRAME_BYTES,
            });
        }
        if frame.compute_state_hash() != frame.state_hash {
            return Err(XlnError::MalformedMessage(
                "frame state hash does not match its contents".into(),
            ));
        }
        let their_sig = new_signatures.first().ok_or_else(|| {
            XlnError::MalformedMessage("new frame without proposer signature".into())
        })?;
        if !signer.verify(&self.their_signer(), &frame.state_hash, their_sig) {
            return Err(XlnError::BadSignature {
                signer: self.counterparty.to_string(),
            });
        }
        Ok(())
    }

    fn check_global_limits(&self, state: &AccountState) -> Result<(), XlnError> {
        for (token, cap) in &self.global_credit_limits {
            if let Some(d) = state.ledger.get(token) {
                if d.position().abs() > *cap {
                    return Err(XlnError::RcpanViolation {
                        token: token.clone(),
                        current: d.net(),
                        change: 0,
                        proposed: d.net(),
                        lower: -*cap,
                        upper: *cap,
                    });
                }
            }
        }
        Ok(())
    }

    /// A lock routed onward (its `next_hop` set, and we are its receiver)
    /// yields a forward instruction for the host's routing layer.
    fn extract_forward(&self, frame: &AccountFrame) -> Option<ForwardInstruction> {
        for tx in &frame.account_txs {
            if let AccountTx::HtlcLock {
                id,
                token_id,
                amount,
                hash_lock,
                timeout,
                next_hop: Some(next_hop),
            } = tx
            {
                return Some(ForwardInstruction {
                    subcontract_id: id.clone(),
                    next_hop: next_hop.clone(),
                    token_id: token_id.clone(),
                    amount: *amount,
                    hash_lock: *hash_lock,
                    timeout: *timeout,
                });
            }
        }
        None
    }

    fn commit(&mut self, frame: AccountFrame, state: AccountState) {
        self.current_height = frame.height;
        self.state = state;
        self.frame_history.push_back(frame.clone());
        while self.frame_history.len() > FRAME_HISTORY_LIMIT {
            self.frame_history.pop_front();
        }
        self.current_frame = Some(frame);
        self.proof_header.cooperative_nonce += 1;
        let (token_ids, deltas) = self.state.canonical_summary();
        self.proof_body = ProofBody { token_ids, deltas };
    }

    /// Clear a delivered forward instruction.
    pub fn take_pending_forward(&mut self) -> Option<ForwardInstruction> {
        self.pending_forward.take()
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.entity_id.as_bytes().to_vec()),
            RlpValue::bytes(self.counterparty.as_bytes().to_vec()),
            RlpValue::list(self.mempool.iter().map(|t| t.to_rlp()).collect()),
            self.state.to_rlp(),
            opt_to_rlp(self.current_frame.as_ref(), |f| f.to_rlp()),
            opt_to_rlp(self.pending_frame.as_ref(), |f| f.to_rlp()),
            opt_to_rlp(self.pending_state.as_ref(), |s| s.to_rlp()),
            RlpValue::list(self.frame_history.iter().map(|f| f.to_rlp()).collect()),
            RlpValue::list(
                self.global_credit_limits
                    .iter()
                    .map(|(t, cap)| {
                        RlpValue::list(vec![
                            RlpValue::bytes(t.as_bytes().to_vec()),
                            RlpValue::int(*cap),
                        ])
                    })
                    .collect(),
            ),
            RlpValue::uint(self.current_height as u128),
            self.proof_header.to_rlp(),
            self.proof_body.to_rlp(),
            RlpValue::uint(self.send_counter as u128),
            RlpValue::uint(self.receive_counter as u128),
            RlpValue::uint(self.sent_transitions as u128),
            RlpValue::uint(self.acked_transitions as u128),
            RlpValue::uint(self.rollback_count as u128),
            opt_to_rlp(self.pending_forward.as_ref(), |f| f.to_rlp()),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(18)?;
        let mut global_credit_limits = BTreeMap::new();
        for pair in items[8].as_list()? {
            let pair = pair.as_list_of(2)?;
            global_credit_limits.insert(
                TokenId::new(pair[0].as_bytes()?.to_vec()),
                pair[1].as_int()?,
            );
        }
        Ok(Self {
            entity_id: EntityId::new(items[0].as_bytes()?.to_vec()),
            counterparty: EntityId::new(items[1].as_bytes()?.to_vec()),
            mempool: items[2]
                .as_list()?
                .iter()
                .map(AccountTx::from_rlp)
                .collect::<Result<_, _>>()?,
            state: AccountState::from_rlp(&items[3])?,
            current_frame: opt_from_rlp(&items[4], AccountFrame::from_rlp)?,
            pending_frame: opt_from_rlp(&items[5], AccountFrame::from_rlp)?,
            pending_state: opt_from_rlp(&items[6], AccountState::from_rlp)?,
            frame_history: items[7]
                .as_list()?
                .iter()
                .map(AccountFrame::from_rlp)
                .collect::<Result<_, _>>()?,
            global_credit_limits,
            current_height: items[9].as_uint()? as Height,
            proof_header: ProofHeader::from_rlp(&items[10])?,
            proof_body: ProofBody::from_rlp(&items[11])?,
            send_counter: items[12].as_uint()? as u64,
            receive_counter: items[13].as_uint()? as u64,
            sent_transitions: items[14].as_uint()? as u64,
            acked_transitions: items[15].as_uint()? as u64,
            rollback_count: items[16].as_uint()? as u8,
            pending_forward: opt_from_rlp(&items[17], ForwardInstruction::from_rlp)?,
        })
    }
}

fn summary_bytes(token_ids: &[TokenId], deltas: &[Amount]) -> Vec<u8> {
    xln_crypto::rlp_encode(&RlpValue::list(vec![
        RlpValue::list(
            token_ids
                .iter()
                .map(|t| RlpValue::bytes(t.as_bytes().to_vec()))
                .collect(),
        ),
        RlpValue::list(deltas.iter().map(|d| RlpValue::int(*d)).collect()),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use xln_crypto::sha256;
    use xln_core::HashSigner;

    const NOW: Timestamp = 1_700_000_000;

    fn token() -> TokenId {
        TokenId::number(1)
    }

    fn pay(amount: u128) -> AccountTx {
        AccountTx::Payment {
            token_id: token(),
            amount,
        }
    }

    /// Two machines for the alice/bob pair, both sides seeded with the same
    /// collateral so their states agree at height 0.
    fn seeded_pair(collateral: Amount) -> (AccountMachine, AccountMachine) {
        let alice = EntityId::new(*b"alice");
        let bob = EntityId::new(*b"bob");
        let mut a = AccountMachine::new(alice.clone(), bob.clone());
        let mut b = AccountMachine::new(bob, alice);
        for m in [&mut a, &mut b] {
            m.state.ledger.set_collateral(&token(), collateral).unwrap();
        }
        (a, b)
    }

    /// Drive one full propose → receive → ack exchange for `a`'s mempool.
    fn exchange(a: &mut AccountMachine, b: &mut AccountMachine, now: Timestamp) {
        let input = a.propose(&HashSigner, now).unwrap().expect("proposal");
        let out = b.receive(&input, &HashSigner, now).unwrap();
        let ack = out.message.expect("ack");
        a.receive(&ack, &HashSigner, now).unwrap();
    }

    // ── Simple bilateral payment ─────────────────────────────────────────────

    #[test]
    fn payment_commits_on_both_sides() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();

        let input = a.propose(&HashSigner, NOW).unwrap().expect("proposal");
        assert_eq!(input.height, 1);
        assert_eq!(input.counter, 1);
        let frame = input.new_account_frame.as_ref().expect("frame");
        assert_eq!(frame.token_ids, vec![token()]);
        assert_eq!(frame.deltas, vec![-100]);
        assert_eq!(frame.prev_frame_hash, PrevHash::Genesis);

        let out = b.receive(&input, &HashSigner, NOW).unwrap();
        let ack = out.message.expect("ack");
        assert!(!ack.prev_signatures.is_empty());
        assert!(ack.new_account_frame.is_none());

        a.receive(&ack, &HashSigner, NOW).unwrap();

        for m in [&a, &b] {
            assert_eq!(m.current_height, 1);
            let d = m.state.ledger.get(&token()).unwrap();
            assert_eq!(d.net(), -100);
            assert_eq!(d.position(), 100);
            assert!(d.validate_net(d.net()));
        }
        assert!(a.pending_frame.is_none());
        assert_eq!(a.sent_transitions, 0);
        assert_eq!(
            a.current_frame.as_ref().unwrap().state_hash,
            b.current_frame.as_ref().unwrap().state_hash
        );
        // Both signatures attached in canonical order on both copies.
        assert_eq!(a.current_frame.as_ref().unwrap().signatures.len(), 2);
        assert_eq!(
            a.current_frame.as_ref().unwrap().signatures,
            b.current_frame.as_ref().unwrap().signatures
        );
    }

    // ── Invariant rejection ──────────────────────────────────────────────────

    #[test]
    fn overdraft_rejected_at_submission() {
        let (mut a, _) = seeded_pair(100);
        let err = a.add_to_mempool(pay(500), NOW).unwrap_err();
        assert_eq!(
            err,
            XlnError::RcpanViolation {
                token: token(),
                current: 0,
                change: -500,
                proposed: -500,
                lower: 0,
                upper: 100,
            }
        );
        assert!(a.mempool.is_empty());
        assert_eq!(a.current_height, 0);
    }

    // ── Simultaneous proposals ───────────────────────────────────────────────

    #[test]
    fn simultaneous_proposals_left_wins_right_rolls_back() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(10), NOW).unwrap();
        b.add_to_mempool(pay(20), NOW).unwrap();

        let from_a = a.propose(&HashSigner, NOW).unwrap().expect("a frame");
        let from_b = b.propose(&HashSigner, NOW).unwrap().expect("b frame");
        let a_hash = from_a.new_account_frame.as_ref().unwrap().state_hash;

        // Left receives the conflicting frame: holds its own, stays silent.
        let out = a.receive(&from_b, &HashSigner, NOW).unwrap();
        assert!(out.message.is_none());
        assert!(a.pending_frame.is_some());
        assert_eq!(a.rollback_count, 0);

        // Right rolls back, re-queues, accepts, and ACKs (with its restored
        // tx bundled as the next proposal).
        let out = b.receive(&from_a, &HashSigner, NOW).unwrap();
        assert_eq!(b.rollback_count, 1);
        assert_eq!(b.current_height, 1);
        assert_eq!(b.current_frame.as_ref().unwrap().state_hash, a_hash);
        let reply = out.message.expect("ack");
        assert!(!reply.prev_signatures.is_empty());
        let bundled = reply.new_account_frame.as_ref().expect("re-proposal");
        assert_eq!(bundled.height, 2);
        assert_eq!(bundled.account_txs, vec![pay(20)]);

        // Left commits its own frame on the ACK, then B's re-proposal.
        let out = a.receive(&reply, &HashSigner, NOW).unwrap();
        assert_eq!(a.current_height, 2);
        assert_eq!(a.rollback_count, 0);
        assert_eq!(a.frame_history[0].state_hash, a_hash);

        // B commits its re-proposal on A's ACK, clearing the rollback mark.
        let ack = out.message.expect("ack");
        b.receive(&ack, &HashSigner, NOW).unwrap();
        assert_eq!(b.current_height, 2);
        assert_eq!(b.rollback_count, 0);
        assert_eq!(
            a.current_frame.as_ref().unwrap().state_hash,
            b.current_frame.as_ref().unwrap().state_hash
        );
    }

    #[test]
    fn second_rollback_without_commit_is_fatal() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(10), NOW).unwrap();
        b.add_to_mempool(pay(20), NOW).unwrap();
        let from_a = a.propose(&HashSigner, NOW).unwrap().unwrap();
        b.propose(&HashSigner, NOW).unwrap().unwrap();

        b.receive(&from_a, &HashSigner, NOW).unwrap();
        assert_eq!(b.rollback_count, 1);

        // A conflicting proposal against B's re-proposal before any ACK.
        let mut forged = from_a.clone();
        forged.counter = b.acked_transitions + 1;
        forged.height = 2;
        if let Some(f) = &mut forged.new_account_frame {
            f.height = 2;
        }
        let err = b.receive(&forged, &HashSigner, NOW).unwrap_err();
        assert_eq!(err, XlnError::DoubleRollback);
    }

    // ── Replay protection ────────────────────────────────────────────────────

    #[test]
    fn duplicate_input_rejected_as_replay() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        let input = a.propose(&HashSigner, NOW).unwrap().unwrap();

        b.receive(&input, &HashSigner, NOW).unwrap();
        let snapshot = b.clone();

        let err = b.receive(&input, &HashSigner, NOW).unwrap_err();
        assert_eq!(
            err,
            XlnError::ReplayCounter {
                expected: 2,
                got: 1
            }
        );
        // Identical state apart from the receive bookkeeping counter.
        assert_eq!(b.current_height, snapshot.current_height);
        assert_eq!(b.state, snapshot.state);
        assert_eq!(b.acked_transitions, snapshot.acked_transitions);
        assert_eq!(b.receive_counter, snapshot.receive_counter + 1);
    }

    #[test]
    fn counter_gap_rejected() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        let mut input = a.propose(&HashSigner, NOW).unwrap().unwrap();
        input.counter = 5;
        let err = b.receive(&input, &HashSigner, NOW).unwrap_err();
        assert_eq!(
            err,
            XlnError::ReplayCounter {
                expected: 1,
                got: 5
            }
        );
    }

    // ── Chain linkage ────────────────────────────────────────────────────────

    #[test]
    fn wrong_prev_hash_rejected_as_fork() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        exchange(&mut a, &mut b, NOW);

        a.add_to_mempool(pay(1), NOW).unwrap();
        let mut input = a.propose(&HashSigner, NOW).unwrap().unwrap();
        if let Some(f) = &mut input.new_account_frame {
            f.prev_frame_hash = PrevHash::Hash([0xee; 32]);
            f.seal();
            input.new_signatures =
                vec![HashSigner.sign(&SignerId::new(*b"alice"), &f.state_hash).unwrap()];
        }
        let err = b.receive(&input, &HashSigner, NOW).unwrap_err();
        assert!(matches!(err, XlnError::WrongPrevFrameHash { .. }));
    }

    #[test]
    fn tampered_frame_body_rejected() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        let mut input = a.propose(&HashSigner, NOW).unwrap().unwrap();
        if let Some(f) = &mut input.new_account_frame {
            f.deltas[0] = -50; // state hash now stale
        }
        let err = b.receive(&input, &HashSigner, NOW).unwrap_err();
        assert!(matches!(err, XlnError::MalformedMessage(_)));
    }

    // ── Batched ACK + proposal ───────────────────────────────────────────────

    #[test]
    fn ack_carries_bundled_counter_proposal() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        b.add_to_mempool(pay(30), NOW).unwrap();

        let input = a.propose(&HashSigner, NOW).unwrap().unwrap();
        // B is not mid-proposal, so its queued payment rides on the ACK.
        let out = b.receive(&input, &HashSigner, NOW).unwrap();
        let reply = out.message.unwrap();
        assert!(!reply.prev_signatures.is_empty());
        let bundled = reply.new_account_frame.as_ref().expect("bundled frame");
        assert_eq!(bundled.height, 2);
        assert_eq!(reply.height, 2);

        // A commits its own frame and B's bundled one in a single receive.
        let out = a.receive(&reply, &HashSigner, NOW).unwrap();
        assert_eq!(a.current_height, 2);
        let d = a.state.ledger.get(&token()).unwrap();
        assert_eq!(d.net(), -70); // −100 from A, +30 from B

        let ack = out.message.unwrap();
        b.receive(&ack, &HashSigner, NOW).unwrap();
        assert_eq!(b.current_height, 2);
        assert_eq!(b.state.ledger.get(&token()).unwrap().net(), -70);
    }

    // ── HTLC lifecycle across frames ─────────────────────────────────────────

    fn lock_tx(timeout: Timestamp, next_hop: Option<EntityId>) -> AccountTx {
        AccountTx::HtlcLock {
            id: vec![0xaa],
            token_id: token(),
            amount: 100,
            hash_lock: sha256(b"preimage"),
            timeout,
            next_hop,
        }
    }

    #[test]
    fn htlc_claim_transfers_after_reveal() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(lock_tx(NOW + 60, None), NOW).unwrap();
        exchange(&mut a, &mut b, NOW);

        // Lock reserves the sender's headroom on both sides.
        for m in [&a, &b] {
            let d = m.state.ledger.get(&token()).unwrap();
            assert_eq!(d.left_allowance, 100);
            assert_eq!(d.net(), 0);
        }

        b.add_to_mempool(
            AccountTx::HtlcClaim {
                id: vec![0xaa],
                preimage: b"preimage".to_vec(),
            },
            NOW + 10,
        )
        .unwrap();
        exchange(&mut b, &mut a, NOW + 10);

        for m in [&a, &b] {
            let htlc = &m.state.subcontracts[&vec![0xaa_u8]];
            assert!(htlc.claimed && htlc.settled);
            assert_eq!(htlc.revealed_preimage.as_deref(), Some(b"preimage".as_ref()));
            let d = m.state.ledger.get(&token()).unwrap();
            assert_eq!(d.net(), -100);
            assert_eq!(d.left_allowance, 0);
        }
    }

    #[test]
    fn htlc_refund_after_timeout_releases_lock() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(lock_tx(NOW + 60, None), NOW).unwrap();
        exchange(&mut a, &mut b, NOW);

        a.add_to_mempool(AccountTx::HtlcRefund { id: vec![0xaa] }, NOW + 60)
            .unwrap();
        exchange(&mut a, &mut b, NOW + 60);

        for m in [&a, &b] {
            let htlc = &m.state.subcontracts[&vec![0xaa_u8]];
            assert!(htlc.refunded && htlc.settled);
            let d = m.state.ledger.get(&token()).unwrap();
            assert_eq!(d.net(), 0);
            assert_eq!(d.left_allowance, 0);
        }

        // Claim after refund is dead on arrival.
        let err = b
            .add_to_mempool(
                AccountTx::HtlcClaim {
                    id: vec![0xaa],
                    preimage: b"preimage".to_vec(),
                },
                NOW + 61,
            )
            .unwrap_err();
        assert_eq!(err, XlnError::AlreadyRefunded);
    }

    #[test]
    fn routed_lock_surfaces_forward_instruction() {
        let (mut a, mut b) = seeded_pair(1000);
        let carol = EntityId::new(*b"carol");
        a.add_to_mempool(lock_tx(NOW + 60, Some(carol.clone())), NOW)
            .unwrap();
        let input = a.propose(&HashSigner, NOW).unwrap().unwrap();
        let out = b.receive(&input, &HashSigner, NOW).unwrap();
        let forward = out.forward.expect("forward instruction");
        assert_eq!(forward.next_hop, carol);
        assert_eq!(forward.amount, 100);
        assert_eq!(b.pending_forward.as_ref(), Some(&forward));
        assert_eq!(b.take_pending_forward(), Some(forward));
        assert!(b.pending_forward.is_none());
    }

    // ── Misc contracts ───────────────────────────────────────────────────────

    #[test]
    fn empty_mempool_proposes_nothing() {
        let (mut a, _) = seeded_pair(1000);
        assert!(a.propose(&HashSigner, NOW).unwrap().is_none());
    }

    #[test]
    fn second_propose_waits_for_ack() {
        let (mut a, _) = seeded_pair(1000);
        a.add_to_mempool(pay(10), NOW).unwrap();
        assert!(a.propose(&HashSigner, NOW).unwrap().is_some());
        a.add_to_mempool(pay(10), NOW).unwrap();
        assert!(a.propose(&HashSigner, NOW).unwrap().is_none());
        assert_eq!(a.mempool.len(), 1);
    }

    #[test]
    fn global_credit_limit_caps_exposure() {
        let (mut a, mut b) = seeded_pair(1000);
        a.global_credit_limits.insert(token(), 50);
        b.global_credit_limits.insert(token(), 50);
        a.add_to_mempool(pay(80), NOW).unwrap();
        let err = a.propose(&HashSigner, NOW).unwrap_err();
        assert!(matches!(err, XlnError::RcpanViolation { .. }));
    }

    #[test]
    fn machine_rlp_round_trip_mid_session() {
        let (mut a, mut b) = seeded_pair(1000);
        a.add_to_mempool(pay(100), NOW).unwrap();
        exchange(&mut a, &mut b, NOW);
        a.add_to_mempool(pay(5), NOW).unwrap();
        a.propose(&HashSigner, NOW).unwrap().unwrap();

        let restored = AccountMachine::from_rlp(&a.to_rlp()).unwrap();
        assert_eq!(restored, a);
    }
}
