use crate::types::{Amount, Height, TokenId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum XlnError {
    // ── Validation ───────────────────────────────────────────────────────────
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("wrong prev frame hash at height {height}: expected {expected}, got {got}")]
    WrongPrevFrameHash {
        height: Height,
        expected: String,
        got: String,
    },

    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: Height, got: Height },

    #[error("bad signature from {signer}")]
    BadSignature { signer: String },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("frame exceeds {max} bytes (got {size})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame carries {count} txs, max {max}")]
    TooManyFrameTxs { count: usize, max: usize },

    #[error("mempool full ({limit} txs)")]
    MempoolFull { limit: usize },

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("settlement diffs must be zero-sum: {left} + {right} + {collateral} != 0")]
    NonZeroSumSettlement {
        left: Amount,
        right: Amount,
        collateral: Amount,
    },

    #[error("insufficient reserve of token {token}: need {need}, have {have}")]
    InsufficientReserve { token: TokenId, need: u128, have: u128 },

    // ── Replay ───────────────────────────────────────────────────────────────
    #[error("replay counter: expected {expected}, got {got}")]
    ReplayCounter { expected: u64, got: u64 },

    // ── Credit-collateral invariant ──────────────────────────────────────────
    #[error(
        "rcpan violation on token {token}: current {current}, change {change}, \
         proposed {proposed}, bounds [{lower}, {upper}]"
    )]
    RcpanViolation {
        token: TokenId,
        current: Amount,
        change: Amount,
        proposed: Amount,
        lower: Amount,
        upper: Amount,
    },

    #[error("limit must be non-negative: {0}")]
    NegativeLimit(Amount),

    #[error("amount overflow on token {token}")]
    AmountOverflow { token: TokenId },

    // ── Consensus divergence ─────────────────────────────────────────────────
    #[error("state divergence at height {height}: ours {ours}, theirs {theirs}")]
    StateDivergence {
        height: Height,
        ours: String,
        theirs: String,
    },

    #[error("double sign by {signer} at height {height}")]
    DoubleSign { signer: String, height: Height },

    // ── Quorum ───────────────────────────────────────────────────────────────
    #[error("quorum not reached: have {have} of {need} voting power")]
    QuorumNotReached { have: u64, need: u64 },

    #[error("not the proposer for this height")]
    NotProposer,

    #[error("validator already locked on a different frame at height {height}")]
    ConflictingLock { height: Height },

    // ── Storage ──────────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Routing ──────────────────────────────────────────────────────────────
    #[error("no route from {from_node} to {target}")]
    NoRoute { from_node: String, target: String },

    #[error("route capacity exhausted on token {token}")]
    CapacityExhausted { token: TokenId },

    // ── Subcontracts ─────────────────────────────────────────────────────────
    #[error("subcontract not found: {0}")]
    SubcontractNotFound(String),

    #[error("preimage does not match hash lock")]
    WrongPreimage,

    #[error("subcontract already claimed")]
    AlreadyClaimed,

    #[error("subcontract already refunded")]
    AlreadyRefunded,

    #[error("claim after timeout (timeout {timeout}, frame time {now})")]
    ClaimAfterTimeout { timeout: i64, now: i64 },

    #[error("refund before timeout (timeout {timeout}, frame time {now})")]
    RefundBeforeTimeout { timeout: i64, now: i64 },

    // ── Fatal corruption ─────────────────────────────────────────────────────
    #[error("two consecutive rollbacks on the same account")]
    DoubleRollback,

    #[error("state root mismatch: expected {expected}, got {got}")]
    StateRootMismatch { expected: String, got: String },
}

impl XlnError {
    /// Fatal errors abort the process; everything else rejects one message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XlnError::DoubleRollback | XlnError::StateRootMismatch { .. }
        )
    }
}

impl From<xln_crypto::CodecError> for XlnError {
    fn from(e: xln_crypto::CodecError) -> Self {
        XlnError::Serialization(e.to_string())
    }
}
