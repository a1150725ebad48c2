//! Seams to the external world: the on-chain jurisdiction and the message
//! transport. The core computes state transitions; everything here is how
//! their effects leave the process.

use serde::{Deserialize, Serialize};

use crate::error::XlnError;
use crate::types::{Amount, EntityId, TokenId};

// ── Settlement ───────────────────────────────────────────────────────────────

/// A per-token settlement instruction for the jurisdiction layer.
///
/// Settlements conserve value: `left + right + collateral = 0`. The
/// constructor is the only way to build one, so a non-zero-sum diff cannot
/// leave the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDiff {
    token_id: TokenId,
    left_diff: Amount,
    right_diff: Amount,
    collateral_diff: Amount,
}

impl SettlementDiff {
    pub fn new(
        token_id: TokenId,
        left_diff: Amount,
        right_diff: Amount,
        collateral_diff: Amount,
    ) -> Result<Self, XlnError> {
        if left_diff + right_diff + collateral_diff != 0 {
            return Err(XlnError::NonZeroSumSettlement {
                left: left_diff,
                right: right_diff,
                collateral: collateral_diff,
            });
        }
        Ok(Self {
            token_id,
            left_diff,
            right_diff,
            collateral_diff,
        })
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn left_diff(&self) -> Amount {
        self.left_diff
    }

    pub fn right_diff(&self) -> Amount {
        self.right_diff
    }

    pub fn collateral_diff(&self) -> Amount {
        self.collateral_diff
    }
}

// ── Chain client ─────────────────────────────────────────────────────────────

/// Events the jurisdiction layer can surface back into the core.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainEvent {
    EntityRegistered {
        entity: EntityId,
        entity_number: u64,
    },
    ReserveChanged {
        entity: EntityId,
        token_id: TokenId,
        amount: u128,
    },
    SettlementConfirmed {
        left: EntityId,
        right: EntityId,
        tx_hash: [u8; 32],
    },
}

/// Filter for [`ChainClient::watch_events`].
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub entity: Option<EntityId>,
}

/// The on-chain jurisdiction, seen from the core.
pub trait ChainClient {
    fn register_entity(&mut self, entity: &EntityId, board_hash: [u8; 32])
        -> Result<u64, XlnError>;

    fn get_reserve(&self, entity: &EntityId, token_id: &TokenId) -> Result<u128, XlnError>;

    fn submit_settlement(
        &mut self,
        left: &EntityId,
        right: &EntityId,
        diffs: &[SettlementDiff],
    ) -> Result<[u8; 32], XlnError>;

    fn watch_events(&mut self, filter: EventFilter, handler: Box<dyn FnMut(ChainEvent) + Send>);
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Outbound message delivery, generic over the message type of each layer.
/// Inbound delivery is a plain callback into the owning state machine, in a
/// single-threaded stream per replica.
pub trait Transport<M> {
    fn send(&mut self, to: &EntityId, message: M);
}
