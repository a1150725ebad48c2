//! Core types of the XLN two-layer off-chain payment network: identifiers,
//! per-token credit-collateral state, transactions, frames, and the external
//! seams (signer, chain, transport).
//!
//! Everything here is pure data plus deterministic transformations; no I/O,
//! no clocks.

pub mod chain;
pub mod constants;
pub mod delta;
pub mod error;
pub mod frame;
pub mod signer;
pub mod tx;
pub mod types;

pub use chain::{ChainClient, ChainEvent, EventFilter, SettlementDiff, Transport};
pub use constants::*;
pub use delta::{Delta, TokenLedger};
pub use error::XlnError;
pub use frame::{AccountFrame, AccountInput, EntityFrame, PrevHash};
pub use signer::{HashSigner, Signer};
pub use tx::{sort_for_proposal, AccountTx, EntityTx, EntityTxKind};
pub use types::{Amount, EntityId, Height, Signature, SignerId, Timestamp, TokenId};
