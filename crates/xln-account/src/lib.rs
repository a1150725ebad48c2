//! The bilateral account layer: two-party frame consensus, subcontracts, and
//! settlement emission.

pub mod machine;
pub mod settle;
pub mod subcontract;

pub use machine::{
    AccountMachine, AccountOutputs, AccountState, ForwardInstruction, ProofBody, ProofHeader,
};
pub use settle::close_diff;
pub use subcontract::{DeltaChange, DeltaTransformer, Htlc};
