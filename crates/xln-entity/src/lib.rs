//! The entity BFT layer: weighted-quorum agreement over entity frames, with
//! the bilateral account machines embedded in entity state.

pub mod quorum;
pub mod replica;

pub use quorum::{ValidatorInfo, ValidatorSet};
pub use replica::{
    DoubleSignEvidence, EntityEffects, EntityMessage, EntityOutputs, EntityReplica, EntityState,
};
