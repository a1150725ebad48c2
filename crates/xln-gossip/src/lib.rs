//! Gossip and routing: the last-write-wins profile store, the per-token
//! capacity graph, and backward-fee pathfinding.

pub mod graph;
pub mod profile;
pub mod routing;

pub use graph::{CapacityGraph, Edge};
pub use profile::{capacity_summary, AccountCapacity, Profile, ProfileStore, TokenCapacity};
pub use routing::{find_routes, Route};
