//! Directed capacity graph for one token, assembled from gossip profiles.

use std::collections::{BTreeMap, BTreeSet};

use xln_core::{EntityId, TokenId};

use crate::profile::ProfileStore;

/// A directed payment edge `from → to` with its advertised capacity and the
/// fee schedule of the forwarding side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: EntityId,
    pub to: EntityId,
    pub capacity: u128,
    pub base_fee: u128,
    pub fee_ppm: u128,
}

/// The routing graph for one token. Edges are indexed by their target node
/// so pathfinding can walk backward from the payment destination.
#[derive(Clone, Debug, Default)]
pub struct CapacityGraph {
    token_id: Option<TokenId>,
    nodes: BTreeSet<EntityId>,
    edges_in: BTreeMap<EntityId, Vec<Edge>>,
}

impl CapacityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for `token` from every advertised account.
    ///
    /// Each entity's own profile is authoritative for its outgoing capacity;
    /// when only the counterparty advertises the pair, its receive capacity
    /// fills in the missing direction.
    pub fn from_profiles(store: &ProfileStore, token: &TokenId) -> Self {
        let mut edges: BTreeMap<(EntityId, EntityId), Edge> = BTreeMap::new();

        for profile in store.iter() {
            let base_fee = profile.metadata_u128("base_fee");
            let fee_ppm = profile.metadata_u128("fee_ppm");
            for account in &profile.accounts {
                let Some(cap) = account.capacities.get(token) else {
                    continue;
                };
                if cap.send_cap > 0 {
                    edges.insert(
                        (profile.entity_id.clone(), account.counterparty.clone()),
                        Edge {
                            from: profile.entity_id.clone(),
                            to: account.counterparty.clone(),
                            capacity: cap.send_cap,
                            base_fee,
                            fee_ppm,
                        },
                    );
                }
            }
        }

        // Second pass: counterparty receive capacity for unadvertised sides.
        for profile in store.iter() {
            for account in &profile.accounts {
                let Some(cap) = account.capacities.get(token) else {
                    continue;
                };
                let reverse = (account.counterparty.clone(), profile.entity_id.clone());
                if cap.recv_cap > 0 && !edges.contains_key(&reverse) {
                    let peer_fees = store.get(&account.counterparty);
                    edges.insert(
                        reverse.clone(),
                        Edge {
                            from: reverse.0.clone(),
                            to: reverse.1.clone(),
                            capacity: cap.recv_cap,
                            base_fee: peer_fees.map(|p| p.metadata_u128("base_fee")).unwrap_or(0),
                            fee_ppm: peer_fees.map(|p| p.metadata_u128("fee_ppm")).unwrap_or(0),
                        },
                    );
                }
            }
        }

        let mut graph = Self {
            token_id: Some(token.clone()),
            nodes: BTreeSet::new(),
            edges_in: BTreeMap::new(),
        };
        for (_, edge) in edges {
            graph.add_edge(edge);
        }
        graph
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.nodes.insert(edge.from.clone());
        self.nodes.insert(edge.to.clone());
        self.edges_in.entry(edge.to.clone()).or_default().push(edge);
    }

    pub fn token_id(&self) -> Option<&TokenId> {
        self.token_id.as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges_in.values().map(|v| v.len()).sum()
    }

    /// Edges arriving at `node`, in deterministic source order.
    pub fn edges_into(&self, node: &EntityId) -> &[Edge] {
        self.edges_in.get(node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, node: &EntityId) -> bool {
        self.nodes.contains(node)
    }
}
