//! Capacity-aware multi-hop route discovery.
//!
//! A modified Dijkstra walks backward from the payment target, so the amount
//! crossing each edge already includes every downstream fee: an edge must
//! carry `a` (the amount required below it), contributes
//! `base_fee + ⌊a · fee_ppm / 1e6⌋`, and raises the upstream requirement by
//! that fee. Each edge also scores a success probability
//! `exp(−2 · a / capacity)`; a route's probability is the product.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use tracing::debug;

use xln_core::{EntityId, TokenId, XlnError, FEE_PPM_DENOMINATOR, MAX_ROUTES};

use crate::graph::CapacityGraph;

/// One discovered payment path, source first, target last.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub path: Vec<EntityId>,
    pub total_fee: u128,
    /// Amount the source must commit: the payment plus all fees.
    pub amount_with_fees: u128,
    pub probability: f64,
}

struct SearchState {
    fee: u128,
    /// Amount that must arrive at `node` to satisfy everything downstream.
    required: u128,
    probability: f64,
    node: EntityId,
    /// Path from `node` down to the target.
    path: Vec<EntityId>,
}

impl PartialEq for SearchState {
    fn eq(&self, other: &Self) -> bool {
        self.fee == other.fee
    }
}
impl Eq for SearchState {}
impl PartialOrd for SearchState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SearchState {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap pops the cheapest accumulated fee first.
        other.fee.cmp(&self.fee)
    }
}

/// Find up to `max_routes` routes carrying `amount` of `token_id` from
/// `source` to `target`, cheapest first.
pub fn find_routes(
    graph: &CapacityGraph,
    source: &EntityId,
    target: &EntityId,
    amount: u128,
    token_id: &TokenId,
    max_routes: usize,
) -> Result<Vec<Route>, XlnError> {
    if graph.token_id().is_some_and(|t| t != token_id) {
        return Err(XlnError::MalformedMessage(
            "graph was built for a different token".into(),
        ));
    }
    let max_routes = max_routes.min(MAX_ROUTES).max(1);

    if source == target {
        return Ok(vec![Route {
            path: Vec::new(),
            total_fee: 0,
            amount_with_fees: amount,
            probability: 1.0,
        }]);
    }
    if !graph.contains(source) || !graph.contains(target) {
        return Err(XlnError::NoRoute {
            from_node: source.to_string(),
            target: target.to_string(),
        });
    }

    let mut heap = BinaryHeap::new();
    heap.push(SearchState {
        fee: 0,
        required: amount,
        probability: 1.0,
        node: target.clone(),
        path: vec![target.clone()],
    });

    let mut visits: BTreeMap<EntityId, usize> = BTreeMap::new();
    let mut routes: Vec<Route> = Vec::new();
    let mut capacity_skips = 0usize;

    while let Some(state) = heap.pop() {
        let seen = visits.entry(state.node.clone()).or_insert(0);
        if *seen >= max_routes {
            continue;
        }
        *seen += 1;

        if state.node == *source {
            routes.push(Route {
                path: state.path.clone(),
                total_fee: state.fee,
                amount_with_fees: state.required,
                probability: state.probability,
            });
            if routes.len() >= max_routes {
                break;
            }
            continue;
        }

        for edge in graph.edges_into(&state.node) {
            if state.path.contains(&edge.from) {
                continue; // no cycles
            }
            if edge.capacity < state.required {
                capacity_skips += 1;
                continue;
            }
            let fee = edge.base_fee + state.required * edge.fee_ppm / FEE_PPM_DENOMINATOR;
            let utilization = state.required as f64 / edge.capacity as f64;
            let edge_probability = (-2.0 * utilization).exp();
            let mut path = Vec::with_capacity(state.path.len() + 1);
            path.push(edge.from.clone());
            path.extend_from_slice(&state.path);
            heap.push(SearchState {
                fee: state.fee + fee,
                required: state.required + fee,
                probability: state.probability * edge_probability,
                node: edge.from.clone(),
                path,
            });
        }
    }

    if routes.is_empty() {
        if capacity_skips > 0 {
            return Err(XlnError::CapacityExhausted {
                token: token_id.clone(),
            });
        }
        return Err(XlnError::NoRoute {
            from_node: source.to_string(),
            target: target.to_string(),
        });
    }

    routes.sort_by(|a, b| {
        a.total_fee
            .cmp(&b.total_fee)
            .then_with(|| b.probability.total_cmp(&a.probability))
            .then_with(|| a.path.cmp(&b.path))
    });
    routes.truncate(max_routes);
    debug!(
        routes = routes.len(),
        source = %source,
        target = %target,
        "pathfinding finished"
    );
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;

    fn id(name: &[u8]) -> EntityId {
        EntityId::new(name.to_vec())
    }

    fn token() -> TokenId {
        TokenId::number(1)
    }

    fn edge(from: &[u8], to: &[u8], capacity: u128, base_fee: u128, fee_ppm: u128) -> Edge {
        Edge {
            from: id(from),
            to: id(to),
            capacity,
            base_fee,
            fee_ppm,
        }
    }

    fn graph(edges: Vec<Edge>) -> CapacityGraph {
        let mut g = CapacityGraph::new();
        for e in edges {
            g.add_edge(e);
        }
        g
    }

    #[test]
    fn fees_accumulate_backward_along_the_path() {
        let g = graph(vec![
            edge(b"a", b"b", 10_000, 1, 0),
            edge(b"b", b"c", 10_000, 2, 1000),
        ]);
        let routes = find_routes(&g, &id(b"a"), &id(b"c"), 1000, &token(), 10).unwrap();
        assert_eq!(routes.len(), 1);
        let r = &routes[0];
        assert_eq!(r.path, vec![id(b"a"), id(b"b"), id(b"c")]);
        // b→c charges 2 + ⌊1000·1000/1e6⌋ = 3; a→b then carries 1003 for 1.
        assert_eq!(r.total_fee, 4);
        assert_eq!(r.amount_with_fees, 1004);
    }

    #[test]
    fn undersized_edge_is_capacity_exhausted() {
        let g = graph(vec![edge(b"a", b"b", 100, 0, 0)]);
        let err = find_routes(&g, &id(b"a"), &id(b"b"), 500, &token(), 10).unwrap_err();
        assert!(matches!(err, XlnError::CapacityExhausted { .. }));
    }

    #[test]
    fn unknown_target_is_no_route() {
        let g = graph(vec![edge(b"a", b"b", 100, 0, 0)]);
        let err = find_routes(&g, &id(b"a"), &id(b"z"), 10, &token(), 10).unwrap_err();
        assert!(matches!(err, XlnError::NoRoute { .. }));
    }

    #[test]
    fn self_route_is_empty_and_free() {
        let g = graph(vec![edge(b"a", b"b", 100, 0, 0)]);
        let routes = find_routes(&g, &id(b"a"), &id(b"a"), 10, &token(), 10).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].path.is_empty());
        assert_eq!(routes[0].total_fee, 0);
        assert_eq!(routes[0].probability, 1.0);
    }

    #[test]
    fn routes_sorted_by_fee_and_truncated() {
        // Two parallel two-hop paths with different fees.
        let g = graph(vec![
            edge(b"a", b"h1", 10_000, 10, 0),
            edge(b"h1", b"c", 10_000, 10, 0),
            edge(b"a", b"h2", 10_000, 1, 0),
            edge(b"h2", b"c", 10_000, 1, 0),
        ]);
        let routes = find_routes(&g, &id(b"a"), &id(b"c"), 100, &token(), 10).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].path[1], id(b"h2"));
        assert!(routes[0].total_fee < routes[1].total_fee);

        let one = find_routes(&g, &id(b"a"), &id(b"c"), 100, &token(), 1).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].path[1], id(b"h2"));
    }

    #[test]
    fn equal_fee_ties_break_by_probability() {
        // Same fees, but h2's edges have more headroom → higher probability.
        let g = graph(vec![
            edge(b"a", b"h1", 200, 5, 0),
            edge(b"h1", b"c", 200, 0, 0),
            edge(b"a", b"h2", 10_000, 5, 0),
            edge(b"h2", b"c", 10_000, 0, 0),
        ]);
        let routes = find_routes(&g, &id(b"a"), &id(b"c"), 100, &token(), 10).unwrap();
        assert_eq!(routes[0].total_fee, routes[1].total_fee);
        assert_eq!(routes[0].path[1], id(b"h2"));
        assert!(routes[0].probability > routes[1].probability);
    }

    #[test]
    fn edge_probability_matches_utilization() {
        let g = graph(vec![edge(b"a", b"b", 1000, 0, 0)]);
        let routes = find_routes(&g, &id(b"a"), &id(b"b"), 500, &token(), 10).unwrap();
        // exp(−2 · 500/1000) = exp(−1)
        assert!((routes[0].probability - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn cycles_are_never_taken() {
        let g = graph(vec![
            edge(b"a", b"b", 10_000, 1, 0),
            edge(b"b", b"a", 10_000, 1, 0),
            edge(b"b", b"c", 10_000, 1, 0),
            edge(b"c", b"b", 10_000, 1, 0),
        ]);
        let routes = find_routes(&g, &id(b"a"), &id(b"c"), 100, &token(), 100).unwrap();
        for r in &routes {
            let mut seen = r.path.clone();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), r.path.len(), "cycle in {:?}", r.path);
        }
    }
}
