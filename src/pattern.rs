//! Pattern compilation and matching.
//!
//! A pattern is compiled once into a *search plan*: an ordered list of node
//! and edge steps arranged so that every step after the first shares an
//! already-matched endpoint with the growing match. The matcher then
//! enumerates all SRG instances of the plan by backtracking.

use std::collections::BTreeSet;

use tracing::trace;

use crate::context::EvaluationContext;
use crate::matching::Matching;
use crate::srg::{Srg, SrgEdgeData, SrgNodeData};
use crate::subgraph::{Subgraph, SubgraphEdge, SubgraphNode};

/// One step of a search plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// Match a pattern node. With `by_id`, the SRG node is fixed by id
    /// lookup instead of enumeration.
    Node {
        /// Pattern node name.
        name: String,
        /// Fixed SRG node id, when the node's predicates pin it.
        by_id: Option<String>,
    },
    /// Match a pattern edge against the SRG.
    Edge {
        /// Pattern edge name.
        name: String,
    },
}

/// A pattern (or query) with its compiled search plan.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// Name of the pattern.
    pub name: String,
    /// Id of the announcing client.
    pub client_id: String,
    /// The pattern description.
    pub subgraph: Subgraph,
    plan: Vec<PlanStep>,
}

impl CompiledPattern {
    /// Compiles a pattern into a connectivity-preserving search plan.
    ///
    /// Seed preference: input nodes pinned by an `id` equality, then any
    /// input node with predicates, then the first input edge. Only input
    /// objects contribute steps; output objects describe what the pattern
    /// produces and are never matched.
    #[must_use]
    pub fn compile(graph: Subgraph, client_id: impl Into<String>) -> Self {
        let mut plan = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut matched_nodes: BTreeSet<String> = BTreeSet::new();
        let mut matched_edges: BTreeSet<String> = BTreeSet::new();

        if !graph.graph.is_null() {
            // Seed with every input node whose predicates pin an id.
            let mut first_predicate_node: Option<String> = None;
            for node in graph.input_nodes() {
                if node.data.predicates.is_empty() {
                    continue;
                }
                if let Some(first) = node.data.predicates.first() {
                    if let Some((_, id)) = first
                        .conjunctive_equalities()
                        .into_iter()
                        .find(|(key, _)| key == "id")
                    {
                        plan.push(PlanStep::Node {
                            name: node.name.clone(),
                            by_id: Some(id),
                        });
                        matched_nodes.insert(node.name.clone());
                        stack.push(node.name.clone());
                    }
                }
                if first_predicate_node.is_none() {
                    first_predicate_node = Some(node.name.clone());
                }
            }

            if stack.is_empty() {
                if let Some(name) = first_predicate_node {
                    // No id-pinned node: seed with any predicate-carrying one.
                    plan.push(PlanStep::Node {
                        name: name.clone(),
                        by_id: None,
                    });
                    matched_nodes.insert(name.clone());
                    stack.push(name);
                } else if let Some(edge) = graph.input_edges().next() {
                    // No predicates anywhere: seed with the first input edge.
                    plan.push(PlanStep::Edge {
                        name: edge.name.clone(),
                    });
                    matched_edges.insert(edge.name.clone());
                    matched_nodes.insert(edge.source.clone());
                    stack.push(edge.source.clone());
                    matched_nodes.insert(edge.target.clone());
                    stack.push(edge.target.clone());
                }
            }

            // Extend by DFS over the input subgraph; when a component is
            // exhausted, re-seed from any remaining input node.
            loop {
                while let Some(node_name) = stack.pop() {
                    let Ok(node) = graph.graph.node(&node_name) else {
                        continue;
                    };
                    let incident: Vec<(String, bool)> = node
                        .out_edges()
                        .iter()
                        .map(|e| (e.clone(), true))
                        .chain(node.in_edges().iter().map(|e| (e.clone(), false)))
                        .collect();

                    for (edge_name, outgoing) in incident {
                        let Ok(edge) = graph.graph.edge(&edge_name) else {
                            continue;
                        };
                        if !edge.data.is_input() || matched_edges.contains(&edge_name) {
                            continue;
                        }
                        plan.push(PlanStep::Edge {
                            name: edge_name.clone(),
                        });
                        matched_edges.insert(edge_name);

                        let other = if outgoing {
                            edge.target.clone()
                        } else {
                            edge.source.clone()
                        };
                        if !matched_nodes.contains(&other) {
                            // Only nodes that need an attribute check get a
                            // step of their own; the edge step implies the
                            // binding.
                            let has_predicates = graph
                                .graph
                                .node(&other)
                                .map(|n| !n.data.predicates.is_empty())
                                .unwrap_or(false);
                            if has_predicates {
                                plan.push(PlanStep::Node {
                                    name: other.clone(),
                                    by_id: None,
                                });
                            }
                            matched_nodes.insert(other.clone());
                            stack.push(other);
                        }
                    }
                }

                let next = graph
                    .input_nodes()
                    .find(|n| !matched_nodes.contains(&n.name) && !n.data.predicates.is_empty())
                    .or_else(|| graph.input_nodes().find(|n| !matched_nodes.contains(&n.name)))
                    .map(|n| n.name.clone());
                match next {
                    Some(name) => {
                        plan.push(PlanStep::Node {
                            name: name.clone(),
                            by_id: None,
                        });
                        matched_nodes.insert(name.clone());
                        stack.push(name);
                    }
                    None => break,
                }
            }
        }

        let name = graph.name.clone();
        Self {
            name,
            client_id: client_id.into(),
            subgraph: graph,
            plan,
        }
    }

    /// The compiled search plan.
    #[must_use]
    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    /// Enumerates every complete match of this pattern in the SRG.
    ///
    /// Backtracking over the search plan: candidate extensions are pushed
    /// onto an explicit stack and every completed plan is emitted, in the
    /// deterministic order induced by the graph's name-ordered storage.
    /// Callers filter downstream.
    #[must_use]
    pub fn find_matches(&self, srg: &Srg) -> Vec<Matching> {
        let mut results = Vec::new();
        let mut stack = vec![Matching::new()];

        while let Some(mut state) = stack.pop() {
            let step_index = state.step;
            state.step += 1;

            if step_index == self.plan.len() {
                results.push(state);
                continue;
            }

            match &self.plan[step_index] {
                PlanStep::Edge { name } => {
                    let Ok(pattern_edge) = self.subgraph.graph.edge(name) else {
                        continue;
                    };
                    self.extend_edge_step(srg, &state, pattern_edge, &mut stack);
                }
                PlanStep::Node { name, by_id } => {
                    let Ok(pattern_node) = self.subgraph.graph.node(name) else {
                        continue;
                    };

                    if let Some(bound) = state.srg_node_for(name).map(str::to_string) {
                        // Already bound by an adjacent edge step: only the
                        // predicates remain to be checked.
                        let compatible = srg
                            .graph()
                            .node(&bound)
                            .map(|n| node_compatible(&pattern_node.data, &n.data))
                            .unwrap_or(false);
                        if compatible {
                            stack.push(state);
                        }
                    } else if let Some(id) = by_id {
                        if let Ok(srg_node) = srg.graph().node(id) {
                            if node_compatible(&pattern_node.data, &srg_node.data) {
                                state.bind_node(name, id);
                                stack.push(state);
                            }
                        }
                    } else {
                        for srg_node in srg.graph().nodes() {
                            if state.is_srg_node_bound(&srg_node.name) {
                                continue;
                            }
                            if !node_compatible(&pattern_node.data, &srg_node.data) {
                                continue;
                            }
                            let mut child = state.clone();
                            child.bind_node(name, &srg_node.name);
                            stack.push(child);
                        }
                    }
                }
            }
        }

        trace!(pattern = %self.name, matches = results.len(), "pattern matching done");
        results
    }

    fn extend_edge_step(
        &self,
        srg: &Srg,
        state: &Matching,
        pattern_edge: &crate::graph::Edge<SubgraphEdge>,
        stack: &mut Vec<Matching>,
    ) {
        let source_bound = state.srg_node_for(&pattern_edge.source).map(str::to_string);
        let target_bound = state.srg_node_for(&pattern_edge.target).map(str::to_string);

        if let Some(srg_source) = source_bound {
            // Follow the matched source's out-edges.
            let Ok(start) = srg.graph().node(&srg_source) else {
                return;
            };
            for srg_edge_name in start.out_edges() {
                let Ok(srg_edge) = srg.graph().edge(srg_edge_name) else {
                    continue;
                };
                if state.is_srg_edge_bound(srg_edge_name) {
                    continue;
                }
                if let Some(t) = &target_bound {
                    if *t != srg_edge.target {
                        continue;
                    }
                }
                if !edge_compatible(&pattern_edge.data, &srg_edge.data) {
                    continue;
                }
                let mut child = state.clone();
                child.bind_edge(
                    &pattern_edge.name,
                    &pattern_edge.source,
                    &pattern_edge.target,
                    srg_edge_name,
                    &srg_edge.source,
                    &srg_edge.target,
                );
                stack.push(child);
            }
        } else if let Some(srg_target) = target_bound {
            // Follow the matched target's in-edges.
            let Ok(end) = srg.graph().node(&srg_target) else {
                return;
            };
            for srg_edge_name in end.in_edges() {
                let Ok(srg_edge) = srg.graph().edge(srg_edge_name) else {
                    continue;
                };
                if state.is_srg_edge_bound(srg_edge_name) {
                    continue;
                }
                if !edge_compatible(&pattern_edge.data, &srg_edge.data) {
                    continue;
                }
                let mut child = state.clone();
                child.bind_edge(
                    &pattern_edge.name,
                    &pattern_edge.source,
                    &pattern_edge.target,
                    srg_edge_name,
                    &srg_edge.source,
                    &srg_edge.target,
                );
                stack.push(child);
            }
        } else {
            // Neither endpoint matched: last resort, scan all SRG edges
            // whose endpoints are still unused.
            for srg_edge in srg.graph().edges() {
                if state.is_srg_edge_bound(&srg_edge.name)
                    || state.is_srg_node_bound(&srg_edge.source)
                    || state.is_srg_node_bound(&srg_edge.target)
                {
                    continue;
                }
                if !edge_compatible(&pattern_edge.data, &srg_edge.data) {
                    continue;
                }
                let mut child = state.clone();
                child.bind_edge(
                    &pattern_edge.name,
                    &pattern_edge.source,
                    &pattern_edge.target,
                    &srg_edge.name,
                    &srg_edge.source,
                    &srg_edge.target,
                );
                stack.push(child);
            }
        }
    }
}

/// Every predicate must hold on the SRG node's attributes; an evaluation
/// error counts as incompatible.
fn node_compatible(pattern: &SubgraphNode, srg: &SrgNodeData) -> bool {
    pattern.predicates.iter().all(|p| {
        let ctx = EvaluationContext::local(&srg.attributes);
        p.eval(&ctx).unwrap_or(false)
    })
}

/// Every predicate must hold on the SRG edge's attributes and info-sources.
fn edge_compatible(pattern: &SubgraphEdge, srg: &SrgEdgeData) -> bool {
    pattern.predicates.iter().all(|p| {
        let ctx = EvaluationContext::local_with_sources(&srg.attributes, &srg.info_sources);
        p.eval(&ctx).unwrap_or(false)
    })
}
