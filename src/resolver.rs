//! The resolver: maintains the SRG, applies patterns, answers queries.
//!
//! The resolver owns the live SRG, the repository of instantiated
//! subgraphs, and the pattern and query lists. Its top-level operations
//! (`register_*`, `delete_*`, `apply_all_patterns`, `process_queries`) are
//! the only mutation points; everything below them either reads or mutates
//! in strictly nested scopes. The resolver is single-threaded by contract;
//! callers serialise announcements and response generation around it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::attributes::AttributeMap;
use crate::context::EvaluationContext;
use crate::error::{SrqlError, SrqlResult, ValidationError};
use crate::matching::{Matching, SrgRef};
use crate::pattern::CompiledPattern;
use crate::srg::{NodeRef, Srg, SrgEdgeData};
use crate::subgraph::{EdgeRef, InOut, Subgraph, SubgraphEdge, SubgraphNode};

/// Whether a known attribute improves by growing or by shrinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merit {
    /// Smaller values are better (latencies, variances).
    SmallerIsBetter,
    /// Bigger values are better (availability).
    BiggerIsBetter,
}

/// Selection strategy when a query wants only its best match and no
/// best-match expression is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestMatchSelection {
    /// Prefer the match involving the fewest sensors.
    LeastSources,
    /// Prefer the match involving the most sensors.
    MostSources,
}

/// Requirements on the info-sources of a multi-edge match. Limits trivial
/// fusions such as deriving a relation from itself and its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRequirements {
    /// At least one input edge must contribute a source no other edge has.
    NewInfoSource,
    /// All input edges must have pairwise disjoint sources. Stricter.
    DisjointSources,
    /// No requirement.
    None,
}

/// Runtime configuration of the resolver's decision rules.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Accept edges with worse qualities when their sources differ.
    /// Disabling this may prevent some fusion scenarios.
    pub allow_worse_edges: bool,
    /// Best-match selection when no expression is given.
    pub default_best_match: BestMatchSelection,
    /// Info-source requirements for multi-edge matches.
    pub edge_requirements: EdgeRequirements,
    /// The quantitative edge qualities the resolver can rank.
    pub known_attributes: BTreeMap<String, Merit>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let known_attributes = [
            ("latency", Merit::SmallerIsBetter),
            ("gaussT", Merit::SmallerIsBetter),
            ("gaussR", Merit::SmallerIsBetter),
            ("staticT", Merit::SmallerIsBetter),
            ("staticR", Merit::SmallerIsBetter),
            ("updateTime", Merit::SmallerIsBetter),
            ("availability", Merit::BiggerIsBetter),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            allow_worse_edges: true,
            default_best_match: BestMatchSelection::LeastSources,
            edge_requirements: EdgeRequirements::DisjointSources,
            known_attributes,
        }
    }
}

/// Known attributes must differ by at least this fraction to rank.
const KNOWN_ATTRIBUTE_MARGIN: f64 = 0.1;

/// Iteration cap for a resolver tick's fixed point.
pub const MAX_FIXED_POINT_ROUNDS: usize = 10;

/// An instantiated subgraph in the repository, tagged with its owner.
#[derive(Debug, Clone)]
pub struct InstantiatedSubgraph {
    /// The instantiated subgraph.
    pub subgraph: Subgraph,
    /// Id of the owning client.
    pub client_id: String,
}

/// The answer to one query: a set of subgraphs for one client.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Name of the answered query.
    pub query_name: String,
    /// The client these subgraphs belong to.
    pub client_id: String,
    /// The subgraphs, in collection order.
    pub graphs: Vec<Subgraph>,
}

/// The SRG manager.
#[derive(Debug)]
pub struct Resolver {
    config: ResolverConfig,
    srg: Srg,
    repository: BTreeMap<String, InstantiatedSubgraph>,
    patterns: Vec<Arc<CompiledPattern>>,
    queries: Vec<Arc<CompiledPattern>>,
    next_instance_id: u64,
    next_temp_node_id: u64,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl Resolver {
    /// Creates a resolver with the given configuration.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            srg: Srg::new(),
            repository: BTreeMap::new(),
            patterns: Vec::new(),
            queries: Vec::new(),
            next_instance_id: 2000,
            next_temp_node_id: 1000,
        }
    }

    /// Read access to the live SRG.
    #[must_use]
    pub fn srg(&self) -> &Srg {
        &self.srg
    }

    /// Looks up an instantiated subgraph by id.
    #[must_use]
    pub fn repository_get(&self, subgraph_id: &str) -> Option<&InstantiatedSubgraph> {
        self.repository.get(subgraph_id)
    }

    /// Number of instantiated subgraphs in the repository.
    #[must_use]
    pub fn repository_len(&self) -> usize {
        self.repository.len()
    }

    /// Registers a base subgraph, merging its output into the live SRG.
    ///
    /// Nodes are identified with existing SRG nodes by qualified name;
    /// unnamed nodes receive a generated temporary id. Base edges become
    /// their own info-source atom.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] on duplicate ids or bad edge
    /// endpoints.
    pub fn register_srg(&mut self, mut subgraph: Subgraph, client_id: &str) -> SrqlResult<()> {
        info!(client_id, name = %subgraph.name, id = %subgraph.id, "registering SRG");

        // Assign temporary ids to unnamed output nodes before anything is
        // stored, so the repository copy and the SRG agree.
        let unnamed: Vec<String> = subgraph
            .output_nodes()
            .filter(|n| n.data.qualified_name.is_empty())
            .map(|n| n.name.clone())
            .collect();
        for node_name in unnamed {
            let id = format!("tmp{}", self.next_temp_node_id);
            self.next_temp_node_id += 1;
            subgraph.graph.node_mut(&node_name)?.data.qualified_name = id;
        }

        let subgraph_id = subgraph.id.clone();

        // Snapshot what the SRG needs; the repository owns the subgraph.
        let nodes: Vec<(String, String, AttributeMap)> = subgraph
            .output_nodes()
            .map(|n| (n.name.clone(), n.data.qualified_name.clone(), n.data.attributes.clone()))
            .collect();
        let edges: Vec<(String, String, String, AttributeMap)> = subgraph
            .output_edges()
            .map(|e| (e.name.clone(), e.source.clone(), e.target.clone(), e.data.attributes.clone()))
            .collect();

        self.repository.insert(
            subgraph_id.clone(),
            InstantiatedSubgraph {
                subgraph,
                client_id: client_id.to_string(),
            },
        );

        // Identify or create the SRG node for every output node.
        let mut bound: BTreeMap<String, String> = BTreeMap::new();
        for (node_name, qualified, attributes) in nodes {
            let back_ref = NodeRef::new(&subgraph_id, &node_name);
            if self.srg.has_node(&qualified) {
                let (merged, targets) =
                    self.srg.merge_node(&qualified, &attributes, &subgraph_id, back_ref)?;
                self.mirror_node_attributes(&merged, &targets);
            } else {
                self.srg.add_node(&qualified, attributes, &subgraph_id, back_ref)?;
            }
            bound.insert(node_name, qualified);
        }

        // All nodes are identified; the edges can just be inserted.
        for (edge_name, source, target, attributes) in edges {
            let srg_source = bound.get(&source).ok_or_else(|| ValidationError::NodeNotFound {
                name: source.clone(),
            })?;
            let srg_target = bound.get(&target).ok_or_else(|| ValidationError::NodeNotFound {
                name: target.clone(),
            })?;

            let global_name = format!("{subgraph_id}:{edge_name}");
            let mut data = SrgEdgeData {
                attributes,
                subgraph_id: subgraph_id.clone(),
                local_name: edge_name,
                pattern_name: String::new(),
                info_sources: BTreeSet::new(),
                dependants: BTreeSet::new(),
            };
            // A base edge is an information-source atom of its own.
            data.info_sources.insert(global_name.clone());
            self.srg.add_edge(&global_name, srg_source, srg_target, data)?;
        }

        Ok(())
    }

    /// Mirrors merged SRG node attributes into the repository nodes bound
    /// to the same SRG node.
    fn mirror_node_attributes(&mut self, merged: &AttributeMap, targets: &[NodeRef]) {
        for target in targets {
            let Some(entry) = self.repository.get_mut(&target.subgraph_id) else {
                continue;
            };
            if let Ok(node) = entry.subgraph.graph.node_mut(&target.node_name) {
                node.data.attributes.merge(merged);
            }
        }
    }

    /// Registers a pattern, compiling its search plan.
    pub fn register_pattern(&mut self, pattern: Subgraph, client_id: &str) {
        info!(client_id, name = %pattern.name, "registering pattern");
        self.patterns
            .push(Arc::new(CompiledPattern::compile(pattern, client_id)));
    }

    /// Registers a query. A query is compiled exactly like a pattern; it
    /// simply has no output section.
    pub fn register_query(&mut self, query: Subgraph, client_id: &str) {
        info!(client_id, name = %query.name, "registering query");
        self.queries
            .push(Arc::new(CompiledPattern::compile(query, client_id)));
    }

    /// Tries to apply every registered pattern once, in registration
    /// order. Returns the number of instantiated matches.
    pub fn apply_all_patterns(&mut self) -> usize {
        debug!(
            repository = self.repository.len(),
            patterns = self.patterns.len(),
            queries = self.queries.len(),
            "applying all patterns"
        );

        let patterns: Vec<Arc<CompiledPattern>> = self.patterns.clone();
        let mut applications = 0;
        for pattern in patterns {
            applications += self.apply_pattern(&pattern);
        }
        applications
    }

    /// Matches one pattern against the SRG and applies every useful
    /// instance. Returns the number of applied instances.
    pub fn apply_pattern(&mut self, pattern: &CompiledPattern) -> usize {
        debug!(client_id = %pattern.client_id, name = %pattern.name, "trying to apply pattern");

        let matches = pattern.find_matches(&self.srg);
        let mut instances = 0;
        let mut superseded: Vec<String> = Vec::new();

        for mut matching in matches {
            // Stage 1 works on the un-expanded match.
            if !self.decide_stage1(&matching) {
                trace!(name = %pattern.name, "not applying (unexpanded)");
                continue;
            }

            self.expand_matching(pattern, &mut matching);

            // Stage 2 compares the expanded attributes to the SRG.
            let mut supersedes = Vec::new();
            if !self.decide_stage2(pattern, &matching, &mut supersedes) {
                trace!(name = %pattern.name, "not applying (expanded)");
                continue;
            }

            match self.apply_detected(pattern, &mut matching) {
                Ok(()) => {
                    instances += 1;
                    superseded.extend(supersedes);
                }
                Err(e) => {
                    warn!(name = %pattern.name, error = %e, "discarding match");
                }
            }
        }

        // Remove superseded subgraphs, but only single-output ones: a
        // multi-output subgraph may still carry edges nothing dominates.
        for subgraph_id in superseded {
            let single_output = self
                .repository
                .get(&subgraph_id)
                .map(|entry| entry.subgraph.output_edge_count() == 1)
                .unwrap_or(false);
            if single_output {
                if let Err(e) = self.delete_srg(&subgraph_id) {
                    warn!(subgraph_id = %subgraph_id, error = %e, "superseded delete failed");
                }
            }
        }

        instances
    }

    /// Stage 1: reject multi-edge matches whose input edges share
    /// info-sources (configurable).
    fn decide_stage1(&self, matching: &Matching) -> bool {
        if matching.bound_edge_count() <= 1 {
            return true;
        }

        let sources: Vec<&BTreeSet<String>> = matching
            .edge_bindings()
            .filter_map(|(_, srg_edge)| {
                self.srg.graph().edge(srg_edge).ok().map(|e| &e.data.info_sources)
            })
            .collect();

        match self.config.edge_requirements {
            EdgeRequirements::DisjointSources => {
                for (i, a) in sources.iter().enumerate() {
                    for (j, b) in sources.iter().enumerate() {
                        if i != j && a.intersection(b).next().is_some() {
                            return false;
                        }
                    }
                }
                true
            }
            EdgeRequirements::NewInfoSource => {
                let mut no_new_info = 0;
                for (i, a) in sources.iter().enumerate() {
                    for (j, b) in sources.iter().enumerate() {
                        if i != j && b.is_subset(a) {
                            no_new_info += 1;
                        }
                    }
                }
                no_new_info < sources.len() - 1
            }
            EdgeRequirements::None => true,
        }
    }

    /// Computes the match's derived data: the union of input-edge
    /// info-sources, the input-object table, and the expanded attributes
    /// of every output object. Evaluation errors drop the attribute.
    pub fn expand_matching(&self, pattern: &CompiledPattern, matching: &mut Matching) {
        matching.clear_expansion();

        for edge in pattern.subgraph.input_edges() {
            let Some(srg_edge_name) = matching.srg_edge_for(&edge.name).map(str::to_string) else {
                continue;
            };
            if let Ok(srg_edge) = self.srg.graph().edge(&srg_edge_name) {
                matching
                    .info_sources
                    .extend(srg_edge.data.info_sources.iter().cloned());
            }
            matching
                .input_objects
                .insert(edge.name.clone(), SrgRef::Edge(srg_edge_name));
        }

        for node in pattern.subgraph.input_nodes() {
            if let Some(srg_node) = matching.srg_node_for(&node.name) {
                matching
                    .input_objects
                    .insert(node.name.clone(), SrgRef::Node(srg_node.to_string()));
            }
        }

        let mut expanded_edges: BTreeMap<String, AttributeMap> = BTreeMap::new();
        for edge in pattern.subgraph.output_edges() {
            let mut attributes = edge.data.attributes.clone();
            for (attr_name, expr) in &edge.data.expressions {
                let ctx = EvaluationContext::global(matching, &self.srg);
                match expr.eval(&ctx) {
                    Ok(value) => attributes.set(attr_name.clone(), value),
                    Err(e) => debug!(
                        pattern = %pattern.name,
                        edge = %edge.name,
                        attribute = %attr_name,
                        error = %e,
                        "dropping attribute expression"
                    ),
                }
            }
            expanded_edges.insert(edge.name.clone(), attributes);
        }

        let mut expanded_nodes: BTreeMap<String, AttributeMap> = BTreeMap::new();
        for node in pattern.subgraph.output_nodes() {
            let mut attributes = node.data.attributes.clone();
            for (attr_name, expr) in &node.data.expressions {
                let ctx = EvaluationContext::global(matching, &self.srg);
                match expr.eval(&ctx) {
                    Ok(value) => attributes.set(attr_name.clone(), value),
                    Err(e) => debug!(
                        pattern = %pattern.name,
                        node = %node.name,
                        attribute = %attr_name,
                        error = %e,
                        "dropping attribute expression"
                    ),
                }
            }
            expanded_nodes.insert(node.name.clone(), attributes);
        }

        matching.expanded_edge_attributes = expanded_edges;
        matching.expanded_node_attributes = expanded_nodes;
    }

    /// Stage 2: accept the match only if at least one output edge is
    /// non-redundant against every existing SRG edge with the same
    /// endpoints. Dominated subgraphs are collected into `supersedes`.
    fn decide_stage2(
        &self,
        pattern: &CompiledPattern,
        matching: &Matching,
        supersedes: &mut Vec<String>,
    ) -> bool {
        let mut creates_new_edge = false;

        for edge in pattern.subgraph.output_edges() {
            let (Some(source), Some(target)) = (
                matching.srg_node_for(&edge.source),
                matching.srg_node_for(&edge.target),
            ) else {
                // An output edge between unmatched nodes cannot be checked
                // or inserted; the whole match is unusable.
                warn!(pattern = %pattern.name, edge = %edge.name, "output edge endpoint unmatched");
                return false;
            };

            // Derived self-loops are skipped silently.
            if source == target {
                continue;
            }

            let empty = AttributeMap::new();
            let expanded = matching
                .expanded_edge_attributes
                .get(&edge.name)
                .unwrap_or(&empty);

            let Ok(source_node) = self.srg.graph().node(source) else {
                return false;
            };

            let mut redundant = false;
            for srg_edge_name in source_node.out_edges() {
                if redundant {
                    break;
                }
                let Ok(srg_edge) = self.srg.graph().edge(srg_edge_name) else {
                    continue;
                };
                if srg_edge.target != target {
                    continue;
                }

                let mut fixed_equal = true;
                let mut better_known = false;
                let mut all_known_better = true;

                for (attr_name, value) in expanded {
                    let other = srg_edge.data.attributes.get(attr_name);

                    // Static attributes must agree byte for byte.
                    if edge.data.attributes.has(attr_name) {
                        if other.map_or(true, |o| o != value) {
                            fixed_equal = false;
                            break;
                        }
                    }

                    let Some(merit) = self.config.known_attributes.get(attr_name) else {
                        continue;
                    };
                    match other {
                        // Attribute absent on the SRG edge: ours is better.
                        None => better_known = true,
                        Some(other) => match (value.as_number(), other.as_number()) {
                            (Ok(mine), Ok(theirs)) => {
                                let margin = theirs.abs() * KNOWN_ATTRIBUTE_MARGIN;
                                let (improves, worsens) = match merit {
                                    Merit::BiggerIsBetter => {
                                        (mine > theirs + margin, mine < theirs - margin)
                                    }
                                    Merit::SmallerIsBetter => {
                                        (mine < theirs - margin, mine > theirs + margin)
                                    }
                                };
                                if improves {
                                    better_known = true;
                                } else if worsens {
                                    all_known_better = false;
                                }
                            }
                            _ => debug!(
                                attribute = %attr_name,
                                "non-numeric known attribute comparison skipped"
                            ),
                        },
                    }
                }

                trace!(
                    edge = %edge.name,
                    existing = %srg_edge.name,
                    fixed_equal,
                    better_known,
                    "compared output edge to existing edge"
                );

                redundant = fixed_equal
                    && !better_known
                    && (!self.config.allow_worse_edges
                        || matching.info_sources == srg_edge.data.info_sources);

                // Does the new edge dominate an existing subgraph outright?
                if fixed_equal && better_known && all_known_better {
                    let depends = pattern.subgraph.input_edges().any(|input| {
                        matching
                            .srg_edge_for(&input.name)
                            .and_then(|n| self.srg.graph().edge(n).ok())
                            .map(|e| {
                                self.subgraph_depends_on(
                                    &e.data.subgraph_id,
                                    &srg_edge.data.subgraph_id,
                                )
                            })
                            .unwrap_or(false)
                    });
                    if !depends {
                        supersedes.push(srg_edge.data.subgraph_id.clone());
                    }
                }
            }

            if !redundant {
                creates_new_edge = true;
            }
        }

        creates_new_edge
    }

    /// Returns true if `start` transitively consumes an edge owned by
    /// `target`. Iterative walk with a visited set; input-edge references
    /// are the dependency arrows.
    #[must_use]
    pub fn subgraph_depends_on(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start.to_string()];
        let mut visited: BTreeSet<String> = BTreeSet::new();

        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(entry) = self.repository.get(&id) else {
                continue;
            };
            for edge in entry.subgraph.input_edges() {
                if let Some(edge_ref) = &edge.data.edge_ref {
                    stack.push(edge_ref.subgraph_id.clone());
                }
            }
        }
        false
    }

    /// Instantiates a matched pattern: a deep copy of its structure with
    /// qualified names transferred, expanded output attributes moved in,
    /// and input edges carrying references to their bound SRG edges.
    fn instantiate(
        &self,
        pattern: &CompiledPattern,
        matching: &mut Matching,
    ) -> SrqlResult<Subgraph> {
        let mut instance = Subgraph::new(String::new(), pattern.name.clone());
        instance.dataflow_configuration = pattern.subgraph.dataflow_configuration.clone();
        instance.dataflow_attributes = pattern.subgraph.dataflow_attributes.clone();

        for node in pattern.subgraph.graph.nodes() {
            let srg_id = matching
                .srg_node_for(&node.name)
                .map(str::to_string)
                .ok_or_else(|| {
                    SrqlError::internal(format!("node '{}' unmatched at instantiation", node.name))
                })?;
            let srg_node = self.srg.graph().node(&srg_id)?;

            let mut attributes = node.data.attributes.clone();
            attributes.merge(&srg_node.data.attributes);
            if node.data.is_output() {
                if let Some(expanded) = matching.expanded_node_attributes.remove(&node.name) {
                    attributes.merge(&expanded);
                }
            }

            let data = SubgraphNode {
                tag: node.data.tag,
                qualified_name: srg_id,
                attributes,
                // The instance is fully qualified; nothing left to match.
                predicates: Vec::new(),
                expressions: node.data.expressions.clone(),
            };
            instance.add_node(node.name.clone(), data)?;
        }

        for edge in pattern.subgraph.graph.edges() {
            match edge.data.tag {
                InOut::Input => {
                    let srg_edge_name = matching.srg_edge_for(&edge.name).ok_or_else(|| {
                        SrqlError::internal(format!(
                            "edge '{}' unmatched at instantiation",
                            edge.name
                        ))
                    })?;
                    let srg_edge = self.srg.graph().edge(srg_edge_name)?;

                    let mut data = SubgraphEdge::input();
                    data.attributes.merge(&srg_edge.data.attributes);
                    data.edge_ref = Some(EdgeRef::new(
                        srg_edge.data.subgraph_id.clone(),
                        srg_edge.data.local_name.clone(),
                    )?);
                    instance.add_edge(edge.name.clone(), &edge.source, &edge.target, data)?;
                }
                InOut::Output => {
                    let mut data = SubgraphEdge::output();
                    data.attributes = matching
                        .expanded_edge_attributes
                        .remove(&edge.name)
                        .unwrap_or_default();
                    instance.add_edge(edge.name.clone(), &edge.source, &edge.target, data)?;
                }
            }
        }

        Ok(instance)
    }

    /// Applies a decided match: instantiates the pattern, inserts its
    /// output edges into the SRG, and wires up dependant back-links.
    fn apply_detected(
        &mut self,
        pattern: &CompiledPattern,
        matching: &mut Matching,
    ) -> SrqlResult<()> {
        let instance_id = format!("{}{}", pattern.name, self.next_instance_id);
        self.next_instance_id += 1;

        let mut instance = self.instantiate(pattern, matching)?;
        instance.id = instance_id.clone();

        for edge in pattern.subgraph.input_edges() {
            let srg_edge_name = matching.srg_edge_for(&edge.name).ok_or_else(|| {
                SrqlError::internal(format!("edge '{}' unmatched at apply", edge.name))
            })?;
            self.srg
                .edge_data_mut(srg_edge_name)?
                .dependants
                .insert(instance_id.clone());
        }

        for edge in pattern.subgraph.output_edges() {
            let (Some(source), Some(target)) = (
                matching.srg_node_for(&edge.source).map(str::to_string),
                matching.srg_node_for(&edge.target).map(str::to_string),
            ) else {
                return Err(SrqlError::internal(format!(
                    "output edge '{}' endpoint unmatched at apply",
                    edge.name
                )));
            };

            let global_name = format!("{instance_id}:{}", edge.name);
            let attributes = instance.graph.edge(&edge.name)?.data.attributes.clone();
            let data = SrgEdgeData {
                attributes,
                subgraph_id: instance_id.clone(),
                local_name: edge.name.clone(),
                pattern_name: pattern.name.clone(),
                info_sources: matching.info_sources.clone(),
                dependants: BTreeSet::new(),
            };
            self.srg.add_edge(&global_name, &source, &target, data)?;
        }

        debug!(id = %instance_id, pattern = %pattern.name, "applied pattern instance");
        self.repository.insert(
            instance_id,
            InstantiatedSubgraph {
                subgraph: instance,
                client_id: pattern.client_id.clone(),
            },
        );
        Ok(())
    }

    /// Answers every registered query, in registration order. Responses
    /// group by the owning client of each collected subgraph.
    #[must_use]
    pub fn process_queries(&self) -> BTreeMap<String, Vec<QueryResponse>> {
        let mut results: BTreeMap<String, Vec<QueryResponse>> = BTreeMap::new();

        for query in &self.queries {
            let mut matches = query.find_matches(&self.srg);
            for matching in &mut matches {
                self.expand_matching(query, matching);
            }

            let selected: Vec<usize> = if query.subgraph.only_best_edge_match {
                self.select_best_match(query, &matches).into_iter().collect()
            } else {
                (0..matches.len()).collect()
            };

            for index in selected {
                let subgraphs = match self.generate_response(query, &mut matches[index]) {
                    Ok(subgraphs) => subgraphs,
                    Err(e) => {
                        warn!(query = %query.name, error = %e, "discarding query match");
                        continue;
                    }
                };

                for instantiated in subgraphs {
                    let client_responses = results.entry(instantiated.client_id.clone()).or_default();
                    let start_new = client_responses
                        .last()
                        .map_or(true, |r| r.query_name != query.name);
                    if start_new {
                        client_responses.push(QueryResponse {
                            query_name: query.name.clone(),
                            client_id: instantiated.client_id.clone(),
                            graphs: Vec::new(),
                        });
                    }
                    client_responses
                        .last_mut()
                        .expect("just ensured non-empty")
                        .graphs
                        .push(instantiated.subgraph);
                }
            }
        }

        results
    }

    /// Evaluates the best-match cost for every match and returns the index
    /// of the minimum, if any match exists. Expression errors fall back to
    /// the default source-count cost.
    fn select_best_match(&self, query: &CompiledPattern, matches: &[Matching]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;

        for (index, matching) in matches.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let mut cost = match self.config.default_best_match {
                BestMatchSelection::LeastSources => matching.info_sources.len() as f64,
                BestMatchSelection::MostSources => -(matching.info_sources.len() as f64),
            };

            if let Some(expr) = &query.subgraph.best_match_expression {
                let ctx = EvaluationContext::global(matching, &self.srg);
                match expr.eval(&ctx).and_then(|v| v.as_number()) {
                    Ok(value) => cost = value,
                    Err(e) => {
                        debug!(query = %query.name, error = %e, "best-match expression failed");
                    }
                }
            }

            debug!(query = %query.name, cost, "evaluated best-match cost");
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((index, cost));
            }
        }

        best.map(|(index, _)| index)
    }

    /// Generates the response for one query match: the instantiated query
    /// plus every instantiated subgraph transitively reachable through
    /// input-edge references. The query instance's id is derived from its
    /// edge references so repeat queries reuse ids.
    fn generate_response(
        &self,
        query: &CompiledPattern,
        matching: &mut Matching,
    ) -> SrqlResult<Vec<InstantiatedSubgraph>> {
        let mut instance = self.instantiate(query, matching)?;

        let mut reference_stack: Vec<EdgeRef> = Vec::new();
        let mut collected: BTreeSet<String> = BTreeSet::new();
        let mut repeatable_id = String::new();

        for edge in instance.input_edges() {
            if let Some(edge_ref) = &edge.data.edge_ref {
                if collected.insert(edge_ref.subgraph_id.clone()) {
                    reference_stack.push(edge_ref.clone());
                }
                repeatable_id.push_str(&edge_ref.subgraph_id);
                repeatable_id.push(':');
                repeatable_id.push_str(&edge_ref.edge_name);
                repeatable_id.push('%');
            }
        }

        instance.id = format!("{}{:x}", query.name, crc32fast::hash(repeatable_id.as_bytes()));

        let mut collection = vec![InstantiatedSubgraph {
            subgraph: instance,
            client_id: query.client_id.clone(),
        }];

        while let Some(reference) = reference_stack.pop() {
            let Some(entry) = self.repository.get(&reference.subgraph_id) else {
                warn!(subgraph_id = %reference.subgraph_id, "referenced subgraph missing");
                continue;
            };

            for edge in entry.subgraph.graph.edges() {
                if let Some(edge_ref) = &edge.data.edge_ref {
                    if collected.insert(edge_ref.subgraph_id.clone()) {
                        reference_stack.push(edge_ref.clone());
                    }
                }
            }

            collection.push(entry.clone());
        }

        Ok(collection)
    }

    /// Removes a query by name and owning client.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::QueryNotFound`] if absent.
    pub fn delete_query(&mut self, query_name: &str, client_id: &str) -> SrqlResult<()> {
        info!(client_id, name = query_name, "deleting query");

        let position = self
            .queries
            .iter()
            .position(|q| q.client_id == client_id && q.name == query_name)
            .ok_or_else(|| ValidationError::QueryNotFound {
                name: query_name.to_string(),
                client_id: client_id.to_string(),
            })?;
        self.queries.remove(position);
        Ok(())
    }

    /// Removes a pattern and cascade-deletes every SRG edge derived by one
    /// of its instances.
    ///
    /// # Errors
    ///
    /// Propagates cascade errors from [`Resolver::delete_srg`].
    pub fn delete_pattern(&mut self, pattern_name: &str, client_id: &str) -> SrqlResult<()> {
        info!(client_id, name = pattern_name, "deleting pattern");

        // Cascades invalidate any edge iteration, so rescan after each hit.
        loop {
            let instance_id = self.srg.graph().edges().find_map(|edge| {
                let entry = self.repository.get(&edge.data.subgraph_id)?;
                (entry.subgraph.name == pattern_name && entry.client_id == client_id)
                    .then(|| edge.data.subgraph_id.clone())
            });
            match instance_id {
                Some(id) => self.delete_srg(&id)?,
                None => break,
            }
        }

        if let Some(position) = self
            .patterns
            .iter()
            .position(|p| p.client_id == client_id && p.name == pattern_name)
        {
            self.patterns.remove(position);
        }
        Ok(())
    }

    /// Deletes a subgraph and, transitively, everything that depends on
    /// it: depth-first over the dependant sets, removing owned output
    /// edges as it goes and deferring node removal until the walk is done.
    ///
    /// Deleting an id that is no longer registered is a no-op; cascades
    /// may reach a subgraph through several routes.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the SRG and repository disagree, which
    /// valid inputs cannot produce.
    pub fn delete_srg(&mut self, primal_subgraph_id: &str) -> SrqlResult<()> {
        debug!(subgraph_id = primal_subgraph_id, "deleting SRG subgraph");

        let mut delete_stack: Vec<String> = vec![primal_subgraph_id.to_string()];
        let mut scheduled: BTreeSet<String> = BTreeSet::new();
        let mut removable_nodes: BTreeSet<String> = BTreeSet::new();

        while let Some(subgraph_id) = delete_stack.pop() {
            let Some(entry) = self.repository.get(&subgraph_id) else {
                debug!(subgraph_id = %subgraph_id, "subgraph already removed");
                continue;
            };
            let subgraph = entry.subgraph.clone();

            for edge in subgraph.graph.edges() {
                if edge.data.is_input() {
                    // Drop the dependant back-link from the referenced edge.
                    let Some(edge_ref) = &edge.data.edge_ref else {
                        continue;
                    };
                    let referenced = edge_ref.srg_edge_name();
                    if self.srg.has_edge(&referenced) {
                        trace!(edge = %referenced, "removing dependant link");
                        self.srg.edge_data_mut(&referenced)?.dependants.remove(&subgraph_id);
                    } else {
                        trace!(edge = %referenced, "referenced edge already gone");
                    }
                }
                if edge.data.is_output() {
                    let global_name = format!("{subgraph_id}:{}", edge.name);
                    let srg_edge = self.srg.graph().edge(&global_name).map_err(|_| {
                        SrqlError::internal(format!("owned edge '{global_name}' missing from SRG"))
                    })?;

                    for dependant in srg_edge.data.dependants.clone() {
                        if scheduled.insert(dependant.clone()) {
                            delete_stack.push(dependant);
                        }
                    }

                    trace!(edge = %global_name, "removing output edge");
                    self.srg.remove_edge(&global_name)?;
                }
            }

            for node in subgraph.graph.nodes() {
                if !node.data.is_output() {
                    continue;
                }
                let qualified = &node.data.qualified_name;
                if !self.srg.has_node(qualified) {
                    return Err(SrqlError::internal(format!(
                        "registered node '{qualified}' missing from SRG"
                    )));
                }

                let data = self.srg.node_data_mut(qualified)?;
                data.spawners.remove(&subgraph_id);
                data.back_refs
                    .remove(&NodeRef::new(subgraph_id.clone(), node.name.clone()));

                // Deferred: removal mid-walk would invalidate edges other
                // stack entries still refer to.
                if data.spawners.is_empty() {
                    trace!(node = %qualified, "marking node for removal");
                    removable_nodes.insert(qualified.clone());
                }
            }

            self.repository.remove(&subgraph_id);
        }

        for node_id in removable_nodes {
            debug!(node = %node_id, "removing node");
            self.srg.remove_node(&node_id)?;
        }

        Ok(())
    }

    /// Logs the current SRG state at debug level, sorted so the output is
    /// reproducible run to run.
    pub fn log_srg_state(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let mut dump = String::new();
        for node in self.srg.graph().nodes() {
            dump.push_str(&format!("{}: {}\n", node.name, node.data.attributes));

            let mut out_edges: Vec<_> = node
                .out_edges()
                .iter()
                .filter_map(|name| self.srg.graph().edge(name).ok())
                .collect();
            out_edges.sort_by(|a, b| {
                (a.target.as_str(), a.data.attributes.get_text("type"), &a.name)
                    .cmp(&(b.target.as_str(), b.data.attributes.get_text("type"), &b.name))
            });

            for edge in out_edges {
                let sources: Vec<&str> =
                    edge.data.info_sources.iter().map(String::as_str).collect();
                dump.push_str(&format!(
                    "\t-> {} [{}] {} < {} >\n",
                    edge.target,
                    edge.name,
                    edge.data.attributes,
                    sources.join(" ")
                ));
            }
        }
        debug!(
            nodes = self.srg.graph().order(),
            edges = self.srg.graph().size(),
            instances = self.repository.len(),
            "current SRG:\n{dump}"
        );
    }
}
