use std::collections::BTreeSet;

use srql::{Expr, Pred, Resolver, Subgraph, SubgraphEdge, SubgraphNode};

/// A base fact: one pose edge X -> Y with the given latency.
fn pose_base(id: &str, latency: f64) -> Subgraph {
    let mut sg = Subgraph::new(id, format!("tracker-{id}"));
    sg.add_node("n1", SubgraphNode::output().with_qualified_name("X"))
        .unwrap();
    sg.add_node("n2", SubgraphNode::output().with_qualified_name("Y"))
        .unwrap();
    sg.add_edge(
        "e1",
        "n1",
        "n2",
        SubgraphEdge::output()
            .with_attribute("type", "pose")
            .with_attribute("latency", latency),
    )
    .unwrap();
    sg
}

/// A pattern inverting a pose edge, propagating latency.
fn inverter() -> Subgraph {
    let mut sg = Subgraph::new("P", "inverter");
    sg.add_node("u", SubgraphNode::input()).unwrap();
    sg.add_node("v", SubgraphNode::input()).unwrap();
    sg.add_edge(
        "in",
        "u",
        "v",
        SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
    )
    .unwrap();
    sg.add_edge(
        "out",
        "v",
        "u",
        SubgraphEdge::output()
            .with_attribute("type", "pose")
            .with_expression("latency", Expr::object_attr("in", "latency")),
    )
    .unwrap();
    sg
}

/// A query for any pose edge.
fn pose_query(id: &str, name: &str) -> Subgraph {
    let mut sg = Subgraph::new(id, name);
    sg.add_node("a", SubgraphNode::input()).unwrap();
    sg.add_node("b", SubgraphNode::input()).unwrap();
    sg.add_edge(
        "wanted",
        "a",
        "b",
        SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
    )
    .unwrap();
    sg
}

#[test]
fn trivial_derivation_answers_query() {
    // E1: base fact + inverting pattern + query for the inverse.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 20.0), "driver").unwrap();
    resolver.register_pattern(inverter(), "provider");

    let mut query = Subgraph::new("Q", "inverse-wanted");
    query.add_node("a", SubgraphNode::input()).unwrap();
    query.add_node("b", SubgraphNode::input()).unwrap();
    query
        .add_edge(
            "wanted",
            "a",
            "b",
            SubgraphEdge::input()
                .with_predicate(Pred::attr_equals("type", "pose"))
                .with_predicate(Pred::attr_equals("latency", 20.0)),
        )
        .unwrap();
    resolver.register_query(query, "app");

    assert_eq!(resolver.apply_all_patterns(), 1);

    let responses = resolver.process_queries();

    // The application receives its query instances; the pattern provider
    // and the driver each receive the subgraphs they own.
    assert!(responses.contains_key("app"));
    assert!(responses.contains_key("provider"));
    assert!(responses.contains_key("driver"));

    let provider_graphs: Vec<&Subgraph> = responses["provider"]
        .iter()
        .flat_map(|r| r.graphs.iter())
        .collect();
    assert!(provider_graphs.iter().any(|g| g.name == "inverter"));

    let driver_graphs: Vec<&Subgraph> = responses["driver"]
        .iter()
        .flat_map(|r| r.graphs.iter())
        .collect();
    assert!(driver_graphs.iter().any(|g| g.id == "A"));
}

#[test]
fn disjoint_sources_prune_inverse_fusion() {
    // E2: deriving a pose from an edge and its own inverse is the trivial
    // fusion the disjointness stage exists to kill.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 20.0), "driver").unwrap();
    resolver.register_pattern(inverter(), "provider");
    assert_eq!(resolver.apply_all_patterns(), 1);

    // Chain pattern: u -> v -> w fused into u -> w. The only matches pair
    // the base edge with its own inverse, sharing info-source A:e1.
    let mut chain = Subgraph::new("C", "chain");
    chain.add_node("u", SubgraphNode::input()).unwrap();
    chain.add_node("v", SubgraphNode::input()).unwrap();
    chain.add_node("w", SubgraphNode::input()).unwrap();
    chain
        .add_edge(
            "first",
            "u",
            "v",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    chain
        .add_edge(
            "second",
            "v",
            "w",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    chain
        .add_edge(
            "fused",
            "u",
            "w",
            SubgraphEdge::output().with_attribute("type", "pose"),
        )
        .unwrap();
    resolver.register_pattern(chain, "provider");

    // No chain instance is applied: every candidate shares A:e1 on both
    // inputs.
    let edges_before = resolver.srg().graph().size();
    assert_eq!(resolver.apply_all_patterns(), 0);
    assert_eq!(resolver.srg().graph().size(), edges_before);
    assert!(!resolver
        .srg()
        .graph()
        .edges()
        .any(|e| e.data.pattern_name == "chain"));
}

#[test]
fn supersession_replaces_worse_chain() {
    // E3: a better base arrives and its derivation chain supersedes the
    // old one.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
    resolver.register_pattern(inverter(), "provider");
    assert_eq!(resolver.apply_all_patterns(), 1);

    let old_instance: String = resolver
        .srg()
        .graph()
        .edges()
        .find(|e| e.data.pattern_name == "inverter")
        .map(|e| e.data.subgraph_id.clone())
        .unwrap();
    assert_eq!(
        resolver
            .srg()
            .graph()
            .edge(&format!("{old_instance}:out"))
            .unwrap()
            .data
            .attributes
            .get_text("latency"),
        "30"
    );

    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();
    resolver.apply_all_patterns();

    // The old instance is gone; the surviving inverse runs on B's data.
    assert!(resolver.repository_get(&old_instance).is_none());
    let inverses: Vec<_> = resolver
        .srg()
        .graph()
        .edges()
        .filter(|e| e.data.pattern_name == "inverter")
        .collect();
    assert_eq!(inverses.len(), 1);
    assert!(inverses[0].data.info_sources.contains("B:e1"));
    assert_eq!(inverses[0].data.attributes.get_text("latency"), "10");
}

#[test]
fn supersession_spares_its_own_ancestry() {
    // E3, dependency guard: an improvement computed *from* a subgraph must
    // not delete that subgraph.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();

    // Halves the latency of an existing pose edge in place.
    let mut halver = Subgraph::new("H", "halver");
    halver.add_node("u", SubgraphNode::input()).unwrap();
    halver.add_node("v", SubgraphNode::input()).unwrap();
    halver
        .add_edge(
            "in",
            "u",
            "v",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    halver
        .add_edge(
            "out",
            "u",
            "v",
            SubgraphEdge::output()
                .with_attribute("type", "pose")
                .with_expression(
                    "latency",
                    Expr::Binary(
                        srql::BinaryOp::Div,
                        Box::new(Expr::object_attr("in", "latency")),
                        Box::new(Expr::constant(2.0)),
                    ),
                ),
        )
        .unwrap();
    resolver.register_pattern(halver, "provider");

    assert!(resolver.apply_all_patterns() > 0);

    // The derived edge dominates A:e1 on every known attribute, but it
    // depends on A, so A survives.
    assert!(resolver.repository_get("A").is_some());
    assert!(resolver.srg().has_edge("A:e1"));
}

#[test]
fn multi_output_subgraphs_are_never_superseded() {
    // The supersession queue only deletes single-output subgraphs.
    let mut resolver = Resolver::default();

    let mut base = pose_base("A", 30.0);
    base.add_edge(
        "e2",
        "n2",
        "n1",
        SubgraphEdge::output()
            .with_attribute("type", "pose")
            .with_attribute("latency", 50.0),
    )
    .unwrap();
    resolver.register_srg(base, "driver").unwrap();
    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();

    // Halves the latency of an existing pose edge in place. Derived from
    // B, its output dominates A's e1 on every known attribute.
    let mut halver = Subgraph::new("H", "halver");
    halver.add_node("u", SubgraphNode::input()).unwrap();
    halver.add_node("v", SubgraphNode::input()).unwrap();
    halver
        .add_edge(
            "in",
            "u",
            "v",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    halver
        .add_edge(
            "out",
            "u",
            "v",
            SubgraphEdge::output()
                .with_attribute("type", "pose")
                .with_expression(
                    "latency",
                    Expr::Binary(
                        srql::BinaryOp::Div,
                        Box::new(Expr::object_attr("in", "latency")),
                        Box::new(Expr::constant(2.0)),
                    ),
                ),
        )
        .unwrap();
    resolver.register_pattern(halver, "provider");
    resolver.apply_all_patterns();

    // A is dominated but has two output edges, so it must survive.
    assert!(resolver.repository_get("A").is_some());
    assert!(resolver.srg().has_edge("A:e1"));
    assert!(resolver.srg().has_edge("A:e2"));
    assert!(resolver.repository_get("B").is_some());
}

#[test]
fn info_source_closure_holds_after_fixed_point() {
    // Property: every derived edge's info-sources equal the union over
    // its subgraph's input references; base edges are their own atom.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();
    resolver.register_pattern(inverter(), "provider");
    for _ in 0..srql::MAX_FIXED_POINT_ROUNDS {
        if resolver.apply_all_patterns() == 0 {
            break;
        }
    }

    for edge in resolver.srg().graph().edges() {
        let owner = resolver
            .repository_get(&edge.data.subgraph_id)
            .expect("every SRG edge has a repository entry");

        let mut expected: BTreeSet<String> = BTreeSet::new();
        let mut has_inputs = false;
        for input in owner.subgraph.input_edges() {
            has_inputs = true;
            let reference = input.data.edge_ref.as_ref().unwrap();
            let referenced = resolver
                .srg()
                .graph()
                .edge(&reference.srg_edge_name())
                .unwrap();
            expected.extend(referenced.data.info_sources.iter().cloned());
        }
        if !has_inputs {
            expected.insert(edge.name.clone());
        }

        assert_eq!(edge.data.info_sources, expected, "edge {}", edge.name);
    }
}

#[test]
fn novelty_holds_after_fixed_point() {
    // Property: no two edges with the same endpoints are fixed-equal with
    // equal sources once the fixed point is reached.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();
    resolver.register_pattern(inverter(), "provider");
    for _ in 0..srql::MAX_FIXED_POINT_ROUNDS {
        if resolver.apply_all_patterns() == 0 {
            break;
        }
    }

    let edges: Vec<_> = resolver.srg().graph().edges().collect();
    for a in &edges {
        for b in &edges {
            if a.name == b.name || a.source != b.source || a.target != b.target {
                continue;
            }
            let same_attributes = a.data.attributes == b.data.attributes;
            let same_sources = a.data.info_sources == b.data.info_sources;
            assert!(
                !(same_attributes && same_sources),
                "edges {} and {} are redundant",
                a.name,
                b.name
            );
        }
    }
}

#[test]
fn replay_reaches_equivalent_srg() {
    // Property: feeding the same base facts and patterns into a fresh
    // resolver reproduces the SRG up to newly minted instance ids.
    let run = || {
        let mut resolver = Resolver::default();
        resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
        resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();
        resolver.register_pattern(inverter(), "provider");
        for _ in 0..srql::MAX_FIXED_POINT_ROUNDS {
            if resolver.apply_all_patterns() == 0 {
                break;
            }
        }

        let mut edges: Vec<String> = resolver
            .srg()
            .graph()
            .edges()
            .map(|e| {
                format!(
                    "{}->{} {} {} <{}>",
                    e.source,
                    e.target,
                    e.data.pattern_name,
                    e.data.attributes,
                    e.data
                        .info_sources
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(",")
                )
            })
            .collect();
        edges.sort();
        edges
    };

    assert_eq!(run(), run());
}

#[test]
fn best_match_expression_picks_lowest_cost() {
    // E6: two matches differing only in computed latency; the best-match
    // expression keeps the cheaper one.
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();

    let mut query = pose_query("Q", "fastest-pose");
    query.only_best_edge_match = true;
    query.best_match_expression = Some(Expr::object_attr("wanted", "latency"));
    resolver.register_query(query, "app");

    let responses = resolver.process_queries();
    let app_graphs: Vec<&Subgraph> = responses["app"]
        .iter()
        .flat_map(|r| r.graphs.iter())
        .collect();

    // One query instance, resolved through B only.
    assert_eq!(app_graphs.len(), 1);
    let reference = app_graphs[0]
        .graph
        .edge("wanted")
        .unwrap()
        .data
        .edge_ref
        .as_ref()
        .unwrap();
    assert_eq!(reference.subgraph_id, "B");

    let driver_graphs: Vec<&Subgraph> = responses["driver"]
        .iter()
        .flat_map(|r| r.graphs.iter())
        .collect();
    assert!(driver_graphs.iter().any(|g| g.id == "B"));
    assert!(!driver_graphs.iter().any(|g| g.id == "A"));
}

#[test]
fn best_match_without_expression_prefers_fewest_sources() {
    let mut resolver = Resolver::default();
    resolver.register_srg(pose_base("A", 30.0), "driver").unwrap();
    resolver.register_srg(pose_base("B", 10.0), "driver").unwrap();

    // Fuse the two bases into a two-source edge.
    let mut fusion = Subgraph::new("F", "fuser");
    fusion.add_node("u", SubgraphNode::input()).unwrap();
    fusion.add_node("v", SubgraphNode::input()).unwrap();
    fusion
        .add_edge(
            "in1",
            "u",
            "v",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    fusion
        .add_edge(
            "in2",
            "u",
            "v",
            SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
        )
        .unwrap();
    fusion
        .add_edge(
            "out",
            "u",
            "v",
            SubgraphEdge::output().with_attribute("type", "pose"),
        )
        .unwrap();
    resolver.register_pattern(fusion, "provider");
    resolver.apply_all_patterns();

    let mut query = pose_query("Q", "any-pose");
    query.only_best_edge_match = true;
    resolver.register_query(query, "app");

    let responses = resolver.process_queries();
    let app_graphs: Vec<&Subgraph> = responses["app"]
        .iter()
        .flat_map(|r| r.graphs.iter())
        .collect();
    assert_eq!(app_graphs.len(), 1);

    // Least-sources selection: a single-source base beats the fused edge.
    let reference = app_graphs[0]
        .graph
        .edge("wanted")
        .unwrap()
        .data
        .edge_ref
        .as_ref()
        .unwrap();
    assert!(reference.subgraph_id == "A" || reference.subgraph_id == "B");
}
