use srql::{Expr, Pred, Resolver, Server, Subgraph, SubgraphEdge, SubgraphNode};

fn pose_base(id: &str, from: &str, to: &str, latency: f64) -> Subgraph {
    let mut sg = Subgraph::new(id, format!("tracker-{id}"));
    sg.add_node("n1", SubgraphNode::output().with_qualified_name(from))
        .unwrap();
    sg.add_node("n2", SubgraphNode::output().with_qualified_name(to))
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

/// Chains two pose edges into one.
fn chain() -> Subgraph {
    let mut sg = Subgraph::new("C", "chain");
    sg.add_node("u", SubgraphNode::input()).unwrap();
    sg.add_node("v", SubgraphNode::input()).unwrap();
    sg.add_node("w", SubgraphNode::input()).unwrap();
    sg.add_edge(
        "first",
        "u",
        "v",
        SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
    )
    .unwrap();
    sg.add_edge(
        "second",
        "v",
        "w",
        SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
    )
    .unwrap();
    sg.add_edge(
        "combined",
        "u",
        "w",
        SubgraphEdge::output().with_attribute("type", "pose"),
    )
    .unwrap();
    sg
}

fn fixed_point(resolver: &mut Resolver) {
    for _ in 0..srql::MAX_FIXED_POINT_ROUNDS {
        if resolver.apply_all_patterns() == 0 {
            break;
        }
    }
}

#[test]
fn cascade_removes_all_transitive_dependants() {
    // X -> Y -> Z, chained into X -> Z; deleting the first base must take
    // the chain instance with it.
    let mut resolver = Resolver::default();
    resolver
        .register_srg(pose_base("A", "X", "Y", 20.0), "driver")
        .unwrap();
    resolver
        .register_srg(pose_base("B", "Y", "Z", 10.0), "driver")
        .unwrap();
    resolver.register_pattern(chain(), "provider");
    fixed_point(&mut resolver);

    let chain_instances: Vec<String> = resolver
        .srg()
        .graph()
        .edges()
        .filter(|e| e.data.pattern_name == "chain")
        .map(|e| e.data.subgraph_id.clone())
        .collect();
    assert_eq!(chain_instances.len(), 1);

    resolver.delete_srg("A").unwrap();

    // No edge owned by A, no edge with A's subgraphs in its dependants,
    // and everything that depended on A transitively is gone too.
    assert!(resolver.repository_get("A").is_none());
    assert!(resolver.repository_get(&chain_instances[0]).is_none());
    for edge in resolver.srg().graph().edges() {
        assert_ne!(edge.data.subgraph_id, "A");
        assert!(!edge.data.dependants.contains("A"));
        assert!(!edge.data.dependants.contains(&chain_instances[0]));
    }

    // B stands alone; its node Y lost A as a spawner but survives, X is
    // gone entirely.
    assert!(resolver.srg().has_edge("B:e1"));
    assert!(resolver.srg().has_node("Y"));
    assert!(!resolver.srg().has_node("X"));
}

#[test]
fn dependants_closure_holds_while_instances_live() {
    // Property: every dependant of an SRG edge has an input edge whose
    // reference resolves to it.
    let mut resolver = Resolver::default();
    resolver
        .register_srg(pose_base("A", "X", "Y", 20.0), "driver")
        .unwrap();
    resolver
        .register_srg(pose_base("B", "Y", "Z", 10.0), "driver")
        .unwrap();
    resolver.register_pattern(chain(), "provider");
    resolver.register_pattern(inverter(), "provider");
    fixed_point(&mut resolver);

    for edge in resolver.srg().graph().edges() {
        for dependant in &edge.data.dependants {
            let entry = resolver
                .repository_get(dependant)
                .expect("dependant subgraph must be registered");
            let resolves = entry.subgraph.input_edges().any(|input| {
                input
                    .data
                    .edge_ref
                    .as_ref()
                    .is_some_and(|r| r.srg_edge_name() == edge.name)
            });
            assert!(resolves, "dependant {dependant} does not reference {}", edge.name);
        }
    }
}

#[test]
fn deleting_a_pattern_cascades_through_its_instances() {
    let mut resolver = Resolver::default();
    resolver
        .register_srg(pose_base("A", "X", "Y", 20.0), "driver")
        .unwrap();
    resolver.register_pattern(inverter(), "provider");
    resolver.register_pattern(chain(), "provider");
    fixed_point(&mut resolver);

    // The chain combines A with its own inverse only when sources allow;
    // under disjoint sources nothing chains, but inverses exist.
    assert!(resolver
        .srg()
        .graph()
        .edges()
        .any(|e| e.data.pattern_name == "inverter"));

    resolver.delete_pattern("inverter", "provider").unwrap();

    assert!(!resolver
        .srg()
        .graph()
        .edges()
        .any(|e| e.data.pattern_name == "inverter"));
    // The base edge holds no stale dependant entries.
    let base = resolver.srg().graph().edge("A:e1").unwrap();
    assert!(base.data.dependants.is_empty());
    // Re-running changes nothing: the pattern is gone.
    assert_eq!(resolver.apply_all_patterns(), 0);
}

#[test]
fn deleting_an_announced_pattern_by_unknown_id_uses_name_fallback() {
    let mut server = Server::default();
    server
        .process_announcement(pose_base("A", "X", "Y", 20.0), "c1")
        .unwrap();

    let mut pattern = inverter();
    pattern.id = "P1".to_string();
    server.process_announcement(pattern, "c1").unwrap();
    server.generate_documents().unwrap();

    // The deletion subgraph's id does not match any announcement, so the
    // server falls back to deleting the pattern by name.
    let mut marker = Subgraph::deletion_marker("unknown-id");
    marker.name = "inverter".to_string();
    server.process_announcement(marker, "c1").unwrap();

    assert!(!server
        .resolver()
        .srg()
        .graph()
        .edges()
        .any(|e| e.data.pattern_name == "inverter"));
}

#[test]
fn deleting_unknown_query_is_an_error() {
    let mut resolver = Resolver::default();
    let err = resolver.delete_query("no-such-query", "c1").unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn deregistering_a_client_cascades_across_clients() {
    // c2's pattern instances consume c1's base; deregistering c1 removes
    // them through the dependant links.
    let mut server = Server::default();
    server
        .process_announcement(pose_base("A", "X", "Y", 20.0), "c1")
        .unwrap();
    server.process_announcement(inverter(), "c2").unwrap();
    server.generate_documents().unwrap();
    assert!(server
        .resolver()
        .srg()
        .graph()
        .edges()
        .any(|e| e.data.pattern_name == "inverter"));

    server.deregister_client("c1").unwrap();

    assert_eq!(server.resolver().srg().graph().size(), 0);
    assert_eq!(server.resolver().srg().graph().order(), 0);
    // c2's pattern itself stays registered; only its instances died with
    // the base.
    assert!(server.announcements().has("c2:P"));
}
