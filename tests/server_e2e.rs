use std::collections::BTreeSet;

use srql::{
    AnnouncementKind, Document, Pred, Server, Subgraph, SubgraphEdge, SubgraphNode,
};

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

fn sent_ids(document: &Document) -> BTreeSet<String> {
    document.subgraphs.iter().map(|s| s.id.clone()).collect()
}

#[test]
fn per_client_diff_sends_only_changes() {
    // E4: kept subgraphs are omitted, new ones sent, dropped ones marked.
    let mut server = Server::default();
    server.process_announcement(pose_base("A", 20.0), "c1").unwrap();
    server
        .process_announcement(pose_query("Q1", "wanted"), "c1")
        .unwrap();

    let docs = server.generate_documents().unwrap();
    let first = sent_ids(&docs["c1"]);
    assert!(first.contains("A"));
    assert_eq!(first.len(), 2);

    // A second base extends the response; only the new subgraph travels.
    server.process_announcement(pose_base("B", 10.0), "c1").unwrap();
    let docs = server.generate_documents().unwrap();
    let second = sent_ids(&docs["c1"]);
    assert!(second.contains("B"));
    assert!(!second.contains("A"));
    // A second match of the same query means a second query instance.
    assert_eq!(second.len(), 2);

    // Dropping B turns exactly its additions into deletion markers.
    server
        .process_announcement(Subgraph::deletion_marker("B"), "c1")
        .unwrap();
    let docs = server.generate_documents().unwrap();
    let markers: BTreeSet<String> = docs["c1"]
        .subgraphs
        .iter()
        .filter(|s| s.kind() == AnnouncementKind::Deletion)
        .map(|s| s.id.clone())
        .collect();
    assert_eq!(markers, second);
    // Nothing else travels.
    assert_eq!(sent_ids(&docs["c1"]), markers);
}

#[test]
fn kept_plus_sent_equals_new_state() {
    // Property: for each client, kept + newly sent = new state, and the
    // deletion markers are exactly old state minus new state.
    let mut server = Server::default();
    server.process_announcement(pose_base("A", 20.0), "c1").unwrap();
    server
        .process_announcement(pose_query("Q1", "wanted"), "c1")
        .unwrap();
    server.generate_documents().unwrap();
    let old_state = server.client_state("c1").unwrap().clone();

    server.process_announcement(pose_base("B", 10.0), "c1").unwrap();
    let docs = server.generate_documents().unwrap();
    let new_state = server.client_state("c1").unwrap().clone();

    let sent: BTreeSet<String> = docs["c1"]
        .subgraphs
        .iter()
        .filter(|s| s.kind() != AnnouncementKind::Deletion)
        .map(|s| s.id.clone())
        .collect();
    let kept: BTreeSet<String> = old_state.intersection(&new_state).cloned().collect();

    let union: BTreeSet<String> = kept.union(&sent).cloned().collect();
    assert_eq!(union, new_state);

    let markers: BTreeSet<String> = docs["c1"]
        .subgraphs
        .iter()
        .filter(|s| s.kind() == AnnouncementKind::Deletion)
        .map(|s| s.id.clone())
        .collect();
    let dropped: BTreeSet<String> = old_state.difference(&new_state).cloned().collect();
    assert_eq!(markers, dropped);
}

#[test]
fn remote_references_are_scrubbed_per_client() {
    // E5: c2's query instance references c1's subgraph; the reference is
    // stripped and preserved as attributes.
    let mut server = Server::default();
    server.process_announcement(pose_base("A", 20.0), "c1").unwrap();
    server
        .process_announcement(pose_query("Q1", "wanted"), "c2")
        .unwrap();

    let docs = server.generate_documents().unwrap();

    let c2_instance = &docs["c2"].subgraphs[0];
    let edge = c2_instance.graph.edge("wanted").unwrap();
    assert!(edge.data.edge_ref.is_none());
    assert_eq!(edge.data.attributes.get_text("remotePatternID"), "A");
    assert_eq!(edge.data.attributes.get_text("remoteEdgeName"), "e1");

    // c1 receives its own subgraph untouched.
    assert_eq!(sent_ids(&docs["c1"]), ["A".to_string()].into_iter().collect());
}

#[test]
fn same_client_references_are_kept() {
    let mut server = Server::default();
    server.process_announcement(pose_base("A", 20.0), "c1").unwrap();
    server
        .process_announcement(pose_query("Q1", "wanted"), "c1")
        .unwrap();

    let docs = server.generate_documents().unwrap();
    let instance = docs["c1"]
        .subgraphs
        .iter()
        .find(|s| s.name == "wanted")
        .unwrap();
    let edge = instance.graph.edge("wanted").unwrap();
    assert!(edge.data.edge_ref.is_some());
    assert!(!edge.data.attributes.has("remotePatternID"));
}

#[test]
fn documents_are_deterministic_across_runs() {
    // Property: the same announcement sequence produces byte-identical
    // documents, tick for tick.
    let run = || {
        let mut server = Server::default();
        let mut emitted = Vec::new();

        server.process_announcement(pose_base("A", 30.0), "c1").unwrap();
        server
            .process_announcement(pose_query("Q1", "wanted"), "c2")
            .unwrap();
        emitted.push(serde_json::to_string(&server.generate_documents().unwrap()).unwrap());

        server.process_announcement(pose_base("B", 10.0), "c1").unwrap();
        emitted.push(serde_json::to_string(&server.generate_documents().unwrap()).unwrap());

        server
            .process_announcement(Subgraph::deletion_marker("A"), "c1")
            .unwrap();
        emitted.push(serde_json::to_string(&server.generate_documents().unwrap()).unwrap());

        emitted
    };

    assert_eq!(run(), run());
}

#[test]
fn reissued_query_reuses_instance_ids() {
    // The query-instance id is derived from its edge references, so the
    // same resolution is never re-sent under a fresh name.
    let mut server = Server::default();
    server.process_announcement(pose_base("A", 20.0), "c1").unwrap();
    server
        .process_announcement(pose_query("Q1", "wanted"), "c1")
        .unwrap();

    let docs = server.generate_documents().unwrap();
    assert_eq!(docs["c1"].subgraphs.len(), 2);

    // Steady state: reissuing the same world produces empty diffs.
    for _ in 0..3 {
        let docs = server.generate_documents().unwrap();
        assert!(docs["c1"].is_empty());
    }
}
