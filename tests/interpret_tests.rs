//! Graph assembly tests: dedup and merge, hidden variants, exports,
//! edges, send/recv wiring, and the cycle diagnostic.

use converge::graph::GraphError;
use converge::testing::{NoopRes, SetRes, SinkRes, ValueRes};
use converge::{interpret, EdgeSpec, EngineError};

#[test]
fn identical_duplicates_keep_the_first() {
    let (a, _) = NoopRes::create("x");
    let (b, _) = NoopRes::create("x");
    let assembly = interpret(vec![a, b], vec![]).expect("assembly");
    assert_eq!(assembly.graph.num_vertices(), 1);
}

#[test]
fn inequivalent_duplicates_fail() {
    let (a, _) = NoopRes::with_comment("x", "one");
    let (b, _) = NoopRes::with_comment("x", "two");
    match interpret(vec![a, b], vec![]) {
        Err(EngineError::Graph(GraphError::DuplicateResource(key))) => {
            assert!(key.contains("noop"));
            assert!(key.contains("x"));
        }
        other => panic!("expected duplicate resource error, got {:?}", other.err()),
    }
}

#[test]
fn compatible_duplicates_merge() {
    let a = SetRes::create("s", &["one"]);
    let b = SetRes::create("s", &["two"]);
    let assembly = interpret(vec![a, b], vec![]).expect("assembly");
    assert_eq!(assembly.graph.num_vertices(), 1);
    let merged = assembly
        .graph
        .vertices()
        .next()
        .map(|(_, res)| res)
        .expect("merged vertex");
    let set = merged
        .as_any()
        .downcast_ref::<converge::testing::SetRes>()
        .expect("set resource");
    assert!(set.values().contains("one"));
    assert!(set.values().contains("two"));
}

/// Hidden coexistence: a normal and a hidden resource under the same key
/// both appear, the export is recorded exactly once, and a sender cannot
/// target the hidden side.
#[test]
fn hidden_coexists_with_normal_and_exports_once() {
    let (normal, _) = NoopRes::create("foo");
    let (mut hidden, _) = NoopRes::create("foo");
    hidden.meta_mut().hidden = true;
    hidden.meta_mut().export = vec!["h1".to_string()];

    let assembly = interpret(vec![normal, hidden], vec![]).expect("assembly");
    assert_eq!(assembly.graph.num_vertices(), 2);
    assert_eq!(assembly.exports.len(), 1);
    let (key, host) = &assembly.exports[0];
    assert_eq!(key.kind, "noop");
    assert_eq!(key.name, "foo");
    assert_eq!(host, "h1");
}

#[test]
fn identical_hidden_variants_deduplicate() {
    let (mut h1, _) = NoopRes::create("foo");
    h1.meta_mut().hidden = true;
    let (mut h2, _) = NoopRes::create("foo");
    h2.meta_mut().hidden = true;
    let assembly = interpret(vec![h1, h2], vec![]).expect("assembly");
    assert_eq!(assembly.graph.num_vertices(), 1);
}

#[test]
fn duplicate_export_triples_fail() {
    let (mut a, _) = NoopRes::create("a");
    a.meta_mut().export = vec!["h1".to_string(), "h1".to_string()];
    match interpret(vec![a], vec![]) {
        Err(EngineError::Graph(GraphError::DuplicateExport(_, host))) => {
            assert_eq!(host, "h1");
        }
        other => panic!("expected duplicate export error, got {:?}", other.err()),
    }
}

#[test]
fn hidden_sender_is_rejected() {
    let (mut sender, _) = ValueRes::create("src", "x");
    sender.meta_mut().hidden = true;
    let (sink, _) = SinkRes::create("dst");
    let edge = EdgeSpec::between("value", "src", "sink", "dst").with_sendrecv("value", "value");
    match interpret(vec![sender, sink], vec![edge]) {
        Err(EngineError::SendRecv(msg)) => assert!(msg.contains("hidden")),
        other => panic!("expected send/recv error, got {:?}", other.err()),
    }
}

#[test]
fn sendrecv_requires_both_fields() {
    let (sender, _) = ValueRes::create("src", "x");
    let (sink, _) = SinkRes::create("dst");
    let mut edge = EdgeSpec::between("value", "src", "sink", "dst");
    edge.send = Some("value".to_string());
    assert!(matches!(
        interpret(vec![sender, sink], vec![edge]),
        Err(EngineError::SendRecv(_))
    ));
}

#[test]
fn sendrecv_rejects_unknown_fields_and_wrong_traits() {
    let (sender, _) = ValueRes::create("src", "x");
    let (sink, _) = SinkRes::create("dst");
    let edge =
        EdgeSpec::between("value", "src", "sink", "dst").with_sendrecv("no_such", "value");
    assert!(matches!(
        interpret(vec![sender, sink], vec![edge]),
        Err(EngineError::SendRecv(_))
    ));

    // a noop is neither sendable nor recvable
    let (noop, _) = NoopRes::create("n");
    let (sink2, _) = SinkRes::create("dst");
    let edge = EdgeSpec::between("noop", "n", "sink", "dst").with_sendrecv("value", "value");
    assert!(matches!(
        interpret(vec![noop, sink2], vec![edge]),
        Err(EngineError::SendRecv(_))
    ));
}

#[test]
fn recv_field_takes_a_single_sender() {
    let (s1, _) = ValueRes::create("one", "x");
    let (s2, _) = ValueRes::create("two", "y");
    let (sink, _) = SinkRes::create("dst");
    let e1 = EdgeSpec::between("value", "one", "sink", "dst").with_sendrecv("value", "value");
    let e2 = EdgeSpec::between("value", "two", "sink", "dst").with_sendrecv("value", "value");
    match interpret(vec![s1, s2, sink], vec![e1, e2]) {
        Err(EngineError::SendRecv(msg)) => assert!(msg.contains("already wired")),
        other => panic!("expected send/recv error, got {:?}", other.err()),
    }
}

#[test]
fn sendrecv_wiring_lands_in_the_assembly() {
    let (sender, _) = ValueRes::create("src", "x");
    let (sink, _) = SinkRes::create("dst");
    let edge = EdgeSpec::between("value", "src", "sink", "dst")
        .with_notify()
        .with_sendrecv("value", "value");
    let assembly = interpret(vec![sender, sink], vec![edge]).expect("assembly");
    assert_eq!(assembly.graph.num_edges(), 1);
    let sink_key = converge::ResKey::new("sink", "dst");
    let wires = assembly.recvs.get(&sink_key).expect("sink wiring");
    let wire = wires.get("value").expect("value field");
    assert_eq!(wire.sender, converge::ResKey::new("value", "src"));
    assert_eq!(wire.sender_field, "value");
}

#[test]
fn parallel_edges_or_their_notify_bits() {
    let (a, _) = NoopRes::create("a");
    let (b, _) = NoopRes::create("b");
    let plain = EdgeSpec::between("noop", "a", "noop", "b");
    let notify = EdgeSpec::between("noop", "a", "noop", "b").with_notify();
    let assembly = interpret(vec![a, b], vec![plain, notify]).expect("assembly");
    assert_eq!(assembly.graph.num_edges(), 1);
    let (_, _, edge) = assembly.graph.edges().next().expect("edge");
    assert!(edge.notify);
}

#[test]
fn edges_to_missing_vertices_fail() {
    let (a, _) = NoopRes::create("a");
    let edge = EdgeSpec::between("noop", "a", "noop", "ghost");
    assert!(matches!(
        interpret(vec![a], vec![edge]),
        Err(EngineError::Graph(GraphError::MissingVertex(_)))
    ));
}

/// Scenario: A -> B and B -> A must fail with a diagnostic naming the
/// cycle members.
#[test]
fn two_vertex_cycle_is_diagnosed() {
    let (a, _) = NoopRes::create("a");
    let (b, _) = NoopRes::create("b");
    let edges = vec![
        EdgeSpec::between("noop", "a", "noop", "b"),
        EdgeSpec::between("noop", "b", "noop", "a"),
    ];
    match interpret(vec![a, b], edges) {
        Err(EngineError::Graph(GraphError::Cycle(names))) => {
            assert_eq!(names.len(), 2);
            assert!(names.iter().any(|n| n.contains("a")));
            assert!(names.iter().any(|n| n.contains("b")));
        }
        other => panic!("expected cycle error, got {:?}", other.err()),
    }
}
