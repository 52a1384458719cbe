//! Graph primitive tests: adjacency queries, determinism, and the DOT
//! dump.

use converge::Graph;

fn diamond() -> (Graph<&'static str, u32>, Vec<converge::graph::NodeIndex>) {
    // a -> b -> d, a -> c -> d
    let mut g: Graph<&str, u32> = Graph::new("diamond");
    let a = g.add_vertex("a");
    let b = g.add_vertex("b");
    let c = g.add_vertex("c");
    let d = g.add_vertex("d");
    g.add_edge(a, b, 1);
    g.add_edge(a, c, 2);
    g.add_edge(b, d, 3);
    g.add_edge(c, d, 4);
    (g, vec![a, b, c, d])
}

#[test]
fn adjacency_queries() {
    let (g, ix) = diamond();
    let (a, b, c, d) = (ix[0], ix[1], ix[2], ix[3]);

    let mut out_a = g.outgoing(a);
    out_a.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(out_a, expected);

    assert_eq!(g.incoming(a), Vec::new());
    assert_eq!(g.outgoing(d), Vec::new());
    let mut in_d = g.incoming(d);
    in_d.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(in_d, expected);

    assert_eq!(g.out_edges(a).len(), 2);
    assert_eq!(g.in_edges(d).len(), 2);
    assert_eq!(g.num_vertices(), 4);
    assert_eq!(g.num_edges(), 4);
}

#[test]
fn toposort_respects_all_paths() {
    let (g, ix) = diamond();
    let order = g.topo_sort().expect("acyclic");
    let pos = |v| order.iter().position(|o| *o == v).unwrap_or(usize::MAX);
    assert!(pos(ix[0]) < pos(ix[1]));
    assert!(pos(ix[0]) < pos(ix[2]));
    assert!(pos(ix[1]) < pos(ix[3]));
    assert!(pos(ix[2]) < pos(ix[3]));
}

#[test]
fn toposort_is_deterministic() {
    let (g1, _) = diamond();
    let (g2, _) = diamond();
    assert_eq!(g1.topo_sort().expect("sort"), g2.topo_sort().expect("sort"));
}

#[test]
fn reachability_follows_edge_direction() {
    let (g, ix) = diamond();
    assert!(g.reachable(ix[0], ix[3]));
    assert!(!g.reachable(ix[3], ix[0]));
    assert!(!g.reachable(ix[1], ix[2]));
}

#[test]
fn removal_detaches_edges() {
    let (mut g, ix) = diamond();
    g.remove_vertex(ix[1]); // drop b
    assert_eq!(g.num_vertices(), 3);
    assert_eq!(g.num_edges(), 2); // a->c, c->d remain
    assert!(g.reachable(ix[0], ix[3])); // still via c
}

#[test]
fn self_loop_is_a_cycle() {
    let mut g: Graph<&str, ()> = Graph::new("t");
    let a = g.add_vertex("a");
    g.add_edge(a, a, ());
    assert_eq!(g.cycle(), Some(vec![a]));
    assert!(g.topo_sort().is_err());
}

#[test]
fn dot_dump_names_vertices_and_edges() {
    let (g, _) = diamond();
    let dot = g.to_dot();
    assert!(dot.starts_with("digraph \"diamond\""));
    assert!(dot.contains("\"a\" -> \"b\";"));
    assert!(dot.contains("\"c\" -> \"d\";"));
    assert!(dot.trim_end().ends_with('}'));
}
