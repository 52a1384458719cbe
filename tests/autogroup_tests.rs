//! Auto-grouping tests: the three-way merge scenario, edge redirection,
//! and cycle safety.

use converge::autogroup::{auto_group, BaseAutoGrouper};
use converge::testing::{NoopRes, SinkRes};
use converge::{interpret, EdgeSpec};

/// Scenario: three same-kind groupable resources collapse into a single
/// vertex holding the other two as grouped children.
#[test]
fn three_siblings_group_into_one() {
    let (g1, _) = NoopRes::create("g1");
    let (g2, _) = NoopRes::create("g2");
    let (g3, _) = NoopRes::create("g3");
    let assembly = interpret(vec![g1, g2, g3], vec![]).expect("assembly");
    let mut graph = assembly.graph;

    let mut grouper = BaseAutoGrouper::new();
    auto_group(&mut graph, &mut grouper).expect("grouping");

    assert_eq!(graph.num_vertices(), 1);
    let (_, survivor) = graph.vertices().next().expect("survivor");
    let grouped = survivor
        .as_groupable()
        .expect("survivor is groupable")
        .grouped();
    // two absorbed directly, or one holding the other; count the leaves
    let mut names: Vec<String> = Vec::new();
    names.push(survivor.name().to_string());
    fn collect(res: &dyn converge::Resource, names: &mut Vec<String>) {
        names.push(res.name().to_string());
        if let Some(g) = res.as_groupable() {
            for child in g.grouped() {
                collect(child, names);
            }
        }
    }
    for child in grouped {
        collect(child, &mut names);
    }
    names.sort();
    assert_eq!(names, vec!["g1", "g2", "g3"]);
}

/// Edges pointing at a merged-away vertex are redirected to the survivor.
#[test]
fn edges_redirect_to_the_survivor() {
    let (g1, _) = NoopRes::create("g1");
    let (g2, _) = NoopRes::create("g2");
    let (sink, _) = SinkRes::create("watcher");
    let edges = vec![
        EdgeSpec::between("noop", "g1", "sink", "watcher").with_notify(),
        EdgeSpec::between("noop", "g2", "sink", "watcher"),
    ];
    let assembly = interpret(vec![g1, g2, sink], edges).expect("assembly");
    let mut graph = assembly.graph;

    auto_group(&mut graph, &mut BaseAutoGrouper::new()).expect("grouping");

    assert_eq!(graph.num_vertices(), 2);
    assert_eq!(graph.num_edges(), 1);
    let (src, dst, edge) = graph.edges().next().expect("redirected edge");
    let src_res = graph.vertex(src).expect("src");
    let dst_res = graph.vertex(dst).expect("dst");
    assert_eq!(src_res.kind(), "noop");
    assert_eq!(dst_res.kind(), "sink");
    // parallel edges merged notify bits
    assert!(edge.notify);
}

/// Grouping through an intermediate vertex would create a cycle; the pair
/// must be left alone.
#[test]
fn grouping_never_introduces_cycles() {
    let (g1, _) = NoopRes::create("g1");
    let (g2, _) = NoopRes::create("g2");
    let (mid, _) = SinkRes::create("mid");
    let edges = vec![
        EdgeSpec::between("noop", "g1", "sink", "mid"),
        EdgeSpec::between("sink", "mid", "noop", "g2"),
    ];
    let assembly = interpret(vec![g1, g2, mid], edges).expect("assembly");
    let mut graph = assembly.graph;

    auto_group(&mut graph, &mut BaseAutoGrouper::new()).expect("grouping");

    // nothing merged: collapsing g1 and g2 would loop through mid
    assert_eq!(graph.num_vertices(), 3);
    assert!(graph.topo_sort().is_ok());
}

/// Hidden resources stay out of grouping even when their kind matches.
#[test]
fn hidden_resources_do_not_group() {
    let (g1, _) = NoopRes::create("g1");
    let (mut g2, _) = NoopRes::create("g2");
    g2.meta_mut().hidden = true;
    let assembly = interpret(vec![g1, g2], vec![]).expect("assembly");
    let mut graph = assembly.graph;

    auto_group(&mut graph, &mut BaseAutoGrouper::new()).expect("grouping");
    assert_eq!(graph.num_vertices(), 2);
}
