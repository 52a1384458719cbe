//! Resource model tests: semantic compare, copy, merge, and the kind
//! registry.

use converge::resource::{new_resource, register, res_cmp, res_copy, res_merge};
use converge::testing::{NoopRes, SetRes, ValueRes};
use serial_test::serial;

#[test]
fn res_cmp_is_reflexive() {
    let (a, _) = NoopRes::with_comment("a", "hello");
    assert!(res_cmp(a.as_ref(), a.as_ref()).is_ok());
}

#[test]
fn res_cmp_is_symmetric() {
    let (a, _) = NoopRes::with_comment("a", "hello");
    let (b, _) = NoopRes::with_comment("a", "hello");
    let (c, _) = NoopRes::with_comment("a", "different");
    assert_eq!(
        res_cmp(a.as_ref(), b.as_ref()).is_ok(),
        res_cmp(b.as_ref(), a.as_ref()).is_ok()
    );
    assert_eq!(
        res_cmp(a.as_ref(), c.as_ref()).is_ok(),
        res_cmp(c.as_ref(), a.as_ref()).is_ok()
    );
    assert!(res_cmp(a.as_ref(), c.as_ref()).is_err());
}

#[test]
fn res_cmp_rejects_cross_kind_and_cross_name() {
    let (a, _) = NoopRes::create("a");
    let (b, _) = NoopRes::create("b");
    assert!(res_cmp(a.as_ref(), b.as_ref()).is_err());
    let (v, _) = ValueRes::create("a", "x");
    assert!(res_cmp(a.as_ref(), v.as_ref()).is_err());
}

#[test]
fn res_cmp_descends_into_grouped_children() {
    let (mut parent1, _) = NoopRes::create("p");
    let (mut parent2, _) = NoopRes::create("p");
    let (child_a, _) = NoopRes::create("a");
    let (child_b, _) = NoopRes::create("b");
    let (child_a2, _) = NoopRes::create("a");
    let (child_b2, _) = NoopRes::create("b");

    let g1 = parent1.as_groupable_mut().expect("noop is groupable");
    g1.group_res(child_a).expect("group");
    g1.group_res(child_b).expect("group");
    // opposite insertion order; comparison sorts
    let g2 = parent2.as_groupable_mut().expect("noop is groupable");
    g2.group_res(child_b2).expect("group");
    g2.group_res(child_a2).expect("group");

    assert!(res_cmp(parent1.as_ref(), parent2.as_ref()).is_ok());
}

#[test]
fn res_copy_preserves_params_and_children() {
    let (mut parent, _) = NoopRes::with_comment("p", "note");
    let (child, _) = NoopRes::create("c");
    parent
        .as_groupable_mut()
        .expect("noop is groupable")
        .group_res(child)
        .expect("group");

    let copy = res_copy(parent.as_ref()).expect("copy");
    assert!(res_cmp(parent.as_ref(), copy.as_ref()).is_ok());
    let grouped = copy.as_groupable().expect("copy keeps grouping").grouped();
    assert_eq!(grouped.len(), 1);
    assert_eq!(grouped[0].name(), "c");
}

#[test]
fn res_merge_is_commutative() {
    let a1 = SetRes::create("s", &["one", "two"]);
    let b1 = SetRes::create("s", &["two", "three"]);
    let a2 = SetRes::create("s", &["one", "two"]);
    let b2 = SetRes::create("s", &["two", "three"]);

    let ab = res_merge(vec![a1, b1]).expect("merge ab");
    let ba = res_merge(vec![b2, a2]).expect("merge ba");
    assert!(res_cmp(ab.as_ref(), ba.as_ref()).is_ok());
}

#[test]
fn res_merge_rejects_incompatible_inputs() {
    let a = SetRes::create("s", &["one"]);
    let b = SetRes::create("other", &["two"]);
    assert!(res_merge(vec![a, b]).is_err());

    let (c, _) = NoopRes::create("n");
    let d = SetRes::create("n", &["x"]);
    assert!(res_merge(vec![c, d]).is_err());
}

#[test]
#[serial]
fn registry_builds_known_kinds() {
    register("noop", NoopRes::build).expect("register");
    // re-registering the identical builder is a no-op
    register("noop", NoopRes::build).expect("re-register");

    let res = new_resource("noop", "fromreg").expect("build");
    assert_eq!(res.kind(), "noop");
    assert_eq!(res.name(), "fromreg");
    assert!(converge::resource::registered_kinds().contains(&"noop".to_string()));
}

#[test]
#[serial]
fn registry_rejects_unknown_kinds() {
    assert!(new_resource("no-such-kind", "x").is_err());
}
