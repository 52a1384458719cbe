//! Whole-resource operations: semantic compare, deep copy, merge

use crate::error::{EngineError, EngineResult};

use super::{BoxedRes, ResKey, Resource};

/// Semantic comparison of two resources.
///
/// Equal means: same kind and name, kind-specific `cmp` passes, the
/// edgeable and groupable meta blocks match (including which side
/// implements them), and when both are grouped their sorted child lists
/// pairwise compare equal. Meta-params outside those blocks do not
/// participate.
pub fn res_cmp(a: &dyn Resource, b: &dyn Resource) -> EngineResult<()> {
    if a.kind() != b.kind() {
        return Err(EngineError::Validate(format!(
            "kind differs: {} vs {}",
            a.kind(),
            b.kind()
        )));
    }
    if a.name() != b.name() {
        return Err(EngineError::Validate(format!(
            "name differs: {} vs {}",
            a.name(),
            b.name()
        )));
    }
    a.cmp(b)?;

    match (a.as_edgeable(), b.as_edgeable()) {
        (None, None) => {}
        (Some(ea), Some(eb)) => {
            if ea.auto_edge_meta() != eb.auto_edge_meta() {
                return Err(EngineError::Validate("auto-edge meta differs".to_string()));
            }
        }
        _ => return Err(EngineError::Validate("edgeable capability differs".to_string())),
    }

    match (a.as_groupable(), b.as_groupable()) {
        (None, None) => {}
        (Some(ga), Some(gb)) => {
            if ga.auto_group_meta() != gb.auto_group_meta() {
                return Err(EngineError::Validate(
                    "auto-group meta differs".to_string(),
                ));
            }
            let mut children_a = ga.grouped();
            let mut children_b = gb.grouped();
            if children_a.len() != children_b.len() {
                return Err(EngineError::Validate(format!(
                    "grouped child count differs: {} vs {}",
                    children_a.len(),
                    children_b.len()
                )));
            }
            children_a.sort_by_key(|r| ResKey::of(*r));
            children_b.sort_by_key(|r| ResKey::of(*r));
            for (ca, cb) in children_a.iter().zip(children_b.iter()) {
                res_cmp(*ca, *cb)?;
            }
        }
        _ => {
            return Err(EngineError::Validate(
                "groupable capability differs".to_string(),
            ))
        }
    }

    Ok(())
}

/// Deep copy of a resource's public data.
///
/// Preserves meta-params, the refresh flag, and grouped children
/// (recursively). Requires the resource (and each grouped child) to be
/// `Copyable`.
pub fn res_copy(res: &dyn Resource) -> EngineResult<BoxedRes> {
    let copyable = res.as_copyable().ok_or_else(|| {
        EngineError::Validate(format!("{} is not copyable", ResKey::of(res)))
    })?;
    let mut copy = copyable.copy_res();
    *copy.meta_mut() = res.meta().clone();

    if let (Some(src), Some(dst)) = (res.as_refreshable(), copy.as_refreshable()) {
        dst.set_refresh(src.refresh());
    }

    if let Some(groupable) = res.as_groupable() {
        let children = groupable.grouped();
        if !children.is_empty() {
            let copied: Vec<BoxedRes> = children
                .iter()
                .map(|child| res_copy(*child))
                .collect::<EngineResult<_>>()?;
            let dst = copy.as_groupable_mut().ok_or_else(|| {
                EngineError::Internal("copy lost the groupable capability".to_string())
            })?;
            for child in copied {
                dst.group_res(child)?;
            }
        }
    }

    Ok(copy)
}

/// Fold `merge` over a set of pairwise `adapts`-compatible resources.
///
/// The refresh flag of the result is the logical OR of the inputs'.
pub fn res_merge(resources: Vec<BoxedRes>) -> EngineResult<BoxedRes> {
    let mut iter = resources.into_iter();
    let mut acc = iter
        .next()
        .ok_or_else(|| EngineError::Validate("merge of an empty set".to_string()))?;
    let mut refresh = acc
        .as_refreshable()
        .map(|r| r.refresh())
        .unwrap_or(false);

    for next in iter {
        refresh = refresh
            || next
                .as_refreshable()
                .map(|r| r.refresh())
                .unwrap_or(false);
        let merged = {
            let compatible = acc.as_compatible().ok_or_else(|| {
                EngineError::Validate(format!("{} is not compatible", ResKey::of(acc.as_ref())))
            })?;
            compatible.adapts(next.as_ref())?;
            if let Some(reverse) = next.as_compatible() {
                reverse.adapts(acc.as_ref())?;
            }
            compatible.merge(next.as_ref())?
        };
        acc = merged;
    }

    if refresh {
        if let Some(r) = acc.as_refreshable() {
            r.set_refresh(true);
        }
    }
    Ok(acc)
}
