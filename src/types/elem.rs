//! Union-find elements backing unification variables
//!
//! Each variable is an [`Elem`] whose root is the canonical representative
//! and the sole owner of resolved-type data. [`union`] is the only way to
//! merge equivalence classes; every read first chases to the root. Identity
//! is pointer identity, so cloning an `Arc<Elem>` aliases the variable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Type;

static NEXT_ELEM_ID: AtomicU64 = AtomicU64::new(1);

/// One element of the union-find structure
#[derive(Debug)]
pub struct Elem {
    id: u64,
    inner: Mutex<ElemInner>,
}

#[derive(Debug)]
struct ElemInner {
    parent: Option<Arc<Elem>>,
    rank: u32,
    data: Option<Type>,
}

impl Elem {
    /// Allocate a fresh singleton element with no resolved data.
    pub fn fresh() -> Arc<Elem> {
        Arc::new(Elem {
            id: NEXT_ELEM_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(ElemInner {
                parent: None,
                rank: 0,
                data: None,
            }),
        })
    }

    /// Stable identity, used only for display.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Chase to the canonical representative, compressing the path walked.
pub fn find(elem: &Arc<Elem>) -> Arc<Elem> {
    let mut root = elem.clone();
    loop {
        let next = root.inner.lock().parent.clone();
        match next {
            Some(parent) => root = parent,
            None => break,
        }
    }
    // point everything on the walked path directly at the root
    let mut node = elem.clone();
    while !Arc::ptr_eq(&node, &root) {
        let next = {
            let mut guard = node.inner.lock();
            let next = guard.parent.clone();
            guard.parent = Some(root.clone());
            next
        };
        match next {
            Some(parent) => node = parent,
            None => break,
        }
    }
    root
}

/// Whether two elements belong to the same equivalence class.
pub fn same_set(a: &Arc<Elem>, b: &Arc<Elem>) -> bool {
    Arc::ptr_eq(&find(a), &find(b))
}

/// Merge the equivalence classes of `a` and `b`, returning the surviving
/// root. Resolved data on the absorbed root migrates to the survivor when
/// the survivor has none.
pub fn union(a: &Arc<Elem>, b: &Arc<Elem>) -> Arc<Elem> {
    let root_a = find(a);
    let root_b = find(b);
    if Arc::ptr_eq(&root_a, &root_b) {
        return root_a;
    }

    let rank_a = root_a.inner.lock().rank;
    let rank_b = root_b.inner.lock().rank;
    let (survivor, absorbed) = if rank_a >= rank_b {
        (root_a, root_b)
    } else {
        (root_b, root_a)
    };

    let migrated = {
        let mut guard = absorbed.inner.lock();
        guard.parent = Some(survivor.clone());
        guard.data.take()
    };

    let mut guard = survivor.inner.lock();
    if guard.data.is_none() {
        guard.data = migrated;
    }
    if rank_a == rank_b {
        guard.rank += 1;
    }
    drop(guard);
    survivor
}

/// Resolved data of the element's root, if any.
pub fn resolved(elem: &Arc<Elem>) -> Option<Type> {
    find(elem).inner.lock().data.clone()
}

/// Set the resolved data on the element's root.
///
/// The caller (the unifier) is responsible for running the occurs check
/// first and for never overwriting existing data with something unequal.
pub(super) fn resolve(elem: &Arc<Elem>, data: Type) {
    find(elem).inner.lock().data = Some(data);
}
