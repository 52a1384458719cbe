//! The unifier: unify, occurs check, extract (zonk), unify_cmp

use std::collections::HashMap;
use std::sync::Arc;

use super::elem::{self, find, same_set, union, Elem};
use super::{Field, Type, TypeError};

/// Make two types equal, or fail.
///
/// Concrete kinds recurse structurally: structs need the same field count
/// and the same ordered field names; funcs unify args positionally (names
/// are not compared) plus the output. Unresolved variables take the other
/// side as root data after the occurs check; two unresolved variables have
/// their sets unioned; resolved variables recurse on their data.
pub fn unify(t1: &Type, t2: &Type) -> Result<(), TypeError> {
    match (t1, t2) {
        (Type::Unification(e1), Type::Unification(e2)) => {
            if same_set(e1, e2) {
                return Ok(());
            }
            match (elem::resolved(e1), elem::resolved(e2)) {
                (Some(d1), Some(d2)) => unify(&d1, &d2),
                (None, Some(d2)) => {
                    occurs_check(e1, &d2)?;
                    union(e1, e2);
                    Ok(())
                }
                (Some(d1), None) => {
                    occurs_check(e2, &d1)?;
                    union(e1, e2);
                    Ok(())
                }
                (None, None) => {
                    union(e1, e2);
                    Ok(())
                }
            }
        }
        (Type::Unification(e), t) | (t, Type::Unification(e)) => {
            match elem::resolved(e) {
                Some(data) => unify(&data, t),
                None => {
                    occurs_check(e, t)?;
                    elem::resolve(e, t.clone());
                    Ok(())
                }
            }
        }
        (Type::Bool, Type::Bool)
        | (Type::Str, Type::Str)
        | (Type::Int, Type::Int)
        | (Type::Float, Type::Float) => Ok(()),
        (Type::List(a), Type::List(b)) => unify(a, b),
        (Type::Map(ak, av), Type::Map(bk, bv)) => {
            unify(ak, bk)?;
            unify(av, bv)
        }
        (Type::Struct(a), Type::Struct(b)) => {
            if a.len() != b.len() {
                return Err(TypeError::ArityMismatch(a.len(), b.len()));
            }
            for (fa, fb) in a.iter().zip(b.iter()) {
                if fa.name != fb.name {
                    return Err(TypeError::StructFieldMismatch(format!(
                        "{} != {}",
                        fa.name, fb.name
                    )));
                }
                unify(&fa.typ, &fb.typ)?;
            }
            Ok(())
        }
        (
            Type::Func { args: aa, out: ao },
            Type::Func { args: ba, out: bo },
        ) => {
            if aa.len() != ba.len() {
                return Err(TypeError::ArityMismatch(aa.len(), ba.len()));
            }
            for (fa, fb) in aa.iter().zip(ba.iter()) {
                unify(&fa.typ, &fb.typ)?;
            }
            unify(ao, bo)
        }
        (Type::Variant(a), Type::Variant(b)) => match (a, b) {
            (Some(ia), Some(ib)) => unify(ia, ib),
            _ => Ok(()),
        },
        (a, b) => Err(TypeError::KindMismatch(
            a.kind_name().to_string(),
            b.kind_name().to_string(),
        )),
    }
}

/// Fail if `elem`'s equivalence class appears anywhere inside `typ`.
///
/// Resolved variables inside `typ` are chased into their data. This is
/// what keeps the type forest acyclic: it runs before every variable
/// assignment.
pub fn occurs_check(elem: &Arc<Elem>, typ: &Type) -> Result<(), TypeError> {
    match typ {
        Type::Bool | Type::Str | Type::Int | Type::Float => Ok(()),
        Type::List(val) => occurs_check(elem, val),
        Type::Map(key, val) => {
            occurs_check(elem, key)?;
            occurs_check(elem, val)
        }
        Type::Struct(fields) => {
            for field in fields {
                occurs_check(elem, &field.typ)?;
            }
            Ok(())
        }
        Type::Func { args, out } => {
            for field in args {
                occurs_check(elem, &field.typ)?;
            }
            occurs_check(elem, out)
        }
        Type::Variant(inner) => match inner {
            Some(t) => occurs_check(elem, t),
            None => Ok(()),
        },
        Type::Unification(other) => {
            if same_set(elem, other) {
                return Err(TypeError::OccursCheck);
            }
            match elem::resolved(other) {
                Some(data) => occurs_check(elem, &data),
                None => Ok(()),
            }
        }
    }
}

/// Zonk: substitute resolved unification variables with their data,
/// recursively. Unresolved variables are left in place.
pub fn extract(typ: &Type) -> Type {
    match typ {
        Type::Bool | Type::Str | Type::Int | Type::Float => typ.clone(),
        Type::List(val) => Type::List(Box::new(extract(val))),
        Type::Map(key, val) => Type::Map(Box::new(extract(key)), Box::new(extract(val))),
        Type::Struct(fields) => Type::Struct(
            fields
                .iter()
                .map(|f| Field::new(f.name.clone(), extract(&f.typ)))
                .collect(),
        ),
        Type::Func { args, out } => Type::Func {
            args: args
                .iter()
                .map(|f| Field::new(f.name.clone(), extract(&f.typ)))
                .collect(),
            out: Box::new(extract(out)),
        },
        Type::Variant(inner) => Type::Variant(inner.as_ref().map(|t| Box::new(extract(t)))),
        Type::Unification(elem) => match elem::resolved(elem) {
            Some(data) => extract(&data),
            None => typ.clone(),
        },
    }
}

/// Non-destructive compatibility check.
///
/// Exactly one side may contain unification variables. That side is copied
/// with fresh variables (aliasing preserved within the copy), the copy is
/// unified against the other side, and the result must come out
/// ambiguity-free. Neither input is mutated. Returns the resolved type.
pub fn unify_cmp(t1: &Type, t2: &Type) -> Result<Type, TypeError> {
    let vars1 = t1.has_variables();
    let vars2 = t2.has_variables();
    if vars1 && vars2 {
        return Err(TypeError::Ambiguous(
            "both sides contain unification variables".to_string(),
        ));
    }
    if !vars1 && !vars2 {
        unify(t1, t2)?; // no variables anywhere, so this cannot mutate
        return Ok(extract(t1));
    }

    let (poly, ground) = if vars1 { (t1, t2) } else { (t2, t1) };
    let copy = copy_with_fresh(poly, &mut HashMap::new());
    unify(&copy, ground)?;
    let out = extract(&copy);
    if out.has_variables() {
        return Err(TypeError::Ambiguous(format!(
            "unresolved variables remain in {}",
            out
        )));
    }
    Ok(out)
}

/// Deep-copy a type, replacing each unification variable set with a fresh
/// element. Aliasing within the input is preserved: two occurrences of the
/// same variable map to the same fresh element.
fn copy_with_fresh(typ: &Type, seen: &mut HashMap<u64, Arc<Elem>>) -> Type {
    match typ {
        Type::Bool | Type::Str | Type::Int | Type::Float => typ.clone(),
        Type::List(val) => Type::List(Box::new(copy_with_fresh(val, seen))),
        Type::Map(key, val) => Type::Map(
            Box::new(copy_with_fresh(key, seen)),
            Box::new(copy_with_fresh(val, seen)),
        ),
        Type::Struct(fields) => Type::Struct(
            fields
                .iter()
                .map(|f| Field::new(f.name.clone(), copy_with_fresh(&f.typ, seen)))
                .collect(),
        ),
        Type::Func { args, out } => Type::Func {
            args: args
                .iter()
                .map(|f| Field::new(f.name.clone(), copy_with_fresh(&f.typ, seen)))
                .collect(),
            out: Box::new(copy_with_fresh(out, seen)),
        },
        Type::Variant(inner) => {
            Type::Variant(inner.as_ref().map(|t| Box::new(copy_with_fresh(t, seen))))
        }
        Type::Unification(e) => {
            let root = find(e);
            if let Some(fresh) = seen.get(&root.id()) {
                return Type::Unification(fresh.clone());
            }
            let fresh = Elem::fresh();
            seen.insert(root.id(), fresh.clone());
            if let Some(data) = elem::resolved(e) {
                let copied = copy_with_fresh(&data, seen);
                elem::resolve(&fresh, copied);
            }
            Type::Unification(fresh)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unify_assigns_variable() {
        let var = Type::fresh_variable();
        assert!(unify(&var, &Type::Int).is_ok());
        assert_eq!(extract(&var), Type::Int);
    }

    #[test]
    fn unify_rejects_kind_mismatch() {
        assert_eq!(
            unify(&Type::Int, &Type::Str),
            Err(TypeError::KindMismatch("int".to_string(), "str".to_string()))
        );
    }

    #[test]
    fn occurs_check_rejects_recursive_type() {
        let var = Type::fresh_variable();
        let list = Type::List(Box::new(var.clone()));
        assert_eq!(unify(&var, &list), Err(TypeError::OccursCheck));
    }

    #[test]
    fn variable_chains_resolve_through_union() {
        let a = Type::fresh_variable();
        let b = Type::fresh_variable();
        assert!(unify(&a, &b).is_ok());
        assert!(unify(&b, &Type::Bool).is_ok());
        assert_eq!(extract(&a), Type::Bool);
    }

    #[test]
    fn unify_cmp_does_not_mutate() {
        let var = Type::fresh_variable();
        let list = Type::List(Box::new(var.clone()));
        let ground = Type::List(Box::new(Type::Str));
        assert_eq!(unify_cmp(&list, &ground), Ok(ground.clone()));
        // the original variable is still unresolved
        assert!(list.has_variables());
    }

    #[test]
    fn unify_cmp_rejects_two_polymorphic_sides() {
        let a = Type::List(Box::new(Type::fresh_variable()));
        let b = Type::List(Box::new(Type::fresh_variable()));
        assert!(matches!(unify_cmp(&a, &b), Err(TypeError::Ambiguous(_))));
    }
}
