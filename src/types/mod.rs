//! Type model for resource parameter and send/recv field typing
//!
//! Types form a tree over a closed set of kinds. Polymorphic positions are
//! represented by unification variables: opaque elements of a union-find
//! structure whose root optionally carries a resolved type. The unifier in
//! [`crate::types::unify`] is the only writer of variable state.

mod elem;
mod unify;

pub use elem::{find, same_set, union, Elem};
pub use unify::{extract, occurs_check, unify, unify_cmp};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Unification failure taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Two concrete kinds cannot be made equal
    #[error("kind mismatch: {0} != {1}")]
    KindMismatch(String, String),

    /// A variable would appear inside its own definition
    #[error("occurs check: type variable appears within its own definition")]
    OccursCheck,

    /// Same kind, different shape (func args, struct size)
    #[error("arity mismatch: {0} != {1}")]
    ArityMismatch(usize, usize),

    /// Struct fields differ in name or order
    #[error("struct field mismatch: {0}")]
    StructFieldMismatch(String),

    /// Unification variables remain where a ground type is required
    #[error("ambiguous result: {0}")]
    Ambiguous(String),
}

/// A named field of a struct or func type
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub typ: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: Type) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

/// A type tree
///
/// `Struct` and `Func` keep their fields ordered; the vector is both the
/// field order and the name map. `Unification` holds a shared union-find
/// element; cloning a `Type` aliases the variable rather than copying it,
/// which is what makes in-place unification observable through every
/// holder of the type.
#[derive(Debug, Clone)]
pub enum Type {
    Bool,
    Str,
    Int,
    Float,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Struct(Vec<Field>),
    Func { args: Vec<Field>, out: Box<Type> },
    Variant(Option<Box<Type>>),
    Unification(Arc<Elem>),
}

impl Type {
    /// Fresh unresolved unification variable.
    pub fn fresh_variable() -> Self {
        Type::Unification(Elem::fresh())
    }

    /// Short kind label used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::Str => "str",
            Type::Int => "int",
            Type::Float => "float",
            Type::List(_) => "list",
            Type::Map(_, _) => "map",
            Type::Struct(_) => "struct",
            Type::Func { .. } => "func",
            Type::Variant(_) => "variant",
            Type::Unification(_) => "unification",
        }
    }

    /// Whether any unresolved unification variable remains in the tree.
    ///
    /// Resolved variables are chased into their data.
    pub fn has_variables(&self) -> bool {
        match self {
            Type::Bool | Type::Str | Type::Int | Type::Float => false,
            Type::List(val) => val.has_variables(),
            Type::Map(key, val) => key.has_variables() || val.has_variables(),
            Type::Struct(fields) => fields.iter().any(|f| f.typ.has_variables()),
            Type::Func { args, out } => {
                args.iter().any(|f| f.typ.has_variables()) || out.has_variables()
            }
            Type::Variant(inner) => inner.as_ref().is_some_and(|t| t.has_variables()),
            Type::Unification(elem) => match elem::resolved(elem) {
                Some(data) => data.has_variables(),
                None => true,
            },
        }
    }
}

impl PartialEq for Type {
    /// Structural equality. Unification variables compare equal when they
    /// belong to the same union-find set; a resolved variable compares
    /// equal to its resolved data.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Unification(a), Type::Unification(b)) => {
                if same_set(a, b) {
                    return true;
                }
                match (elem::resolved(a), elem::resolved(b)) {
                    (Some(da), Some(db)) => da == db,
                    _ => false,
                }
            }
            (Type::Unification(a), b) => {
                elem::resolved(a).map(|da| &da == b).unwrap_or(false)
            }
            (a, Type::Unification(b)) => {
                elem::resolved(b).map(|db| &db == a).unwrap_or(false)
            }
            (Type::Bool, Type::Bool)
            | (Type::Str, Type::Str)
            | (Type::Int, Type::Int)
            | (Type::Float, Type::Float) => true,
            (Type::List(a), Type::List(b)) => a == b,
            (Type::Map(ak, av), Type::Map(bk, bv)) => ak == bk && av == bv,
            (Type::Struct(a), Type::Struct(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(fa, fb)| fa.name == fb.name && fa.typ == fb.typ)
            }
            (
                Type::Func { args: aa, out: ao },
                Type::Func { args: ba, out: bo },
            ) => {
                aa.len() == ba.len()
                    && aa.iter().zip(ba.iter()).all(|(fa, fb)| fa.typ == fb.typ)
                    && ao == bo
            }
            (Type::Variant(a), Type::Variant(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::List(val) => write!(f, "[]{}", val),
            Type::Map(key, val) => write!(f, "map{{{}: {}}}", key, val),
            Type::Struct(fields) => {
                write!(f, "struct{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} {}", field.name, field.typ)?;
                }
                write!(f, "}}")
            }
            Type::Func { args, out } => {
                write!(f, "func(")?;
                for (i, field) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if field.name.is_empty() {
                        write!(f, "{}", field.typ)?;
                    } else {
                        write!(f, "{} {}", field.name, field.typ)?;
                    }
                }
                write!(f, ") {}", out)
            }
            Type::Variant(Some(inner)) => write!(f, "variant<{}>", inner),
            Type::Variant(None) => write!(f, "variant"),
            Type::Unification(elem) => match elem::resolved(elem) {
                Some(data) => write!(f, "{}", data),
                None => write!(f, "?{}", find(elem).id()),
            },
        }
    }
}

/// Struct-field compatibility, the relation used when wiring a send field
/// into a recv field.
///
/// Two types are compatible when they are structurally equal, or when both
/// are structs of the same arity whose field types are pairwise compatible
/// regardless of field names.
pub fn struct_fields_compatible(send: &Type, recv: &Type) -> Result<(), TypeError> {
    if send == recv {
        return Ok(());
    }
    match (send, recv) {
        (Type::Struct(a), Type::Struct(b)) => {
            if a.len() != b.len() {
                return Err(TypeError::ArityMismatch(a.len(), b.len()));
            }
            for (fa, fb) in a.iter().zip(b.iter()) {
                struct_fields_compatible(&fa.typ, &fb.typ)?;
            }
            Ok(())
        }
        _ => Err(TypeError::KindMismatch(
            send.kind_name().to_string(),
            recv.kind_name().to_string(),
        )),
    }
}
