use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Specification values, a small closed set of variants.
///
/// Collections are Arc-wrapped ordered containers: cloning a nested value
/// only bumps reference counts, and the ordered layout makes hashing and
/// serialization canonical, which fingerprinting depends on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Tuple(Arc<Vec<Value>>),
    Set(Arc<BTreeSet<Value>>),
    Fun(Arc<BTreeMap<Value, Value>>),
    Record(Arc<BTreeMap<String, Value>>),
}

impl Value {
    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(Arc::new(items.into_iter().collect()))
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(Arc::new(items.into_iter().collect()))
    }

    pub fn fun(pairs: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Fun(Arc::new(pairs.into_iter().collect()))
    }

    pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Value::Record(Arc::new(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        ))
    }

    pub fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(EvalError::new(format!("expected Bool, got {other}"))),
        }
    }

    pub fn as_int(&self) -> Result<i64, EvalError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(EvalError::new(format!("expected Int, got {other}"))),
        }
    }

    pub fn as_set(&self) -> Result<&BTreeSet<Value>, EvalError> {
        match self {
            Value::Set(v) => Ok(v.as_ref()),
            other => Err(EvalError::new(format!("expected Set, got {other}"))),
        }
    }

    pub fn as_tuple(&self) -> Result<&Vec<Value>, EvalError> {
        match self {
            Value::Tuple(v) => Ok(v.as_ref()),
            other => Err(EvalError::new(format!("expected Tuple, got {other}"))),
        }
    }

    /// Function/record/tuple application.
    ///
    /// Tuples are 1-indexed, matching the specification language the
    /// evaluator compiles from.
    pub fn apply(&self, arg: &Value) -> Result<&Value, EvalError> {
        match self {
            Value::Fun(map) => map
                .get(arg)
                .ok_or_else(|| EvalError::new(format!("function undefined at {arg}"))),
            Value::Record(fields) => {
                let key = match arg {
                    Value::Str(name) => name,
                    other => {
                        return Err(EvalError::new(format!(
                            "record field selector must be a string, got {other}"
                        )));
                    }
                };
                fields
                    .get(key)
                    .ok_or_else(|| EvalError::new(format!("record has no field '{key}'")))
            }
            Value::Tuple(items) => {
                let idx = arg.as_int()?;
                if idx < 1 {
                    return Err(EvalError::new(format!("tuple index {idx} out of range")));
                }
                items
                    .get((idx - 1) as usize)
                    .ok_or_else(|| EvalError::new(format!("tuple index {idx} out of range")))
            }
            other => Err(EvalError::new(format!("cannot apply {other} to an argument"))),
        }
    }

    pub fn field(&self, name: &str) -> Result<&Value, EvalError> {
        match self {
            Value::Record(fields) => fields
                .get(name)
                .ok_or_else(|| EvalError::new(format!("record has no field '{name}'"))),
            other => Err(EvalError::new(format!(
                "field selection on non-record value {other}"
            ))),
        }
    }

    pub fn union(&self, other: &Value) -> Result<Value, EvalError> {
        let mut out = self.as_set()?.clone();
        out.extend(other.as_set()?.iter().cloned());
        Ok(Value::Set(Arc::new(out)))
    }

    pub fn intersect(&self, other: &Value) -> Result<Value, EvalError> {
        let rhs = other.as_set()?;
        let out = self
            .as_set()?
            .iter()
            .filter(|v| rhs.contains(*v))
            .cloned()
            .collect::<BTreeSet<_>>();
        Ok(Value::Set(Arc::new(out)))
    }

    pub fn contains(&self, member: &Value) -> Result<bool, EvalError> {
        Ok(self.as_set()?.contains(member))
    }

    /// Update a function value at one point, returning the new function.
    pub fn except(&self, arg: Value, result: Value) -> Result<Value, EvalError> {
        let mut out = match self {
            Value::Fun(map) => map.as_ref().clone(),
            other => {
                return Err(EvalError::new(format!(
                    "EXCEPT on non-function value {other}"
                )));
            }
        };
        out.insert(arg, result);
        Ok(Value::Fun(Arc::new(out)))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "\"{v}\""),
            Value::Tuple(items) => {
                write!(f, "<<")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ">>")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::Fun(map) => {
                write!(f, "(")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, " @@ ")?;
                    }
                    write!(f, "{k} :> {v}")?;
                }
                write!(f, ")")
            }
            Value::Record(fields) => {
                write!(f, "[")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} |-> {v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_dispatches_over_variants() {
        let fun = Value::fun([(Value::Int(1), Value::Str("a".into()))]);
        assert_eq!(
            fun.apply(&Value::Int(1)).expect("defined point"),
            &Value::Str("a".into())
        );
        assert!(fun.apply(&Value::Int(2)).is_err());

        let tup = Value::tuple([Value::Bool(true), Value::Bool(false)]);
        assert_eq!(tup.apply(&Value::Int(2)).expect("in range"), &Value::Bool(false));
        assert!(tup.apply(&Value::Int(0)).is_err());

        let rec = Value::record([("pc", Value::Str("start".into()))]);
        assert_eq!(
            rec.field("pc").expect("field exists"),
            &Value::Str("start".into())
        );
        assert!(rec.field("missing").is_err());
    }

    #[test]
    fn except_is_persistent() {
        let f = Value::fun([(Value::Int(0), Value::Int(10))]);
        let g = f
            .except(Value::Int(0), Value::Int(20))
            .expect("update should succeed");
        assert_eq!(f.apply(&Value::Int(0)).unwrap(), &Value::Int(10));
        assert_eq!(g.apply(&Value::Int(0)).unwrap(), &Value::Int(20));
    }

    #[test]
    fn type_confusion_is_an_eval_error() {
        let err = Value::Int(3).as_bool().unwrap_err();
        assert!(err.message.contains("expected Bool"));
    }

    #[test]
    fn display_is_stable() {
        let v = Value::record([
            ("q", Value::tuple([Value::Int(1), Value::Int(2)])),
            ("done", Value::Bool(false)),
        ]);
        assert_eq!(v.to_string(), "[done |-> FALSE, q |-> <<1, 2>>]");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            (-100i64..100).prop_map(Value::Int),
            "[a-z]{0,4}".prop_map(Value::Str),
        ]
    }

    fn arb_value_set() -> impl Strategy<Value = Value> {
        prop::collection::btree_set(arb_scalar(), 0..8)
            .prop_map(|s| Value::Set(Arc::new(s)))
    }

    proptest! {
        #[test]
        fn union_is_an_upper_bound(a in arb_value_set(), b in arb_value_set()) {
            let u = a.union(&b).unwrap();
            for member in a.as_set().unwrap().iter().chain(b.as_set().unwrap()) {
                prop_assert!(u.contains(member).unwrap());
            }
        }

        #[test]
        fn intersection_is_a_lower_bound(a in arb_value_set(), b in arb_value_set()) {
            let i = a.intersect(&b).unwrap();
            for member in i.as_set().unwrap() {
                prop_assert!(a.contains(member).unwrap());
                prop_assert!(b.contains(member).unwrap());
            }
        }

        #[test]
        fn union_absorbs_intersection(a in arb_value_set(), b in arb_value_set()) {
            let i = a.intersect(&b).unwrap();
            prop_assert_eq!(a.union(&i).unwrap(), a);
        }

        #[test]
        fn tuple_indexing_is_one_based(items in prop::collection::vec(arb_scalar(), 1..6)) {
            let tup = Value::Tuple(Arc::new(items.clone()));
            for (i, expected) in items.iter().enumerate() {
                prop_assert_eq!(tup.apply(&Value::Int((i + 1) as i64)).unwrap(), expected);
            }
            prop_assert!(tup.apply(&Value::Int(items.len() as i64 + 1)).is_err());
        }

        #[test]
        fn equal_values_hash_equal(a in arb_value_set()) {
            let b = a.clone();
            prop_assert_eq!(
                crate::fingerprint::Fingerprint::of(&a),
                crate::fingerprint::Fingerprint::of(&b)
            );
        }
    }
}
