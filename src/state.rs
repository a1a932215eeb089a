use crate::error::EvalError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An immutable mapping from specification variable names to values.
///
/// Two states are semantically equal iff their variable-value mappings are
/// equal; this is distinct from fingerprint equality, which is probabilistic.
/// The ordered map makes the `Hash` stream canonical.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarState {
    vars: BTreeMap<String, Value>,
}

impl VarState {
    pub fn new(vars: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Self {
            vars: vars
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Value, EvalError> {
        self.vars
            .get(name)
            .ok_or_else(|| EvalError::new(format!("unknown state variable '{name}'")))
    }

    /// Successor-state constructor: the original state is untouched.
    pub fn with(&self, name: &str, value: Value) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.to_string(), value);
        Self { vars }
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl fmt::Display for VarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.vars {
            if !first {
                write!(f, " /\\ ")?;
            }
            write!(f, "{name} = {value}")?;
            first = false;
        }
        Ok(())
    }
}
