// SPDX-License-Identifier: BSD-3-Clause
//! Secrecy specifications: abstract descriptions of a function's inputs.
//!
//! A description says, for each parameter, which parts are secret and what
//! is known about the public parts. Everything left unsaid is public. In
//! JSON:
//!
//! ```json
//! {
//!   "functions": {
//!     "ct_struct": {"params": {
//!       "publicarr": {"pointer-to": {"array": {"element": {"public": "unconstrained"}, "len": 100}}},
//!       "ps": {"pointer-to": {"fields": {"secret": "secret"}}}
//!     }}
//!   },
//!   "structs": {
//!     "PartiallySecret": {"struct": [{"public": {"range": [0, 4096]}}, "secret"]}
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::Type;

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbstractValue {
    Exact(i64),
    Range(i64, i64),
    Unconstrained,
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Abstract {
    /// Derived from the type: public scalars, pointers to fresh default
    /// data, and struct descriptions where they exist.
    #[default]
    Default,
    /// A secret value. For pointers, the pointer is public and everything
    /// reachable through it is secret.
    Secret,
    /// A public integer.
    Public(AbstractValue),
    /// A non-null pointer to fresh data.
    PointerTo(Box<Abstract>),
    MaybeNullPointerTo(Box<Abstract>),
    /// A pointer to an unbounded amount of unconstrained public data.
    PointerToUnconstrained,
    /// A pointer back to the nearest enclosing struct of the pointee type.
    PointerToParent,
    PointerToFunction(String),
    /// `len` elements, each described by `element`. Under a pointer to a
    /// scalar, describes a buffer of `len` scalars.
    Array { element: Box<Abstract>, len: usize },
    /// All fields of a struct, in order.
    Struct(Vec<Abstract>),
    /// Some fields of a struct, by name. The rest are `default`.
    Fields(BTreeMap<String, Abstract>),
    /// Under a `void*`, gives the pointee a concrete type.
    VoidOverride { ty: Type, data: Box<Abstract> },
}

impl Abstract {
    pub fn pointer_to(a: Abstract) -> Self {
        Abstract::PointerTo(Box::new(a))
    }

    pub fn array_of(element: Abstract, len: usize) -> Self {
        Abstract::Array {
            element: Box::new(element),
            len,
        }
    }

    pub fn public(v: AbstractValue) -> Self {
        Abstract::Public(v)
    }
}

/// Parameters, by position or by name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Abstract>),
    Named(BTreeMap<String, Abstract>),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunctionSpec {
    pub params: Params,
}

impl FunctionSpec {
    pub fn positional(params: Vec<Abstract>) -> Self {
        FunctionSpec {
            params: Params::Positional(params),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SecrecySpec {
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionSpec>,
    /// Used wherever `default` meets a struct of that name.
    #[serde(default)]
    pub structs: BTreeMap<String, Abstract>,
    /// Treat every input of an unlisted function as secret.
    #[serde(default)]
    pub all_secret: bool,
}

impl SecrecySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every input of every function is secret.
    pub fn all_secret() -> Self {
        SecrecySpec {
            all_secret: true,
            ..Self::default()
        }
    }

    pub fn with_function(mut self, name: &str, spec: FunctionSpec) -> Self {
        self.functions.insert(name.to_string(), spec);
        self
    }

    pub fn with_struct(mut self, name: &str, data: Abstract) -> Self {
        self.structs.insert(name.to_string(), data);
        self
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("{function} takes {expected} parameters but the specification describes {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("{function} has no parameter named {name}")]
    UnknownParameter { function: String, name: String },
    #[error("{place}: {data} does not describe a value of type {ty}")]
    TypeMismatch {
        place: String,
        data: String,
        ty: Type,
    },
    #[error("{place}: %{name} has no field {field}")]
    UnknownField {
        place: String,
        name: String,
        field: String,
    },
    #[error("{place}: %{name} has {expected} fields but the specification describes {got}")]
    FieldCount {
        place: String,
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("{0}: pointer-to-parent outside of a matching struct")]
    NoParent(String),
    #[error("{place}: unknown function @{name}")]
    UnknownFunction { place: String, name: String },
    #[error("{place}: value {value} out of range for i{bits}")]
    BadValue {
        place: String,
        value: String,
        bits: u32,
    },
    #[error("{0}")]
    Layout(#[from] crate::ir::Error),
}

impl Abstract {
    /// Short name for error messages.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Abstract::Default => "default",
            Abstract::Secret => "secret",
            Abstract::Public(_) => "public",
            Abstract::PointerTo(_) => "pointer-to",
            Abstract::MaybeNullPointerTo(_) => "maybe-null-pointer-to",
            Abstract::PointerToUnconstrained => "pointer-to-unconstrained",
            Abstract::PointerToParent => "pointer-to-parent",
            Abstract::PointerToFunction(_) => "pointer-to-function",
            Abstract::Array { .. } => "array",
            Abstract::Struct(_) => "struct",
            Abstract::Fields(_) => "fields",
            Abstract::VoidOverride { .. } => "void-override",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_descriptions() {
        let spec = SecrecySpec::from_json(
            r#"{
              "functions": {
                "f": {"params": ["default", "secret", {"public": {"range": [0, 20]}}]},
                "g": {"params": {"ps": {"pointer-to": {"fields": {"secret": "secret"}}}}}
              },
              "structs": {"Child": {"struct": [{"public": "unconstrained"}, "pointer-to-parent"]}}
            }"#,
        )
        .unwrap();
        assert_eq!(
            FunctionSpec::positional(vec![
                Abstract::Default,
                Abstract::Secret,
                Abstract::public(AbstractValue::Range(0, 20)),
            ]),
            spec.functions["f"]
        );
        match &spec.functions["g"].params {
            Params::Named(m) => assert!(matches!(m["ps"], Abstract::PointerTo(_))),
            p => panic!("expected named params, got {:?}", p),
        }
        assert_eq!(
            Abstract::Struct(vec![
                Abstract::public(AbstractValue::Unconstrained),
                Abstract::PointerToParent
            ]),
            spec.structs["Child"]
        );
        assert!(!spec.all_secret);
    }

    #[test]
    fn void_override_has_a_type() {
        let a: Abstract = serde_json::from_str(
            r#"{"void-override": {"ty": "%PartiallySecret", "data": "default"}}"#,
        )
        .unwrap();
        assert_eq!(
            Abstract::VoidOverride {
                ty: Type::Struct("PartiallySecret".to_string()),
                data: Box::new(Abstract::Default)
            },
            a
        );
    }
}
