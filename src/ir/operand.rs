// SPDX-License-Identifier: BSD-3-Clause
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;
use super::name::{FunctionName, LocalName};

/// An instruction operand, written `%x`, `i32 5`, `null` or `@f`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operand {
    Local(LocalName),
    Int { bits: u32, value: i64 },
    Null,
    Function(FunctionName),
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Local(l) => write!(f, "{}", l),
            Operand::Int { bits, value } => write!(f, "i{} {}", bits, value),
            Operand::Null => write!(f, "null"),
            Operand::Function(func) => write!(f, "{}", func),
        }
    }
}

impl Operand {
    pub fn local(name: &str) -> Self {
        Operand::Local(LocalName::from(name))
    }

    pub fn int(bits: u32, value: i64) -> Self {
        Operand::Int { bits, value }
    }

    pub(crate) fn constant_int(&self) -> Option<i64> {
        if let Operand::Int { value, .. } = self {
            Some(*value)
        } else {
            None
        }
    }

    pub(crate) fn as_local(&self) -> Option<&LocalName> {
        if let Operand::Local(l) = self {
            Some(l)
        } else {
            None
        }
    }
}

impl FromStr for Operand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "null" {
            return Ok(Operand::Null);
        }
        if let Some(name) = s.strip_prefix('%') {
            if !name.is_empty() {
                return Ok(Operand::Local(LocalName::from(name)));
            }
        }
        if let Some(name) = s.strip_prefix('@') {
            if !name.is_empty() {
                return Ok(Operand::Function(FunctionName::from(name)));
            }
        }
        if let Some((ty, value)) = s.split_once(' ') {
            if let Some(Ok(bits)) = ty.strip_prefix('i').map(str::parse::<u32>) {
                let value = match value.trim() {
                    "true" => Ok(1),
                    "false" => Ok(0),
                    v => v.parse::<i64>(),
                };
                if let Ok(value) = value {
                    if bits > 0 && bits <= 64 {
                        return Ok(Operand::Int { bits, value });
                    }
                }
            }
        }
        Err(Error(format!("Bad operand: {:?}", s)))
    }
}

impl TryFrom<String> for Operand {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Operand> for String {
    fn from(o: Operand) -> Self {
        o.to_string()
    }
}
