// SPDX-License-Identifier: BSD-3-Clause
//! Types, written in an LLVM-like syntax: `void`, `i32`, `i32*`, `[3 x i32]`,
//! `%PartiallySecret`.
//!
//! Memory is modelled in *leaves*, one per scalar or pointer slot, rather
//! than bytes. A type's layout is the number of leaves it spans, and a
//! struct field's offset is the number of leaves before it.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Type {
    Void,
    Int { bits: u32 },
    Pointer(Box<Type>),
    Array { element: Box<Type>, len: usize },
    Struct(String),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct StructDef {
    pub fields: Vec<Field>,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

pub type Structs = BTreeMap<String, StructDef>;

impl Type {
    pub fn int(bits: u32) -> Self {
        Type::Int { bits }
    }

    pub fn pointer_to(pointee: Type) -> Self {
        Type::Pointer(Box::new(pointee))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(t) => Some(t),
            _ => None,
        }
    }

    pub fn bits(&self) -> Option<u32> {
        match self {
            Type::Int { bits } => Some(*bits),
            Type::Pointer(_) => Some(64),
            _ => None,
        }
    }

    /// Number of leaves spanned by a value of this type. `void` spans one
    /// leaf so that `void*` arithmetic behaves like `char*` arithmetic.
    pub fn leaves(&self, structs: &Structs) -> Result<usize, Error> {
        self.leaves_at_depth(structs, 0)
    }

    fn leaves_at_depth(&self, structs: &Structs, depth: usize) -> Result<usize, Error> {
        if depth > structs.len() + 1 {
            return Err(Error(format!("Struct contains itself by value: {}", self)));
        }
        Ok(match self {
            Type::Void | Type::Int { .. } | Type::Pointer(_) => 1,
            Type::Array { element, len } => element.leaves_at_depth(structs, depth)? * len,
            Type::Struct(name) => {
                let def = structs
                    .get(name)
                    .ok_or_else(|| Error(format!("Unknown struct: %{}", name)))?;
                let mut n = 0;
                for f in &def.fields {
                    n += f.ty.leaves_at_depth(structs, depth + 1)?;
                }
                n
            }
        })
    }

    /// Offset (in leaves) and type of the given field of a struct type.
    pub fn field(&self, structs: &Structs, idx: usize) -> Result<(usize, Type), Error> {
        let name = match self {
            Type::Struct(name) => name,
            ty => return Err(Error(format!("Field access on non-struct type {}", ty))),
        };
        let def = structs
            .get(name)
            .ok_or_else(|| Error(format!("Unknown struct: %{}", name)))?;
        let mut offset = 0;
        for (i, f) in def.fields.iter().enumerate() {
            if i == idx {
                return Ok((offset, f.ty.clone()));
            }
            offset += f.ty.leaves(structs)?;
        }
        Err(Error(format!(
            "Field index {} out of range for %{} ({} fields)",
            idx,
            name,
            def.fields.len()
        )))
    }
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pointee) = s.strip_suffix('*') {
            return Ok(Type::pointer_to(pointee.parse()?));
        }
        if s == "void" {
            return Ok(Type::Void);
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let (len, element) = inner
                .split_once(" x ")
                .ok_or_else(|| Error(format!("Bad array type: {}", s)))?;
            let len = len
                .trim()
                .parse()
                .map_err(|_| Error(format!("Bad array length: {}", s)))?;
            return Ok(Type::Array {
                element: Box::new(element.parse()?),
                len,
            });
        }
        if let Some(name) = s.strip_prefix('%') {
            if name.is_empty() {
                return Err(Error("Empty struct name".to_string()));
            }
            return Ok(Type::Struct(name.to_string()));
        }
        if let Some(bits) = s.strip_prefix('i') {
            if let Ok(bits) = bits.parse::<u32>() {
                if bits > 0 && bits <= 64 {
                    return Ok(Type::Int { bits });
                }
            }
        }
        Err(Error(format!("Bad type: {:?}", s)))
    }
}

impl TryFrom<String> for Type {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Type> for String {
    fn from(t: Type) -> Self {
        t.to_string()
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int { bits } => write!(f, "i{}", bits),
            Type::Pointer(t) => write!(f, "{}*", t),
            Type::Array { element, len } => write!(f, "[{} x {}]", len, element),
            Type::Struct(name) => write!(f, "%{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partially_secret() -> Structs {
        let mut structs = Structs::new();
        structs.insert(
            "PartiallySecret".to_string(),
            StructDef {
                fields: vec![
                    Field {
                        name: "notsecret".to_string(),
                        ty: Type::int(32),
                    },
                    Field {
                        name: "secret".to_string(),
                        ty: Type::int(32),
                    },
                ],
            },
        );
        structs
    }

    #[test]
    fn parse_nested() {
        let t: Type = "[5 x i32*]*".parse().unwrap();
        assert_eq!(
            Type::pointer_to(Type::Array {
                element: Box::new(Type::pointer_to(Type::int(32))),
                len: 5
            }),
            t
        );
        assert_eq!("[5 x i32*]*", t.to_string());
        assert!("i0".parse::<Type>().is_err());
        assert!("[x i32]".parse::<Type>().is_err());
        assert!("%".parse::<Type>().is_err());
    }

    #[test]
    fn struct_layout() {
        let structs = partially_secret();
        let s = Type::Struct("PartiallySecret".to_string());
        assert_eq!(2, s.leaves(&structs).unwrap());
        assert_eq!((1, Type::int(32)), s.field(&structs, 1).unwrap());
        assert!(s.field(&structs, 2).is_err());
        let arr = Type::Array {
            element: Box::new(s),
            len: 3,
        };
        assert_eq!(6, arr.leaves(&structs).unwrap());
    }

    #[test]
    fn recursive_struct_by_value_is_rejected() {
        let mut structs = Structs::new();
        structs.insert(
            "Loop".to_string(),
            StructDef {
                fields: vec![Field {
                    name: "inner".to_string(),
                    ty: Type::Struct("Loop".to_string()),
                }],
            },
        );
        assert!(Type::Struct("Loop".to_string()).leaves(&structs).is_err());
    }
}
