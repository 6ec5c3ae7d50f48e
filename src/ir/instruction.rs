// SPDX-License-Identifier: BSD-3-Clause
use serde::{Deserialize, Serialize};

use super::name::{BlockName, LocalName};
use super::operand::Operand;
use super::ty::Type;

/// Allocate a fresh stack object of the given type.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Alloca {
    pub ty: Type,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Load {
    pub ty: Type,
    pub pointer: Operand,
    #[serde(default)]
    pub volatile: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Store {
    pub value: Operand,
    pub pointer: Operand,
    #[serde(default)]
    pub volatile: bool,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Binary {
    pub op: BinOp,
    pub lhs: Operand,
    pub rhs: Operand,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl Predicate {
    /// The predicate that holds exactly when this one does not.
    pub fn negate(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Ne,
            Predicate::Ne => Predicate::Eq,
            Predicate::Ugt => Predicate::Ule,
            Predicate::Uge => Predicate::Ult,
            Predicate::Ult => Predicate::Uge,
            Predicate::Ule => Predicate::Ugt,
            Predicate::Sgt => Predicate::Sle,
            Predicate::Sge => Predicate::Slt,
            Predicate::Slt => Predicate::Sge,
            Predicate::Sle => Predicate::Sgt,
        }
    }

    /// The predicate with its operands swapped: `a < b` iff `b > a`.
    pub fn swap(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Eq,
            Predicate::Ne => Predicate::Ne,
            Predicate::Ugt => Predicate::Ult,
            Predicate::Uge => Predicate::Ule,
            Predicate::Ult => Predicate::Ugt,
            Predicate::Ule => Predicate::Uge,
            Predicate::Sgt => Predicate::Slt,
            Predicate::Sge => Predicate::Sle,
            Predicate::Slt => Predicate::Sgt,
            Predicate::Sle => Predicate::Sge,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Predicate::Ugt | Predicate::Uge | Predicate::Ult | Predicate::Ule
        )
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Predicate::Eq => "==",
            Predicate::Ne => "!=",
            Predicate::Ugt => ">u",
            Predicate::Uge => ">=u",
            Predicate::Ult => "<u",
            Predicate::Ule => "<=u",
            Predicate::Sgt => ">",
            Predicate::Sge => ">=",
            Predicate::Slt => "<",
            Predicate::Sle => "<=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Icmp {
    pub pred: Predicate,
    pub lhs: Operand,
    pub rhs: Operand,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CastKind {
    BitCast,
    ZExt,
    SExt,
    Trunc,
    PtrToInt,
    IntToPtr,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Cast {
    pub kind: CastKind,
    pub operand: Operand,
    pub ty: Type,
}

/// A struct field, by position or by declared name. Names are resolved to
/// positions when the module is built.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldRef {
    Index(usize),
    Name(String),
}

/// Address of a field of the struct pointed to by `pointer`: `&p->field`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldAddr {
    pub pointer: Operand,
    #[serde(rename = "struct")]
    pub struct_name: String,
    pub field: FieldRef,
}

impl FieldAddr {
    pub(crate) fn field_index(&self) -> usize {
        match self.field {
            FieldRef::Index(i) => i,
            // `Module::new` resolves all names
            FieldRef::Name(_) => unreachable!("unresolved field name"),
        }
    }
}

/// Pointer arithmetic in units of `element`: `&p[index]`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexAddr {
    pub pointer: Operand,
    pub element: Type,
    pub index: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Select {
    pub cond: Operand,
    pub true_value: Operand,
    pub false_value: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Phi {
    pub ty: Type,
    pub incoming: Vec<(Operand, BlockName)>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Call {
    pub callee: Operand,
    #[serde(default)]
    pub args: Vec<Operand>,
    #[serde(default = "void")]
    pub ty: Type,
}

fn void() -> Type {
    Type::Void
}

/// Anything the engine has no model for, e.g. an intrinsic.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Other {
    pub name: String,
    #[serde(default)]
    pub operands: Vec<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "inst", rename_all = "kebab-case")]
pub enum Opcode {
    Alloca(Alloca),
    Load(Load),
    Store(Store),
    Binary(Binary),
    Icmp(Icmp),
    Cast(Cast),
    Field(FieldAddr),
    Index(IndexAddr),
    Select(Select),
    Phi(Phi),
    Call(Call),
    Other(Other),
}

impl Opcode {
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Opcode::Alloca(_) => Vec::new(),
            Opcode::Load(l) => vec![&l.pointer],
            Opcode::Store(s) => vec![&s.value, &s.pointer],
            Opcode::Binary(b) => vec![&b.lhs, &b.rhs],
            Opcode::Icmp(i) => vec![&i.lhs, &i.rhs],
            Opcode::Cast(c) => vec![&c.operand],
            Opcode::Field(f) => vec![&f.pointer],
            Opcode::Index(i) => vec![&i.pointer, &i.index],
            Opcode::Select(s) => vec![&s.cond, &s.true_value, &s.false_value],
            Opcode::Phi(p) => p.incoming.iter().map(|(o, _)| o).collect(),
            Opcode::Call(c) => {
                let mut os = vec![&c.callee];
                os.extend(c.args.iter());
                os
            }
            Opcode::Other(o) => o.operands.iter().collect(),
        }
    }

    /// Whether the instruction produces a value that may be named.
    pub(crate) fn has_result(&self) -> bool {
        match self {
            Opcode::Store(_) => false,
            Opcode::Call(c) => c.ty != Type::Void,
            // No `_` pattern to ensure this is updated if the type changes
            Opcode::Alloca(_) => true,
            Opcode::Load(_) => true,
            Opcode::Binary(_) => true,
            Opcode::Icmp(_) => true,
            Opcode::Cast(_) => true,
            Opcode::Field(_) => true,
            Opcode::Index(_) => true,
            Opcode::Select(_) => true,
            Opcode::Phi(_) => true,
            Opcode::Other(_) => true,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instruction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<LocalName>,
    #[serde(flatten)]
    pub opcode: Opcode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_tagged() {
        let i: Instruction = serde_json::from_str(
            r#"{"result": "v", "inst": "load", "ty": "i32", "pointer": "%p", "volatile": true}"#,
        )
        .unwrap();
        assert_eq!(Some(LocalName::from("v")), i.result);
        assert_eq!(
            Opcode::Load(Load {
                ty: Type::int(32),
                pointer: Operand::local("p"),
                volatile: true,
            }),
            i.opcode
        );

        let i: Instruction = serde_json::from_str(
            r#"{"result": "f", "inst": "field", "pointer": "%ps", "struct": "S", "field": "secret"}"#,
        )
        .unwrap();
        match i.opcode {
            Opcode::Field(f) => assert_eq!(FieldRef::Name("secret".to_string()), f.field),
            o => panic!("unexpected opcode {:?}", o),
        }
    }

    #[test]
    fn predicate_algebra() {
        for p in [Predicate::Eq, Predicate::Ult, Predicate::Sge] {
            assert_eq!(p, p.negate().negate());
            assert_eq!(p, p.swap().swap());
        }
        assert_eq!(Predicate::Sgt, Predicate::Slt.swap());
    }
}
