// SPDX-License-Identifier: BSD-3-Clause
use std::collections::BTreeSet;

use triomphe::Arc;

use crate::ir::instruction::Predicate;
use crate::ir::FunctionName;
use crate::lattice::{Interval, Taint};

use super::Location;

/// Identity of an input value, shared by every copy of it, so that a branch
/// on one copy narrows all of them.
pub type Symbol = u32;

/// The comparison that produced an `i1`, kept so that branching on it can
/// narrow its operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub pred: Predicate,
    pub lhs: Value,
    pub rhs: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntValue {
    pub taint: Taint,
    pub bits: u32,
    pub range: Interval,
    pub symbol: Option<Symbol>,
    pub cond: Option<Arc<Condition>>,
}

impl IntValue {
    pub fn constant(bits: u32, value: i128) -> Self {
        IntValue {
            taint: Taint::public(),
            bits,
            range: Interval::exact(value),
            symbol: None,
            cond: None,
        }
    }

    /// A value about which nothing but its taint is known. Secret values
    /// are always unconstrained.
    pub fn unconstrained(bits: u32, taint: Taint) -> Self {
        IntValue {
            taint,
            bits,
            range: Interval::full(bits),
            symbol: None,
            cond: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerValue {
    pub taint: Taint,
    pub targets: BTreeSet<Location>,
    pub functions: BTreeSet<FunctionName>,
    pub maybe_null: bool,
    pub symbol: Option<Symbol>,
}

impl PointerValue {
    pub fn null() -> Self {
        PointerValue {
            taint: Taint::public(),
            targets: BTreeSet::new(),
            functions: BTreeSet::new(),
            maybe_null: true,
            symbol: None,
        }
    }

    pub fn to(loc: Location) -> Self {
        PointerValue {
            taint: Taint::public(),
            targets: BTreeSet::from([loc]),
            functions: BTreeSet::new(),
            maybe_null: false,
            symbol: None,
        }
    }

    pub fn function(f: FunctionName) -> Self {
        PointerValue {
            taint: Taint::public(),
            targets: BTreeSet::new(),
            functions: BTreeSet::from([f]),
            maybe_null: false,
            symbol: None,
        }
    }

    /// Points at nothing but null.
    pub fn is_null(&self) -> bool {
        self.targets.is_empty() && self.functions.is_empty() && self.maybe_null
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(IntValue),
    Ptr(PointerValue),
    /// Valid but unconstrained contents. Loading a pointer out of it
    /// conjures a fresh object.
    Unknown(Taint),
    /// Never written.
    Undef,
}

impl Value {
    pub fn taint(&self) -> Taint {
        match self {
            Value::Int(i) => i.taint.clone(),
            Value::Ptr(p) => p.taint.clone(),
            Value::Unknown(t) => t.clone(),
            Value::Undef => Taint::public(),
        }
    }

    pub fn is_secret(&self) -> bool {
        match self {
            Value::Int(i) => i.taint.is_secret(),
            Value::Ptr(p) => p.taint.is_secret(),
            Value::Unknown(t) => t.is_secret(),
            Value::Undef => false,
        }
    }

    pub fn symbol(&self) -> Option<Symbol> {
        match self {
            Value::Int(i) => i.symbol,
            Value::Ptr(p) => p.symbol,
            Value::Unknown(_) | Value::Undef => None,
        }
    }

    /// Join `t` into the value's taint.
    pub fn taint_with(mut self, t: &Taint) -> Self {
        if !t.is_secret() {
            return self;
        }
        match &mut self {
            Value::Int(i) => {
                i.taint.absorb(t);
                // Secret values carry no range
                i.range = Interval::full(i.bits);
                i.symbol = None;
                i.cond = None;
            }
            Value::Ptr(p) => {
                p.taint.absorb(t);
                p.symbol = None;
            }
            Value::Unknown(u) => {
                u.absorb(t);
            }
            Value::Undef => return Value::Unknown(t.clone()),
        }
        self
    }

    /// Least upper bound, used for weak updates and control-flow merges.
    pub fn join(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Undef, v) | (v, Value::Undef) => v.clone(),
            (Value::Int(a), Value::Int(b)) => {
                let taint = a.taint.joined(&b.taint);
                let bits = a.bits.max(b.bits);
                let range = if taint.is_secret() || a.bits != b.bits {
                    Interval::full(bits)
                } else {
                    a.range.hull(&b.range)
                };
                let same = a.symbol == b.symbol && !taint.is_secret();
                Value::Int(IntValue {
                    taint,
                    bits,
                    range,
                    symbol: if same { a.symbol } else { None },
                    cond: None,
                })
            }
            (Value::Ptr(a), Value::Ptr(b)) => Value::Ptr(PointerValue {
                taint: a.taint.joined(&b.taint),
                targets: a.targets.union(&b.targets).copied().collect(),
                functions: a.functions.union(&b.functions).cloned().collect(),
                maybe_null: a.maybe_null || b.maybe_null,
                symbol: if a.symbol == b.symbol { a.symbol } else { None },
            }),
            (Value::Int(i), Value::Unknown(t)) | (Value::Unknown(t), Value::Int(i)) => {
                Value::Int(IntValue::unconstrained(i.bits, i.taint.joined(t)))
            }
            // The unknown part is modelled as possibly null
            (Value::Ptr(p), Value::Unknown(t)) | (Value::Unknown(t), Value::Ptr(p)) => {
                Value::Ptr(PointerValue {
                    taint: p.taint.joined(t),
                    targets: p.targets.clone(),
                    functions: p.functions.clone(),
                    maybe_null: true,
                    symbol: None,
                })
            }
            (Value::Unknown(a), Value::Unknown(b)) => Value::Unknown(a.joined(b)),
            (a, b) => Value::Unknown(a.taint().joined(&b.taint())),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "i{} {} ({})", i.bits, i.range, i.taint),
            Value::Ptr(p) => {
                write!(f, "ptr {{")?;
                for (n, t) in p.targets.iter().enumerate() {
                    if n != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                for func in &p.functions {
                    write!(f, " {}", func)?;
                }
                if p.maybe_null {
                    write!(f, " null?")?;
                }
                write!(f, "}} ({})", p.taint)
            }
            Value::Unknown(t) => write!(f, "unknown ({})", t),
            Value::Undef => write!(f, "undef"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ObjectId;

    #[test]
    fn join_pointers_unions_targets() {
        let a = Value::Ptr(PointerValue::to(Location::new(ObjectId(0), 0)));
        let b = Value::Ptr(PointerValue::to(Location::new(ObjectId(1), 2)));
        match a.join(&b) {
            Value::Ptr(p) => {
                assert_eq!(2, p.targets.len());
                assert!(!p.maybe_null);
            }
            v => panic!("unexpected join {}", v),
        }
    }

    #[test]
    fn secret_join_drops_range() {
        let a = Value::Int(IntValue::constant(32, 1));
        let b = Value::Int(IntValue::unconstrained(32, Taint::secret("k")));
        match a.join(&b) {
            Value::Int(i) => {
                assert!(i.taint.is_secret());
                assert!(i.range.is_full(32));
            }
            v => panic!("unexpected join {}", v),
        }
        assert_eq!(a, a.join(&Value::Undef));
    }
}
