// SPDX-License-Identifier: BSD-3-Clause
//! Lattices for secrecy labels and for ranges of public integers

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ascent::Lattice;
use serde::Serialize;

use crate::ir::instruction::{BinOp, CastKind, Predicate};

// ------------------------------------------------------------------
// Labels

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Label {
    Public,
    Secret,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Public => write!(f, "public"),
            Label::Secret => write!(f, "secret"),
        }
    }
}

impl Lattice for Label {
    fn meet(self, other: Self) -> Self {
        self.min(other)
    }

    fn join(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Name of a secret input, as written by a user: `x`, `ps->secret`,
/// `secretarr[*]`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Source(String);

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source(s.to_string())
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        Source(s)
    }
}

impl Source {
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A label together with the secret inputs it was derived from.
///
/// A taint is secret exactly when it has at least one source. Ordered by
/// inclusion, so join is union and meet is intersection.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Taint(BTreeSet<Source>);

impl Taint {
    #[inline]
    pub fn public() -> Self {
        Taint(BTreeSet::new())
    }

    pub fn secret(source: impl Into<Source>) -> Self {
        Taint(BTreeSet::from([source.into()]))
    }

    #[inline]
    pub fn label(&self) -> Label {
        if self.0.is_empty() {
            Label::Public
        } else {
            Label::Secret
        }
    }

    #[inline]
    pub fn is_secret(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn sources(&self) -> &BTreeSet<Source> {
        &self.0
    }

    /// In-place join, returns whether `self` grew.
    pub fn absorb(&mut self, other: &Taint) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() != before
    }

    pub fn joined(&self, other: &Taint) -> Taint {
        if other.0.is_subset(&self.0) {
            return self.clone();
        }
        let mut t = self.clone();
        t.absorb(other);
        t
    }

    pub fn join_all<'a>(taints: impl IntoIterator<Item = &'a Taint>) -> Taint {
        let mut t = Taint::public();
        for o in taints {
            t.absorb(o);
        }
        t
    }
}

impl PartialOrd for Taint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0 == other.0 {
            Some(Ordering::Equal)
        } else if self.0.is_subset(&other.0) {
            Some(Ordering::Less)
        } else if other.0.is_subset(&self.0) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl Lattice for Taint {
    fn meet(self, other: Self) -> Self {
        Taint(self.0.intersection(&other.0).cloned().collect())
    }

    fn join(mut self, other: Self) -> Self {
        self.0.extend(other.0);
        self
    }
}

impl std::fmt::Display for Taint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "public");
        }
        write!(f, "secret(")?;
        for (i, s) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", s)?;
        }
        write!(f, ")")
    }
}

// ------------------------------------------------------------------
// Intervals

/// Smallest value of a signed integer of the given width.
#[inline]
pub fn i_min(bits: u32) -> i128 {
    -(1i128 << (bits - 1))
}

#[inline]
pub fn i_max(bits: u32) -> i128 {
    (1i128 << (bits - 1)) - 1
}

#[inline]
pub fn u_max(bits: u32) -> i128 {
    (1i128 << bits) - 1
}

/// A non-empty range of integers.
///
/// A `bits`-wide value may be represented anywhere in
/// `[i_min(bits), u_max(bits)]`: the signed and unsigned readings of the
/// same bit pattern are both admissible. Comparisons are only decided when
/// both sides lie in the same half of that window.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Interval {
    lo: i128,
    hi: i128,
}

impl Interval {
    pub fn new(lo: i128, hi: i128) -> Option<Self> {
        if lo <= hi {
            Some(Interval { lo, hi })
        } else {
            None
        }
    }

    #[inline]
    pub fn exact(v: i128) -> Self {
        Interval { lo: v, hi: v }
    }

    /// Every value of the given width.
    #[inline]
    pub fn full(bits: u32) -> Self {
        Interval {
            lo: i_min(bits),
            hi: u_max(bits),
        }
    }

    pub fn signed(bits: u32) -> Self {
        Interval {
            lo: i_min(bits),
            hi: i_max(bits),
        }
    }

    #[inline]
    pub fn lo(&self) -> i128 {
        self.lo
    }

    #[inline]
    pub fn hi(&self) -> i128 {
        self.hi
    }

    pub fn as_exact(&self) -> Option<i128> {
        if self.lo == self.hi {
            Some(self.lo)
        } else {
            None
        }
    }

    pub fn contains(&self, v: i128) -> bool {
        self.lo <= v && v <= self.hi
    }

    pub fn is_full(&self, bits: u32) -> bool {
        self.lo <= i_min(bits) && u_max(bits) <= self.hi
    }

    /// Number of integers in the range, saturating.
    pub fn width(&self) -> u128 {
        (self.hi - self.lo) as u128 + 1
    }

    pub fn hull(&self, other: &Self) -> Self {
        Interval {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        Interval::new(self.lo.max(other.lo), self.hi.min(other.hi))
    }

    fn within(&self, lo: i128, hi: i128) -> bool {
        lo <= self.lo && self.hi <= hi
    }

    fn is_nonneg(&self) -> bool {
        self.lo >= 0
    }

    /// Every value in the range reads the same as a signed integer.
    fn is_signed(&self, bits: u32) -> bool {
        self.within(i_min(bits), i_max(bits))
    }

    /// Clamp to the representable window, or give up.
    fn fit(lo: i128, hi: i128, bits: u32) -> Self {
        let r = Interval { lo, hi };
        if r.within(i_min(bits), u_max(bits)) {
            r
        } else {
            Interval::full(bits)
        }
    }

    pub fn binary(op: BinOp, l: &Self, r: &Self, bits: u32) -> Self {
        let full = Interval::full(bits);
        match op {
            BinOp::Add => Self::fit(l.lo + r.lo, l.hi + r.hi, bits),
            BinOp::Sub => Self::fit(l.lo - r.hi, l.hi - r.lo, bits),
            BinOp::Mul => {
                let ps = [
                    l.lo.checked_mul(r.lo),
                    l.lo.checked_mul(r.hi),
                    l.hi.checked_mul(r.lo),
                    l.hi.checked_mul(r.hi),
                ];
                match ps.iter().copied().collect::<Option<Vec<_>>>() {
                    Some(ps) => {
                        let lo = ps.iter().copied().min().unwrap_or(0);
                        let hi = ps.iter().copied().max().unwrap_or(0);
                        Self::fit(lo, hi, bits)
                    }
                    None => full,
                }
            }
            BinOp::UDiv => match r.as_exact() {
                Some(c) if c > 0 && l.is_nonneg() => Self::fit(l.lo / c, l.hi / c, bits),
                _ => full,
            },
            BinOp::SDiv => match r.as_exact() {
                Some(c) if c > 0 && c <= i_max(bits) && l.is_signed(bits) => {
                    Self::fit(l.lo / c, l.hi / c, bits)
                }
                _ => full,
            },
            BinOp::URem => match r.as_exact() {
                Some(c) if c > 0 && l.is_nonneg() => Self::fit(0, (c - 1).min(l.hi), bits),
                Some(c) if c > 0 => Self::fit(0, c - 1, bits),
                _ => full,
            },
            BinOp::SRem => match r.as_exact() {
                Some(c) if c > 0 && c <= i_max(bits) && l.is_signed(bits) => {
                    if l.is_nonneg() {
                        Self::fit(0, (c - 1).min(l.hi), bits)
                    } else {
                        Self::fit(-(c - 1), c - 1, bits)
                    }
                }
                _ => full,
            },
            BinOp::And => match (l.as_exact(), r.as_exact()) {
                (Some(a), Some(b)) => Self::fit(a & b, a & b, bits),
                (_, Some(m)) if m >= 0 => Self::fit(0, m, bits),
                (Some(m), _) if m >= 0 => Self::fit(0, m, bits),
                _ if l.is_nonneg() && r.is_nonneg() => Self::fit(0, l.hi.min(r.hi), bits),
                _ => full,
            },
            BinOp::Or | BinOp::Xor => match (l.as_exact(), r.as_exact()) {
                (Some(a), Some(b)) if op == BinOp::Or => Self::fit(a | b, a | b, bits),
                (Some(a), Some(b)) => Self::fit(a ^ b, a ^ b, bits),
                _ if l.is_nonneg() && r.is_nonneg() => {
                    // Below the next power of two of the larger operand
                    let m = l.hi.max(r.hi);
                    let p = 128 - (m.leading_zeros() as i128);
                    Self::fit(0, (1i128 << p) - 1, bits)
                }
                _ => full,
            },
            BinOp::Shl => match r.as_exact() {
                Some(k) if (0..bits as i128).contains(&k) => {
                    Self::binary(BinOp::Mul, l, &Interval::exact(1i128 << k), bits)
                }
                _ => full,
            },
            BinOp::LShr => match r.as_exact() {
                Some(k) if (0..bits as i128).contains(&k) => {
                    if l.is_nonneg() {
                        Self::fit(l.lo >> k, l.hi >> k, bits)
                    } else {
                        Self::fit(0, u_max(bits) >> k, bits)
                    }
                }
                _ => full,
            },
            BinOp::AShr => match r.as_exact() {
                Some(k) if (0..bits as i128).contains(&k) && l.is_signed(bits) => {
                    Self::fit(l.lo >> k, l.hi >> k, bits)
                }
                _ => full,
            },
        }
    }

    pub fn cast(kind: CastKind, v: &Self, from: u32, to: u32) -> Self {
        match kind {
            CastKind::ZExt => {
                if v.is_nonneg() {
                    Self::fit(v.lo, v.hi, to)
                } else if v.hi < 0 {
                    Self::fit(v.lo + (1i128 << from), v.hi + (1i128 << from), to)
                } else {
                    Self::fit(0, u_max(from), to)
                }
            }
            CastKind::SExt => {
                if v.hi <= i_max(from) {
                    Self::fit(v.lo, v.hi, to)
                } else if v.lo > i_max(from) {
                    Self::fit(v.lo - (1i128 << from), v.hi - (1i128 << from), to)
                } else {
                    Self::fit(i_min(from), i_max(from), to)
                }
            }
            CastKind::Trunc => Self::fit(v.lo, v.hi, to),
            CastKind::BitCast | CastKind::PtrToInt | CastKind::IntToPtr => {
                if from == to {
                    *v
                } else {
                    Interval::full(to)
                }
            }
        }
    }

    /// Decide `l pred r`, if the ranges allow it.
    pub fn compare(pred: Predicate, l: &Self, r: &Self, bits: u32) -> Option<bool> {
        let comparable = if pred.is_unsigned() {
            l.within(0, u_max(bits)) && r.within(0, u_max(bits))
        } else if matches!(pred, Predicate::Eq | Predicate::Ne) {
            (l.within(0, u_max(bits)) && r.within(0, u_max(bits)))
                || (l.within(i_min(bits), i_max(bits)) && r.within(i_min(bits), i_max(bits)))
        } else {
            l.within(i_min(bits), i_max(bits)) && r.within(i_min(bits), i_max(bits))
        };
        if !comparable {
            return None;
        }
        match pred {
            Predicate::Eq => match (l.as_exact(), r.as_exact()) {
                (Some(a), Some(b)) => Some(a == b),
                _ if l.intersect(r).is_none() => Some(false),
                _ => None,
            },
            Predicate::Ne => Self::compare(Predicate::Eq, l, r, bits).map(|b| !b),
            Predicate::Ult | Predicate::Slt => {
                if l.hi < r.lo {
                    Some(true)
                } else if l.lo >= r.hi {
                    Some(false)
                } else {
                    None
                }
            }
            Predicate::Ule | Predicate::Sle => {
                if l.hi <= r.lo {
                    Some(true)
                } else if l.lo > r.hi {
                    Some(false)
                } else {
                    None
                }
            }
            Predicate::Ugt | Predicate::Sgt => Self::compare(pred.swap(), r, l, bits),
            Predicate::Uge | Predicate::Sge => Self::compare(pred.swap(), r, l, bits),
        }
    }

    /// Narrow `self` to the values `x` for which `x pred other` may hold.
    /// `None` means no value does.
    pub fn refine(&self, pred: Predicate, other: &Self, bits: u32) -> Option<Self> {
        let same_half = if pred.is_unsigned() {
            self.within(0, u_max(bits)) && other.within(0, u_max(bits))
        } else {
            self.within(i_min(bits), i_max(bits)) && other.within(i_min(bits), i_max(bits))
        };
        if !same_half && pred != Predicate::Eq {
            return Some(*self);
        }
        match pred {
            Predicate::Eq => {
                if same_half
                    || (self.within(0, u_max(bits)) && other.within(0, u_max(bits)))
                {
                    self.intersect(other)
                } else {
                    Some(*self)
                }
            }
            Predicate::Ne => match other.as_exact() {
                Some(c) if self.lo == c => Interval::new(self.lo + 1, self.hi),
                Some(c) if self.hi == c => Interval::new(self.lo, self.hi - 1),
                _ => Some(*self),
            },
            Predicate::Ult | Predicate::Slt => Interval::new(self.lo, self.hi.min(other.hi - 1)),
            Predicate::Ule | Predicate::Sle => Interval::new(self.lo, self.hi.min(other.hi)),
            Predicate::Ugt | Predicate::Sgt => Interval::new(self.lo.max(other.lo + 1), self.hi),
            Predicate::Uge | Predicate::Sge => Interval::new(self.lo.max(other.lo), self.hi),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "[{}, {}]", self.lo, self.hi)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_join_keeps_sources() {
        let x = Taint::secret("x");
        let y = Taint::secret("y");
        let j = x.clone().join(y.clone());
        assert_eq!(Label::Secret, j.label());
        assert_eq!(2, j.sources().len());
        assert!(x < j);
        assert_eq!(None, x.partial_cmp(&y));
        assert_eq!(Label::Public, x.meet(y).label());
        assert_eq!(Label::Secret, Label::Public.join(Label::Secret));
    }

    #[test]
    fn remainder_by_constant() {
        let x = Interval::new(0, 100).unwrap();
        let r = Interval::binary(BinOp::URem, &x, &Interval::exact(3), 32);
        assert_eq!(Interval::new(0, 2).unwrap(), r);
        let s = Interval::binary(BinOp::SRem, &Interval::signed(32), &Interval::exact(3), 32);
        assert_eq!(Interval::new(-2, 2).unwrap(), s);
    }

    #[test]
    fn signed_ops_read_the_upper_half_as_negative() {
        let x = Interval::binary(BinOp::LShr, &Interval::full(32), &Interval::exact(0), 32);
        assert_eq!(Interval::new(0, u_max(32)).unwrap(), x);
        // 0xFFFFFFFF is -1, so the remainder may be negative
        let r = Interval::binary(BinOp::SRem, &x, &Interval::exact(3), 32);
        assert!(r.is_full(32));
        assert!(Interval::binary(BinOp::AShr, &x, &Interval::exact(1), 32).is_full(32));
        assert!(Interval::binary(BinOp::SDiv, &x, &Interval::exact(2), 32).is_full(32));
        let small = Interval::new(0, 100).unwrap();
        let d = Interval::binary(BinOp::SDiv, &small, &Interval::exact(u_max(32)), 32);
        assert!(d.is_full(32));
        assert_eq!(
            Interval::new(0, 33).unwrap(),
            Interval::binary(BinOp::SDiv, &small, &Interval::exact(3), 32)
        );
        assert_eq!(
            Interval::new(-4, 4).unwrap(),
            Interval::binary(BinOp::AShr, &Interval::new(-8, 8).unwrap(), &Interval::exact(1), 32)
        );
        assert_eq!(
            None,
            Interval::compare(Predicate::Slt, &r, &Interval::exact(0), 32)
        );
    }

    #[test]
    fn overflow_goes_to_full() {
        let big = Interval::new(0, u_max(8)).unwrap();
        let r = Interval::binary(BinOp::Add, &big, &Interval::exact(1), 8);
        assert!(r.is_full(8));
    }

    #[test]
    fn compare_and_refine() {
        let i = Interval::new(0, 20).unwrap();
        assert_eq!(
            None,
            Interval::compare(Predicate::Slt, &i, &Interval::exact(20), 32)
        );
        assert_eq!(
            Some(true),
            Interval::compare(Predicate::Slt, &Interval::exact(3), &Interval::exact(20), 32)
        );
        assert_eq!(
            Some(false),
            Interval::compare(Predicate::Ugt, &Interval::exact(3), &Interval::exact(20), 32)
        );
        assert_eq!(
            Some(Interval::new(0, 19).unwrap()),
            i.refine(Predicate::Slt, &Interval::exact(20), 32)
        );
        assert_eq!(None, i.refine(Predicate::Sgt, &Interval::exact(20), 32));
        assert_eq!(
            Some(Interval::new(1, 20).unwrap()),
            i.refine(Predicate::Ne, &Interval::exact(0), 32)
        );
        // -1 and 255 are the same i8, so unsigned compares stay undecided
        assert_eq!(
            None,
            Interval::compare(Predicate::Ult, &Interval::exact(-1), &Interval::exact(3), 8)
        );
    }
}
