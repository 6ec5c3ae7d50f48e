// SPDX-License-Identifier: BSD-3-Clause
//! Instruction semantics: taint propagation, ranges and points-to.

use std::collections::BTreeSet;

use tracing::trace;
use triomphe::Arc;

use crate::{
    ir::{
        instruction::{
            Binary, Call, Cast, CastKind, FieldAddr, Icmp, IndexAddr, Load, Predicate, Select,
            Store,
        },
        FunctionName, Instruction, LocalName, Opcode, Operand, Type,
    },
    lattice::{Interval, Taint},
    memory::{
        value::Condition, IntValue, Location, MemoryError, Object, PointerValue, Region, Value,
    },
    report::{Access, Choice, Decision, PathError, ViolationKind},
    signatures::Signature,
};

use super::{
    explore::{Explorer, Flow, Frame, PathState},
    KeepGoing,
};

fn unresolved(e: MemoryError) -> PathError {
    PathError::UnresolvedPointer(e.to_string())
}

fn unsupported(e: impl std::fmt::Display) -> PathError {
    PathError::UnsupportedConstruct(e.to_string())
}

/// Locations a value points to, if it is a pointer.
fn pointees(v: &Value) -> Vec<Location> {
    match v {
        Value::Ptr(p) => p.targets.iter().copied().collect(),
        _ => Vec::new(),
    }
}

/// The result of resolving an address operand.
enum Deref {
    Targets(BTreeSet<Location>, Taint),
    /// A secret address that could not be resolved. The access is already
    /// reported, so the path goes on with unknown contents.
    Opaque(Taint),
}

/// A public integer, with a fresh symbol unless it is a constant.
fn public_int(state: &mut PathState<'_>, bits: u32, range: Interval) -> Value {
    let symbol = match range.as_exact() {
        Some(_) => None,
        None => Some(state.fresh()),
    };
    Value::Int(IntValue {
        taint: Taint::public(),
        bits,
        range,
        symbol,
        cond: None,
    })
}

fn binary(state: &mut PathState<'_>, b: &Binary) -> Result<Value, PathError> {
    let l = state.operand(&b.lhs)?;
    let r = state.operand(&b.rhs)?;
    let taint = l.taint().joined(&r.taint());
    if let (Value::Int(x), Value::Int(y)) = (&l, &r) {
        if !taint.is_secret() {
            let range = Interval::binary(b.op, &x.range, &y.range, x.bits);
            return Ok(public_int(state, x.bits, range));
        }
        return Ok(Value::Int(IntValue::unconstrained(x.bits, taint)));
    }
    let bits = match (&l, &r) {
        (Value::Int(i), _) | (_, Value::Int(i)) => i.bits,
        _ => 64,
    };
    Ok(Value::Int(IntValue::unconstrained(bits, taint)))
}

/// Decide an equality test between pointers, if the points-to sets allow.
fn pointer_compare(pred: Predicate, p: &PointerValue, q: &PointerValue) -> Option<bool> {
    let eq = if p.is_null() && q.is_null() {
        Some(true)
    } else if p.is_null() {
        if q.maybe_null {
            None
        } else {
            Some(false)
        }
    } else if q.is_null() {
        if p.maybe_null {
            None
        } else {
            Some(false)
        }
    } else if (!p.maybe_null || !q.maybe_null)
        && p.targets.is_disjoint(&q.targets)
        && p.functions.is_disjoint(&q.functions)
    {
        Some(false)
    } else {
        None
    };
    match pred {
        Predicate::Eq => eq,
        Predicate::Ne => eq.map(|b| !b),
        _ => None,
    }
}

fn icmp(state: &mut PathState<'_>, i: &Icmp) -> Result<Value, PathError> {
    let l = state.operand(&i.lhs)?;
    let r = state.operand(&i.rhs)?;
    let taint = l.taint().joined(&r.taint());
    if taint.is_secret() {
        return Ok(Value::Int(IntValue::unconstrained(1, taint)));
    }
    let decided = match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => {
            Interval::compare(i.pred, &a.range, &b.range, a.bits.max(b.bits))
        }
        (Value::Ptr(p), Value::Ptr(q)) => pointer_compare(i.pred, p, q),
        _ => None,
    };
    Ok(Value::Int(match decided {
        Some(d) => IntValue::constant(1, d as i128),
        None => IntValue {
            taint,
            bits: 1,
            range: Interval::full(1),
            symbol: None,
            cond: Some(Arc::new(Condition {
                pred: i.pred,
                lhs: l,
                rhs: r,
            })),
        },
    }))
}

fn select(state: &mut PathState<'_>, s: &Select) -> Result<Value, PathError> {
    let c = state.operand(&s.cond)?;
    let t = state.operand(&s.true_value)?;
    let f = state.operand(&s.false_value)?;
    if let Value::Int(i) = &c {
        if !i.taint.is_secret() {
            if let Some(v) = i.range.as_exact() {
                return Ok(if v != 0 { t } else { f });
            }
        }
    }
    // Branch-free: joins the taints, never a violation
    Ok(t.join(&f).taint_with(&c.taint()))
}

impl<'m> Explorer<'m> {
    pub(super) fn instruction(
        &mut self,
        state: &mut PathState<'m>,
        instr: &'m Instruction,
    ) -> Result<Flow<'m>, PathError> {
        let value = match &instr.opcode {
            Opcode::Call(c) => return self.call(state, instr.result.as_ref(), c),
            Opcode::Alloca(a) => self.alloca(state, instr.result.as_ref(), &a.ty)?,
            Opcode::Load(l) => self.load(state, l)?,
            Opcode::Store(s) => {
                self.store(state, s)?;
                Value::Undef
            }
            Opcode::Binary(b) => binary(state, b)?,
            Opcode::Icmp(i) => icmp(state, i)?,
            Opcode::Cast(c) => self.cast(state, c)?,
            Opcode::Field(f) => self.field(state, f)?,
            Opcode::Index(x) => self.index(state, x)?,
            Opcode::Select(s) => select(state, s)?,
            Opcode::Phi(_) => {
                return Err(unsupported("phi after the start of its block"));
            }
            Opcode::Other(o) => return Err(unsupported(&o.name)),
        };
        if let Some(r) = &instr.result {
            state.frame.locals.insert(r.clone(), value);
        }
        state.frame.idx += 1;
        Ok(Flow::Continue)
    }

    fn leaves(&self, ty: &Type) -> Result<usize, PathError> {
        ty.leaves(&self.module.structs).map_err(unsupported)
    }

    fn alloca(
        &self,
        state: &mut PathState<'m>,
        result: Option<&LocalName>,
        ty: &Type,
    ) -> Result<Value, PathError> {
        let n = self.leaves(ty)?;
        let name = result
            .map(|r| r.to_string())
            .unwrap_or_else(|| "alloca".to_string());
        let id = state
            .memory
            .allocate(Object::new(name, Region::Stack, vec![Value::Undef; n]));
        state.frame.allocas.push(id);
        Ok(Value::Ptr(PointerValue::to(Location::new(id, 0))))
    }

    /// A fresh object standing for memory the analysis has not seen.
    fn conjure(&self, state: &mut PathState<'m>, name: String, taint: Taint) -> PointerValue {
        let cell = Value::Unknown(taint);
        let id = state
            .memory
            .allocate(Object::summarized(name, Region::Lazy, vec![cell]));
        PointerValue::to(Location::new(id, 0))
    }

    /// An unconstrained value of type `ty`.
    fn unknown(&self, state: &mut PathState<'m>, ty: &Type, taint: Taint, origin: &str) -> Value {
        match ty {
            Type::Int { bits } if taint.is_secret() => {
                Value::Int(IntValue::unconstrained(*bits, taint))
            }
            Type::Int { bits } => public_int(state, *bits, Interval::full(*bits)),
            Type::Pointer(_) => Value::Ptr(self.conjure(state, format!("*{}", origin), taint)),
            Type::Void => Value::Undef,
            Type::Array { .. } | Type::Struct(_) => Value::Unknown(taint),
        }
    }

    fn dereference(
        &mut self,
        state: &mut PathState<'m>,
        pointer: &Operand,
        access: Access,
    ) -> Result<Deref, PathError> {
        let v = state.operand(pointer)?;
        let taint = v.taint();
        if taint.is_secret() {
            self.violation(state, ViolationKind::SecretAddress { access }, &taint);
        }
        let p = match v {
            Value::Ptr(p) => p,
            _ if taint.is_secret() => return Ok(Deref::Opaque(taint)),
            v => {
                return Err(PathError::UnresolvedPointer(format!(
                    "{} holds {}",
                    pointer, v
                )))
            }
        };
        if p.targets.is_empty() {
            if taint.is_secret() {
                return Ok(Deref::Opaque(taint));
            }
            if p.is_null() {
                return Err(PathError::NullPointerDereference(pointer.to_string()));
            }
            return Err(PathError::UnresolvedPointer(pointer.to_string()));
        }
        if p.maybe_null {
            // The null case ends here, the rest of the path assumes non-null
            let e = PathError::NullPointerDereference(pointer.to_string());
            self.abandon(state.position(), state, e);
            state.assume_null(&p, false);
        }
        Ok(Deref::Targets(p.targets, taint))
    }

    /// Read one cell as a value of type `ty`.
    fn typed_load(
        &self,
        state: &mut PathState<'m>,
        loc: Location,
        ty: &Type,
    ) -> Result<Value, PathError> {
        let cell = state.memory.read(loc).map_err(unresolved)?.clone();
        Ok(match (cell, ty) {
            (Value::Unknown(t), Type::Int { bits }) => {
                if t.is_secret() || !state.memory.is_strong(loc) {
                    Value::Int(IntValue::unconstrained(*bits, t))
                } else {
                    let v = public_int(state, *bits, Interval::full(*bits));
                    state.memory.materialize(loc, v.clone()).map_err(unresolved)?;
                    v
                }
            }
            (Value::Unknown(t), Type::Pointer(_)) => {
                let name = format!("*{}", state.memory.describe(loc));
                let p = Value::Ptr(self.conjure(state, name, t));
                state.memory.materialize(loc, p.clone()).map_err(unresolved)?;
                p
            }
            (Value::Undef, Type::Int { bits }) => {
                Value::Int(IntValue::unconstrained(*bits, Taint::public()))
            }
            (Value::Int(i), Type::Pointer(_)) => Value::Ptr(PointerValue {
                maybe_null: i.range.contains(0),
                taint: i.taint,
                ..PointerValue::null()
            }),
            (Value::Ptr(p), Type::Int { bits }) => {
                Value::Int(IntValue::unconstrained(*bits, p.taint))
            }
            (Value::Int(i), Type::Int { bits }) if i.bits != *bits => {
                Value::Int(IntValue::unconstrained(*bits, i.taint))
            }
            (v, _) => v,
        })
    }

    fn load(&mut self, state: &mut PathState<'m>, l: &Load) -> Result<Value, PathError> {
        if !matches!(l.ty, Type::Int { .. } | Type::Pointer(_)) {
            return Err(unsupported(format!("load of {}", l.ty)));
        }
        let (targets, taint) = match self.dereference(state, &l.pointer, Access::Load)? {
            Deref::Opaque(t) => return Ok(self.unknown(state, &l.ty, t, "opaque")),
            Deref::Targets(ts, t) => (ts, t),
        };
        let mut out: Option<Value> = None;
        for loc in targets {
            let v = self.typed_load(state, loc, &l.ty)?;
            out = Some(match out {
                None => v,
                Some(o) => o.join(&v),
            });
        }
        let mut v = out.unwrap_or(Value::Undef).taint_with(&taint);
        if l.volatile {
            if let Value::Int(i) = &mut v {
                i.range = Interval::full(i.bits);
                i.symbol = None;
                i.cond = None;
            }
        }
        Ok(state.refine(v))
    }

    fn store(&mut self, state: &mut PathState<'m>, s: &Store) -> Result<(), PathError> {
        let value = state.operand(&s.value)?;
        let (targets, taint) = match self.dereference(state, &s.pointer, Access::Store)? {
            Deref::Opaque(t) => {
                // Could have landed anywhere
                state.memory.taint_all(&t.joined(&value.taint()));
                return Ok(());
            }
            Deref::Targets(ts, t) => (ts, t),
        };
        let value = value.taint_with(&taint);
        let strong = targets.len() == 1;
        for loc in targets {
            state
                .memory
                .write(loc, value.clone(), strong)
                .map_err(unresolved)?;
        }
        Ok(())
    }

    fn cast(&mut self, state: &mut PathState<'m>, c: &Cast) -> Result<Value, PathError> {
        let v = state.operand(&c.operand)?;
        let to = c.ty.bits().unwrap_or(64);
        Ok(match (c.kind, v) {
            (_, Value::Undef) => Value::Undef,
            (CastKind::BitCast, v) => v,
            (CastKind::IntToPtr, Value::Int(i)) => Value::Ptr(PointerValue {
                maybe_null: i.range.contains(0),
                taint: i.taint,
                ..PointerValue::null()
            }),
            (CastKind::PtrToInt, Value::Ptr(p)) => {
                if p.is_null() {
                    Value::Int(IntValue::constant(to, 0))
                } else if p.taint.is_secret() {
                    Value::Int(IntValue::unconstrained(to, p.taint))
                } else {
                    public_int(state, to, Interval::full(to))
                }
            }
            (kind @ (CastKind::ZExt | CastKind::SExt | CastKind::Trunc), Value::Int(i)) => {
                if i.taint.is_secret() {
                    Value::Int(IntValue::unconstrained(to, i.taint))
                } else {
                    let range = Interval::cast(kind, &i.range, i.bits, to);
                    // Same number, same symbol
                    if range == i.range && kind != CastKind::Trunc {
                        Value::Int(IntValue {
                            bits: to,
                            cond: None,
                            ..i
                        })
                    } else {
                        public_int(state, to, range)
                    }
                }
            }
            (_, Value::Unknown(t)) => self.unknown(state, &c.ty, t, "cast"),
            (kind, v) => return Err(unsupported(format!("{:?} of {}", kind, v))),
        })
    }

    fn field(&mut self, state: &mut PathState<'m>, f: &FieldAddr) -> Result<Value, PathError> {
        let v = state.operand(&f.pointer)?;
        let (offset, _) = Type::Struct(f.struct_name.clone())
            .field(&self.module.structs, f.field_index())
            .map_err(unsupported)?;
        let p = match v {
            Value::Ptr(p) => p,
            Value::Unknown(t) if t.is_secret() => return Ok(Value::Unknown(t)),
            v => {
                return Err(PathError::UnresolvedPointer(format!(
                    "{} holds {}",
                    f.pointer, v
                )))
            }
        };
        let mut targets = BTreeSet::new();
        let mut failure = None;
        for loc in &p.targets {
            match state.memory.displace(*loc, offset as i128) {
                Ok(l) => {
                    targets.insert(l);
                }
                Err(e) => failure = Some(e),
            }
        }
        if let (true, Some(e)) = (targets.is_empty(), failure) {
            return Err(unresolved(e));
        }
        Ok(Value::Ptr(PointerValue {
            targets,
            functions: BTreeSet::new(),
            ..p
        }))
    }

    fn index(&mut self, state: &mut PathState<'m>, x: &IndexAddr) -> Result<Value, PathError> {
        let base = state.operand(&x.pointer)?;
        let idx = state.operand(&x.index)?;
        let stride = self.leaves(&x.element)?;
        let itaint = idx.taint();
        let p = match base {
            Value::Ptr(p) => p,
            Value::Unknown(t) if t.is_secret() => return Ok(Value::Unknown(t.joined(&itaint))),
            v => {
                return Err(PathError::UnresolvedPointer(format!(
                    "{} holds {}",
                    x.pointer, v
                )))
            }
        };
        let range = match &idx {
            Value::Int(i) if !i.taint.is_secret() => i.range,
            Value::Int(i) => Interval::full(i.bits),
            _ => Interval::full(64),
        };
        let mut targets = BTreeSet::new();
        let mut oob = false;
        for loc in &p.targets {
            let (ts, o) = state
                .memory
                .index_targets(*loc, stride, &range)
                .map_err(unresolved)?;
            oob |= o;
            targets.extend(ts);
        }
        if oob {
            trace!(pointer = %x.pointer, index = %range, "index may leave its object");
        }
        if targets.is_empty() && !p.targets.is_empty() {
            return Err(PathError::UnresolvedPointer(format!(
                "{} indexed by {} is out of bounds",
                x.pointer, range
            )));
        }
        let zero = range.as_exact() == Some(0);
        Ok(Value::Ptr(PointerValue {
            taint: p.taint.joined(&itaint),
            targets,
            functions: if zero { p.functions } else { BTreeSet::new() },
            maybe_null: p.maybe_null,
            symbol: if zero { p.symbol } else { None },
        }))
    }

    fn call(
        &mut self,
        state: &mut PathState<'m>,
        result: Option<&'m LocalName>,
        c: &'m Call,
    ) -> Result<Flow<'m>, PathError> {
        let args = c
            .args
            .iter()
            .map(|a| state.operand(a))
            .collect::<Result<Vec<_>, _>>()?;
        let targets: Vec<FunctionName> = match &c.callee {
            Operand::Function(f) => vec![f.clone()],
            callee => {
                let v = state.operand(callee)?;
                if v.is_secret() {
                    self.violation(state, ViolationKind::SecretCallTarget, &v.taint());
                }
                match v {
                    Value::Ptr(p) if !p.functions.is_empty() => p.functions.into_iter().collect(),
                    v => {
                        return Err(PathError::UnresolvedPointer(format!(
                            "call through {} holding {}",
                            callee, v
                        )))
                    }
                }
            }
        };

        if let [f] = targets.as_slice() {
            self.enter(state, f, args, result, &c.ty)?;
            return Ok(Flow::Continue);
        }
        if state.violated && self.opts.keep_going != KeepGoing::Full {
            return Ok(Flow::Continue);
        }
        let at = state.position();
        let mut out = Vec::with_capacity(targets.len());
        for f in targets {
            let mut s = state.clone();
            s.decisions.push(Decision {
                at: at.clone(),
                taken: Choice::Callee(f.clone()),
            });
            match self.enter(&mut s, &f, args.clone(), result, &c.ty) {
                Ok(()) => out.push(s),
                Err(e) => self.abandon(at.clone(), &s, e),
            }
        }
        Ok(Flow::Fork(out))
    }

    /// Continue into `f`, or apply its summary if it is external.
    fn enter(
        &mut self,
        state: &mut PathState<'m>,
        f: &FunctionName,
        args: Vec<Value>,
        result: Option<&'m LocalName>,
        ty: &Type,
    ) -> Result<(), PathError> {
        match self.module.function(f) {
            Some(def) => {
                if state.callers.len() >= self.opts.max_call_depth {
                    return Err(PathError::CallDepthExceeded(self.opts.max_call_depth));
                }
                trace!(callee = %f, depth = state.callers.len() + 1, "call");
                state.frame.idx += 1;
                let callee = Frame::new(def, args, result.cloned());
                let caller = std::mem::replace(&mut state.frame, callee);
                state.callers.push(caller);
                self.reporter.visit(def, 0);
            }
            None => {
                let v = self.external(state, f, &args, ty)?;
                if let Some(r) = result {
                    state.frame.locals.insert(r.clone(), v);
                }
                state.frame.idx += 1;
            }
        }
        Ok(())
    }

    fn external(
        &mut self,
        state: &mut PathState<'m>,
        f: &FunctionName,
        args: &[Value],
        ty: &Type,
    ) -> Result<Value, PathError> {
        let origin = format!("{}()", f);
        let sigs = match self.signatures.signatures_for(f.get()) {
            Some(sigs) => sigs,
            None => {
                let leaks = args
                    .iter()
                    .any(|a| a.is_secret() || state.memory.reaches_secret(pointees(a)));
                if leaks {
                    return Err(unsupported(format!(
                        "call to {} with secret arguments and no signature",
                        f
                    )));
                }
                return Ok(self.unknown(state, ty, Taint::public(), &origin));
            }
        };

        let source = f.to_string();
        let mut ret = None;
        for sig in sigs {
            match sig {
                Signature::ReturnPublic => {
                    ret = Some(self.unknown(state, ty, Taint::public(), &origin));
                }
                Signature::ReturnSecret => {
                    let t = Taint::secret(source.as_str());
                    ret = Some(self.unknown(state, ty, t, &origin));
                }
                Signature::PropagateTaint => {
                    let mut t = Taint::public();
                    for a in args {
                        t.absorb(&a.taint());
                        t.absorb(&state.memory.reachable_taint(pointees(a)));
                    }
                    ret = Some(self.unknown(state, ty, t, &origin));
                }
                Signature::ReturnAliasesArg { arg } => {
                    let v = args
                        .get(arg)
                        .cloned()
                        .ok_or_else(|| unsupported(format!("{} has no argument {}", f, arg)))?;
                    ret = Some(v);
                }
                Signature::ArgPointeeSecret { arg } | Signature::ArgPointeePublic { arg } => {
                    let taint = match sig {
                        Signature::ArgPointeeSecret { .. } => Taint::secret(source.as_str()),
                        _ => Taint::public(),
                    };
                    let targets = match args.get(arg) {
                        Some(Value::Ptr(p)) => &p.targets,
                        _ => {
                            return Err(PathError::UnresolvedPointer(format!(
                                "argument {} of {}",
                                arg, f
                            )))
                        }
                    };
                    for loc in targets {
                        let n = state.memory.object(loc.object).map(Object::len).unwrap_or(0);
                        for offset in 0..n {
                            let cell = Location::new(loc.object, offset);
                            state
                                .memory
                                .write(cell, Value::Unknown(taint.clone()), true)
                                .map_err(unresolved)?;
                        }
                    }
                }
            }
        }
        Ok(match ret {
            Some(v) => v,
            None => self.unknown(state, ty, Taint::public(), &origin),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_equality() {
        let a = PointerValue::to(Location::new(crate::memory::ObjectId(0), 0));
        let b = PointerValue::to(Location::new(crate::memory::ObjectId(1), 0));
        let null = PointerValue::null();
        assert_eq!(Some(false), pointer_compare(Predicate::Eq, &a, &null));
        assert_eq!(Some(true), pointer_compare(Predicate::Ne, &a, &b));
        assert_eq!(Some(true), pointer_compare(Predicate::Eq, &null, &null));
        let maybe = PointerValue {
            maybe_null: true,
            ..a.clone()
        };
        assert_eq!(None, pointer_compare(Predicate::Eq, &maybe, &null));
        assert_eq!(None, pointer_compare(Predicate::Ult, &a, &b));
    }
}
