// SPDX-License-Identifier: BSD-3-Clause
//! Path exploration.
//!
//! A depth-first walk over the paths of one function. Each path carries
//! its own memory, call stack and path condition, and forking clones all
//! three. Memory objects are shared between paths until one of them
//! writes, so a fork costs about as much as the object table.

use rustc_hash::FxHashMap;
use tracing::{debug, trace, trace_span};

use crate::{
    ir::{
        instruction::Predicate, BlockName, Function, FunctionName, InstructionName, LocalName,
        Module, Opcode, Operand, Terminator,
    },
    lattice::{Interval, Taint},
    memory::{
        value::{Symbol, Value},
        IntValue, Memory, ObjectId, PointerValue,
    },
    report::{Choice, Decision, PathError, Report, Reporter, ViolationKind},
    signatures::Signatures,
};

use super::{cfg::Cfg, entry::Entry, KeepGoing, Options};

/// An activation of a function on one path.
#[derive(Clone, Debug)]
pub(crate) struct Frame<'m> {
    pub(crate) function: &'m Function,
    pub(crate) block: usize,
    /// Next instruction; the terminator once past the last one
    pub(crate) idx: usize,
    pub(crate) locals: FxHashMap<LocalName, Value>,
    pub(crate) allocas: Vec<ObjectId>,
    /// Where the caller wants the return value
    pub(crate) result: Option<LocalName>,
    visits: FxHashMap<usize, usize>,
}

impl<'m> Frame<'m> {
    pub(crate) fn new(
        function: &'m Function,
        args: Vec<Value>,
        result: Option<LocalName>,
    ) -> Self {
        let mut args = args.into_iter();
        let locals = function
            .params
            .iter()
            .map(|p| (p.name.clone(), args.next().unwrap_or(Value::Undef)))
            .collect();
        Frame {
            function,
            block: 0,
            idx: 0,
            locals,
            allocas: Vec::new(),
            result,
            visits: FxHashMap::default(),
        }
    }
}

/// Everything one path knows.
#[derive(Clone, Debug)]
pub(crate) struct PathState<'m> {
    pub(crate) memory: Memory,
    pub(crate) frame: Frame<'m>,
    pub(crate) callers: Vec<Frame<'m>>,
    pub(crate) decisions: Vec<Decision>,
    /// Ranges learned from branches, per symbol
    ints: FxHashMap<Symbol, Interval>,
    /// Pointer nullness learned from branches: `true` means non-null
    nulls: FxHashMap<Symbol, bool>,
    pub(crate) violated: bool,
    pub(crate) steps: usize,
    next_symbol: Symbol,
}

impl<'m> PathState<'m> {
    pub(crate) fn new(function: &'m Function, entry: Entry) -> Self {
        PathState {
            memory: entry.memory,
            frame: Frame::new(function, entry.args, None),
            callers: Vec::new(),
            decisions: Vec::new(),
            ints: FxHashMap::default(),
            nulls: FxHashMap::default(),
            violated: false,
            steps: 0,
            next_symbol: entry.next_symbol,
        }
    }

    pub(crate) fn fresh(&mut self) -> Symbol {
        let s = self.next_symbol;
        self.next_symbol += 1;
        s
    }

    /// The instruction or terminator about to be evaluated.
    pub(crate) fn position(&self) -> InstructionName {
        let f = self.frame.function;
        f.instruction_name(&f.blocks[self.frame.block].name, self.frame.idx)
    }

    pub(crate) fn range_of(&self, i: &IntValue) -> Interval {
        match i.symbol.and_then(|s| self.ints.get(&s)) {
            Some(r) => i.range.intersect(r).unwrap_or(*r),
            None => i.range,
        }
    }

    /// Apply what the path condition says about `v`.
    pub(crate) fn refine(&self, v: Value) -> Value {
        match v {
            Value::Int(mut i) => {
                i.range = self.range_of(&i);
                Value::Int(i)
            }
            Value::Ptr(mut p) => {
                match p.symbol.and_then(|s| self.nulls.get(&s)) {
                    Some(true) => p.maybe_null = false,
                    Some(false) => {
                        p.targets.clear();
                        p.functions.clear();
                        p.maybe_null = true;
                    }
                    None => (),
                }
                Value::Ptr(p)
            }
            v => v,
        }
    }

    pub(crate) fn operand(&self, op: &Operand) -> Result<Value, PathError> {
        match op {
            Operand::Local(l) => self
                .frame
                .locals
                .get(l)
                .cloned()
                .map(|v| self.refine(v))
                .ok_or_else(|| {
                    PathError::UnsupportedConstruct(format!("use of {} before its definition", l))
                }),
            Operand::Int { bits, value } => {
                Ok(Value::Int(IntValue::constant(*bits, *value as i128)))
            }
            Operand::Null => Ok(Value::Ptr(PointerValue::null())),
            Operand::Function(f) => Ok(Value::Ptr(PointerValue::function(f.clone()))),
        }
    }

    /// Add "`i` is true" (or false) to the path condition. Returns whether
    /// the path is still feasible.
    pub(crate) fn assume(&mut self, i: &IntValue, outcome: bool) -> bool {
        let range = self.range_of(i);
        if let Some(v) = range.as_exact() {
            return (v != 0) == outcome;
        }
        if let Some(c) = &i.cond {
            let pred = if outcome { c.pred } else { c.pred.negate() };
            let c = c.clone();
            return self.assume_compare(pred, &c.lhs, &c.rhs);
        }
        if let Some(s) = i.symbol {
            let pred = if outcome { Predicate::Ne } else { Predicate::Eq };
            return match range.refine(pred, &Interval::exact(0), i.bits) {
                Some(r) => {
                    self.ints.insert(s, r);
                    true
                }
                None => false,
            };
        }
        true
    }

    fn assume_compare(&mut self, pred: Predicate, lhs: &Value, rhs: &Value) -> bool {
        match (self.refine(lhs.clone()), self.refine(rhs.clone())) {
            (Value::Int(a), Value::Int(b)) => {
                let bits = a.bits.max(b.bits);
                if let Some(d) = Interval::compare(pred, &a.range, &b.range, bits) {
                    return d;
                }
                let na = match a.range.refine(pred, &b.range, bits) {
                    Some(r) => r,
                    None => return false,
                };
                let nb = match b.range.refine(pred.swap(), &na, bits) {
                    Some(r) => r,
                    None => return false,
                };
                if let Some(s) = a.symbol {
                    self.ints.insert(s, na);
                }
                if let Some(s) = b.symbol {
                    self.ints.insert(s, nb);
                }
                true
            }
            (Value::Ptr(p), Value::Ptr(q)) if matches!(pred, Predicate::Eq | Predicate::Ne) => {
                let null = pred == Predicate::Eq;
                if q.is_null() {
                    self.assume_null(&p, null)
                } else if p.is_null() {
                    self.assume_null(&q, null)
                } else {
                    true
                }
            }
            _ => true,
        }
    }

    /// Add "`p` is null" (or non-null) to the path condition.
    pub(crate) fn assume_null(&mut self, p: &PointerValue, null: bool) -> bool {
        if null && !p.maybe_null {
            return false;
        }
        if !null && p.targets.is_empty() && p.functions.is_empty() {
            return false;
        }
        if let Some(s) = p.symbol {
            self.nulls.insert(s, !null);
        }
        true
    }

    /// Values of width `bits` congruent to `c`.
    fn candidates(bits: u32, c: i64) -> [i128; 3] {
        let m = 1i128 << bits;
        let c = c as i128;
        [c, c - m, c + m]
    }

    pub(crate) fn assume_equal(&mut self, i: &IntValue, c: i64) -> bool {
        let range = self.range_of(i);
        let hits: Vec<i128> = Self::candidates(i.bits, c)
            .into_iter()
            .filter(|v| range.contains(*v))
            .collect();
        match (hits.as_slice(), i.symbol) {
            ([], _) => false,
            ([v], Some(s)) => {
                self.ints.insert(s, Interval::exact(*v));
                true
            }
            _ => true,
        }
    }

    pub(crate) fn assume_excludes(&mut self, i: &IntValue, cs: &[i64]) -> bool {
        let mut range = self.range_of(i);
        for c in cs {
            for v in Self::candidates(i.bits, *c) {
                range = match range.refine(Predicate::Ne, &Interval::exact(v), i.bits) {
                    Some(r) => r,
                    None => return false,
                };
            }
        }
        if let Some(s) = i.symbol {
            self.ints.insert(s, range);
        }
        true
    }
}

/// What a step did to its path.
pub(crate) enum Flow<'m> {
    Continue,
    /// The path split. An empty vector means every continuation ended.
    Fork(Vec<PathState<'m>>),
    /// Returned from the analyzed function
    Complete,
}

/// What a successor may assume on entry.
#[derive(Clone, Debug)]
enum Assumption {
    Free,
    Truth(IntValue, bool),
    Equals(IntValue, i64),
    Excludes(IntValue, Vec<i64>),
}

pub(crate) struct Explorer<'m> {
    pub(crate) module: &'m Module,
    pub(crate) signatures: &'m Signatures,
    pub(crate) opts: &'m Options,
    cfgs: FxHashMap<FunctionName, Cfg>,
    pub(crate) reporter: Reporter,
}

impl<'m> Explorer<'m> {
    pub(crate) fn new(
        module: &'m Module,
        signatures: &'m Signatures,
        opts: &'m Options,
        function: &FunctionName,
    ) -> Self {
        Explorer {
            module,
            signatures,
            opts,
            cfgs: FxHashMap::default(),
            reporter: Reporter::new(function.clone(), opts.dedup),
        }
    }

    pub(crate) fn explore(mut self, initial: PathState<'m>) -> Report {
        let span = trace_span!("explore", function = %initial.frame.function.name);
        let _span = span.enter();

        self.reporter.visit(initial.frame.function, initial.frame.block);
        let mut worklist = vec![initial];
        let mut started = 1usize;
        let mut steps = 0usize;
        while let Some(state) = worklist.pop() {
            let mut forks = self.run(state, &mut steps);
            if self.opts.keep_going == KeepGoing::Stop && self.reporter.has_violations() {
                debug!(dropped = worklist.len() + forks.len(), "stopping at first violation");
                break;
            }
            if forks.is_empty() {
                continue;
            }
            if let Some(max) = self.opts.max_paths {
                let room = max.saturating_sub(started);
                if forks.len() - 1 > room {
                    let dropped = forks.len() - 1 - room;
                    forks.truncate(room + 1);
                    self.reporter.unexplored(dropped);
                }
            }
            started += forks.len() - 1;
            worklist.extend(forks.into_iter().rev());
        }
        self.reporter.steps(steps);
        self.reporter.finalize()
    }

    /// Follow one path until it ends or splits.
    fn run(&mut self, mut state: PathState<'m>, steps: &mut usize) -> Vec<PathState<'m>> {
        loop {
            if state.steps >= self.opts.max_steps {
                let at = state.position();
                self.abandon(at, &state, PathError::StepBudgetExceeded(self.opts.max_steps));
                return Vec::new();
            }
            state.steps += 1;
            *steps += 1;
            let flow = self.step(&mut state);
            let stop = self.opts.keep_going != KeepGoing::Full;
            match flow {
                Ok(Flow::Continue) => {
                    if stop && state.violated {
                        self.reporter.stopped();
                        return Vec::new();
                    }
                }
                Ok(Flow::Complete) => {
                    trace!(decisions = state.decisions.len(), "path complete");
                    self.reporter.completed(state.violated);
                    return Vec::new();
                }
                Ok(Flow::Fork(mut states)) => {
                    if stop && states.iter().any(|s| s.violated) {
                        self.reporter.stopped();
                        return Vec::new();
                    }
                    match states.pop() {
                        Some(only) if states.is_empty() => state = only,
                        Some(last) => {
                            states.push(last);
                            return states;
                        }
                        None => return Vec::new(),
                    }
                }
                Err(e) => {
                    let at = state.position();
                    self.abandon(at, &state, e);
                    return Vec::new();
                }
            }
        }
    }

    pub(crate) fn abandon(&mut self, at: InstructionName, state: &PathState<'m>, e: PathError) {
        self.reporter.abandoned(&e, state.violated);
        self.reporter.record_error(at, e, &state.decisions);
    }

    pub(crate) fn violation(
        &mut self,
        state: &mut PathState<'m>,
        kind: ViolationKind,
        taint: &Taint,
    ) {
        self.reporter.record(
            state.position(),
            kind,
            taint.sources().clone(),
            &state.decisions,
        );
        state.violated = true;
    }

    fn cfg(&mut self, function: &'m Function) -> &Cfg {
        self.cfgs
            .entry(function.name.clone())
            .or_insert_with(|| Cfg::new(function))
    }

    fn step(&mut self, state: &mut PathState<'m>) -> Result<Flow<'m>, PathError> {
        let function = state.frame.function;
        let block = &function.blocks[state.frame.block];
        match block.instrs.get(state.frame.idx) {
            Some(instr) => self.instruction(state, instr),
            None => self.terminator(state, &block.terminator),
        }
    }

    /// Move to the start of `target`, evaluating its phis.
    fn jump(&mut self, state: &mut PathState<'m>, target: &BlockName) -> Result<(), PathError> {
        let function = state.frame.function;
        let pos = function.block_position(target).ok_or_else(|| {
            PathError::UnsupportedConstruct(format!("branch to unknown block {}", target))
        })?;
        let visits = state.frame.visits.entry(pos).or_insert(0);
        *visits += 1;
        if *visits > self.opts.loop_bound {
            return Err(PathError::LoopBoundExceeded {
                block: target.clone(),
                bound: self.opts.loop_bound,
            });
        }

        // Phis read their operands simultaneously
        let from = &function.blocks[state.frame.block].name;
        let block = &function.blocks[pos];
        let mut values = Vec::new();
        for instr in &block.instrs {
            let phi = match &instr.opcode {
                Opcode::Phi(p) => p,
                _ => break,
            };
            let op = phi
                .incoming
                .iter()
                .find(|(_, pred)| pred == from)
                .map(|(o, _)| o)
                .ok_or_else(|| {
                    PathError::UnsupportedConstruct(format!(
                        "phi in {} has no value for predecessor {}",
                        target, from
                    ))
                })?;
            values.push((instr.result.clone(), state.operand(op)?));
        }
        let n = values.len();
        for (r, v) in values {
            if let Some(r) = r {
                state.frame.locals.insert(r, v);
            }
        }
        state.frame.block = pos;
        state.frame.idx = n;
        self.reporter.visit(function, pos);
        Ok(())
    }

    fn terminator(
        &mut self,
        state: &mut PathState<'m>,
        term: &'m Terminator,
    ) -> Result<Flow<'m>, PathError> {
        match term {
            Terminator::Br { target } => {
                self.jump(state, target)?;
                Ok(Flow::Continue)
            }
            Terminator::CondBr {
                cond,
                then,
                otherwise,
            } => self.cond_br(state, cond, then, otherwise),
            Terminator::Switch {
                value,
                default,
                cases,
            } => self.switch(state, value, default, cases),
            Terminator::Ret { value } => self.ret(state, value.as_ref()),
            Terminator::Unreachable => Err(PathError::UnreachableInstruction),
        }
    }

    fn cond_br(
        &mut self,
        state: &mut PathState<'m>,
        cond: &Operand,
        then: &'m BlockName,
        otherwise: &'m BlockName,
    ) -> Result<Flow<'m>, PathError> {
        let c = state.operand(cond)?;
        if then == otherwise {
            self.jump(state, then)?;
            return Ok(Flow::Continue);
        }
        let at = state.position();

        if c.is_secret() {
            let function = state.frame.function;
            let block = state.frame.block;
            let exit = match (function.block_position(then), function.block_position(otherwise)) {
                (Some(t), Some(o)) => self.cfg(function).loop_exit(block, t, o).map(|e| e == t),
                _ => None,
            };
            if let Some(exit_is_then) = exit {
                self.violation(state, ViolationKind::UnboundedSecretLoop, &c.taint());
                let target = if exit_is_then { then } else { otherwise };
                state.decisions.push(Decision {
                    at,
                    taken: Choice::Block(target.clone()),
                });
                self.jump(state, target)?;
                return Ok(Flow::Continue);
            }
            self.violation(state, ViolationKind::SecretBranch, &c.taint());
            if self.opts.keep_going != KeepGoing::Full {
                return Ok(Flow::Continue);
            }
            let arms = vec![(then, Assumption::Free), (otherwise, Assumption::Free)];
            return Ok(Flow::Fork(self.fork(state, at, arms)));
        }

        let arms = match c {
            Value::Int(i) => {
                if let Some(v) = i.range.as_exact() {
                    self.jump(state, if v != 0 { then } else { otherwise })?;
                    return Ok(Flow::Continue);
                }
                vec![
                    (then, Assumption::Truth(i.clone(), true)),
                    (otherwise, Assumption::Truth(i, false)),
                ]
            }
            _ => vec![(then, Assumption::Free), (otherwise, Assumption::Free)],
        };
        Ok(Flow::Fork(self.fork(state, at, arms)))
    }

    fn switch(
        &mut self,
        state: &mut PathState<'m>,
        value: &Operand,
        default: &'m BlockName,
        cases: &'m [(i64, BlockName)],
    ) -> Result<Flow<'m>, PathError> {
        let v = state.operand(value)?;
        let at = state.position();

        if v.is_secret() {
            self.violation(state, ViolationKind::SecretBranch, &v.taint());
            if self.opts.keep_going != KeepGoing::Full {
                return Ok(Flow::Continue);
            }
            let mut targets: Vec<&'m BlockName> = Vec::new();
            for b in std::iter::once(default).chain(cases.iter().map(|(_, b)| b)) {
                if !targets.contains(&b) {
                    targets.push(b);
                }
            }
            let arms = targets.into_iter().map(|b| (b, Assumption::Free)).collect();
            return Ok(Flow::Fork(self.fork(state, at, arms)));
        }

        let i = match v {
            Value::Int(i) => i,
            v => {
                return Err(PathError::UnsupportedConstruct(format!(
                    "switch on non-integer {}",
                    v
                )))
            }
        };
        if let Some(x) = i.range.as_exact() {
            let m = 1i128 << i.bits;
            let target = cases
                .iter()
                .find(|(c, _)| (*c as i128 - x).rem_euclid(m) == 0)
                .map(|(_, b)| b)
                .unwrap_or(default);
            self.jump(state, target)?;
            return Ok(Flow::Continue);
        }
        let mut arms: Vec<(&'m BlockName, Assumption)> = cases
            .iter()
            .map(|(c, b)| (b, Assumption::Equals(i.clone(), *c)))
            .collect();
        let excluded = cases.iter().map(|(c, _)| *c).collect();
        arms.push((default, Assumption::Excludes(i, excluded)));
        Ok(Flow::Fork(self.fork(state, at, arms)))
    }

    /// One successor state per feasible arm.
    fn fork(
        &mut self,
        state: &PathState<'m>,
        at: InstructionName,
        arms: Vec<(&'m BlockName, Assumption)>,
    ) -> Vec<PathState<'m>> {
        let mut out = Vec::with_capacity(arms.len());
        for (target, assumption) in arms {
            let mut s = state.clone();
            let feasible = match &assumption {
                Assumption::Free => true,
                Assumption::Truth(i, outcome) => s.assume(i, *outcome),
                Assumption::Equals(i, c) => s.assume_equal(i, *c),
                Assumption::Excludes(i, cs) => s.assume_excludes(i, cs),
            };
            if !feasible {
                trace!(%at, %target, "infeasible");
                self.reporter.pruned();
                continue;
            }
            s.decisions.push(Decision {
                at: at.clone(),
                taken: Choice::Block(target.clone()),
            });
            match self.jump(&mut s, target) {
                Ok(()) => out.push(s),
                Err(e) => self.abandon(at.clone(), &s, e),
            }
        }
        out
    }

    fn ret(
        &mut self,
        state: &mut PathState<'m>,
        value: Option<&Operand>,
    ) -> Result<Flow<'m>, PathError> {
        let v = match value {
            Some(o) => state.operand(o)?,
            None => Value::Undef,
        };
        for id in std::mem::take(&mut state.frame.allocas) {
            state
                .memory
                .kill(id)
                .map_err(|e| PathError::UnresolvedPointer(e.to_string()))?;
        }
        match state.callers.pop() {
            None => {
                trace!(value = %v, "return");
                Ok(Flow::Complete)
            }
            Some(caller) => {
                let callee = std::mem::replace(&mut state.frame, caller);
                if let Some(r) = callee.result {
                    state.frame.locals.insert(r, v);
                }
                Ok(Flow::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::value::Condition;
    use triomphe::Arc;

    fn function() -> Function {
        let m = Module::from_json(
            r#"{"functions": [{"name": "f", "params": [{"name": "n", "ty": "i32"}],
                "blocks": [{"name": "entry", "terminator": {"term": "ret"}}]}]}"#,
        )
        .unwrap();
        m.functions[&FunctionName::from("f")].clone()
    }

    fn symbolic(range: Interval, symbol: Symbol) -> IntValue {
        IntValue {
            taint: Taint::public(),
            bits: 32,
            range,
            symbol: Some(symbol),
            cond: None,
        }
    }

    #[test]
    fn branches_narrow_symbols() {
        let f = function();
        let n = symbolic(Interval::new(0, 20).unwrap(), 0);
        let entry = Entry {
            memory: Memory::new(),
            args: vec![Value::Int(n.clone())],
            next_symbol: 1,
        };
        let mut state = PathState::new(&f, entry);
        let cond = IntValue {
            taint: Taint::public(),
            bits: 1,
            range: Interval::full(1),
            symbol: None,
            cond: Some(Arc::new(Condition {
                pred: Predicate::Ult,
                lhs: Value::Int(n.clone()),
                rhs: Value::Int(IntValue::constant(32, 5)),
            })),
        };
        let mut taken = state.clone();
        assert!(taken.assume(&cond, true));
        match taken.operand(&Operand::local("n")).unwrap() {
            Value::Int(i) => assert_eq!(Interval::new(0, 4).unwrap(), i.range),
            v => panic!("unexpected {}", v),
        }
        assert!(state.assume(&cond, false));
        assert!(!state.assume(&cond, true));
        assert!(!state.assume_equal(&n, 3));
        assert!(state.assume_equal(&n, 7));
        assert_eq!(Interval::exact(7), state.range_of(&n));
    }

    #[test]
    fn null_guards_refine_pointers() {
        let f = function();
        let entry = Entry {
            memory: Memory::new(),
            args: Vec::new(),
            next_symbol: 0,
        };
        let mut state = PathState::new(&f, entry);
        let mut p = PointerValue::to(crate::memory::Location::new(ObjectId(0), 0));
        p.maybe_null = true;
        p.symbol = Some(9);
        let mut null = state.clone();
        assert!(null.assume_null(&p, true));
        assert!(null.assume_null(&p, true));
        match null.refine(Value::Ptr(p.clone())) {
            Value::Ptr(q) => assert!(q.is_null()),
            v => panic!("unexpected {}", v),
        }
        assert!(state.assume_null(&p, false));
        match state.refine(Value::Ptr(p)) {
            Value::Ptr(q) => assert!(!q.maybe_null),
            v => panic!("unexpected {}", v),
        }
        assert!(!state.assume_null(&PointerValue::null(), false));
    }

    #[test]
    fn default_arm_excludes_cases() {
        let f = function();
        let entry = Entry {
            memory: Memory::new(),
            args: Vec::new(),
            next_symbol: 1,
        };
        let mut state = PathState::new(&f, entry);
        let n = symbolic(Interval::new(0, 2).unwrap(), 0);
        assert!(state.assume_excludes(&n, &[0, 2]));
        assert_eq!(Interval::exact(1), state.range_of(&n));
        assert!(!state.assume_excludes(&n, &[1]));
    }
}
