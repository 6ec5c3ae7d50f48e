// SPDX-License-Identifier: BSD-3-Clause
//! Violations, path errors and per-function reports

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::ir::{BlockName, Function, FunctionName, InstructionName};
use crate::lattice::Source;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    Load,
    Store,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Load => write!(f, "load"),
            Access::Store => write!(f, "store"),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ViolationKind {
    /// A conditional branch or switch on secret data
    SecretBranch,
    /// A load or store through a secret address
    SecretAddress { access: Access },
    /// A loop whose exit condition is secret
    UnboundedSecretLoop,
    /// An indirect call through a secret function pointer
    SecretCallTarget,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::SecretBranch => write!(f, "branch on secret data"),
            ViolationKind::SecretAddress { access } => {
                write!(f, "{} through a secret address", access)
            }
            ViolationKind::UnboundedSecretLoop => write!(f, "loop bound depends on secret data"),
            ViolationKind::SecretCallTarget => write!(f, "call through a secret function pointer"),
        }
    }
}

/// What a path did at a point where several continuations were possible.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Choice {
    Block(BlockName),
    Callee(FunctionName),
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Block(b) => write!(f, "{}", b),
            Choice::Callee(c) => write!(f, "{}", c),
        }
    }
}

/// One conjunct of a path condition.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Decision {
    pub at: InstructionName,
    pub taken: Choice,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.at, self.taken)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub function: FunctionName,
    pub instruction: InstructionName,
    #[serde(flatten)]
    pub kind: ViolationKind,
    /// The first path found to reach the violation
    pub path: Vec<Decision>,
    /// Secret inputs the offending value was derived from
    pub causes: BTreeSet<Source>,
    /// Number of paths that reached it, when identical violations are merged
    pub count: usize,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.instruction, self.kind)?;
        if !self.causes.is_empty() {
            write!(f, " (")?;
            for (i, c) in self.causes.iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, ")")?;
        }
        if self.count > 1 {
            write!(f, " on {} paths", self.count)?;
        }
        Ok(())
    }
}

/// Why a path could not be followed to its end. None of these are
/// constant-time violations: they make the verdict for the path unknown.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum PathError {
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),
    #[error("unresolved pointer: {0}")]
    UnresolvedPointer(String),
    #[error("null pointer dereference: {0}")]
    NullPointerDereference(String),
    #[error("reached an unreachable instruction")]
    UnreachableInstruction,
    #[error("block {block} entered more than {bound} times")]
    LoopBoundExceeded { block: BlockName, bound: usize },
    #[error("path exceeded {0} steps")]
    StepBudgetExceeded(usize),
    #[error("calls nested more than {0} deep")]
    CallDepthExceeded(usize),
}

impl PathError {
    /// Whether the error comes from an exploration bound rather than from
    /// the code under analysis.
    pub fn is_budget(&self) -> bool {
        match self {
            PathError::LoopBoundExceeded { .. } => true,
            PathError::StepBudgetExceeded(_) => true,
            PathError::CallDepthExceeded(_) => true,
            // No `_` pattern to ensure this is updated if the type changes
            PathError::UnsupportedConstruct(_) => false,
            PathError::UnresolvedPointer(_) => false,
            PathError::NullPointerDereference(_) => false,
            PathError::UnreachableInstruction => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PathError::UnsupportedConstruct(_) => "unsupported-construct",
            PathError::UnresolvedPointer(_) => "unresolved-pointer",
            PathError::NullPointerDereference(_) => "null-pointer-dereference",
            PathError::UnreachableInstruction => "unreachable-instruction",
            PathError::LoopBoundExceeded { .. } => "loop-bound-exceeded",
            PathError::StepBudgetExceeded(_) => "step-budget-exceeded",
            PathError::CallDepthExceeded(_) => "call-depth-exceeded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathErrorRecord {
    pub instruction: InstructionName,
    pub error: PathError,
    pub path: Vec<Decision>,
    pub count: usize,
}

impl fmt::Display for PathErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.instruction, self.error)?;
        if self.count > 1 {
            write!(f, " on {} paths", self.count)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PathStatistics {
    /// Paths followed to a return from the analyzed function
    pub completed: usize,
    /// Paths with at least one violation
    pub violating: usize,
    /// Paths found infeasible
    pub pruned: usize,
    /// Paths abandoned, per error kind
    pub errors: BTreeMap<String, usize>,
    /// Paths never explored because the path budget ran out
    pub unexplored: usize,
    /// Instructions and terminators evaluated, over all paths
    pub steps: u64,
}

/// Blocks of one function reached on some path.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockCoverage {
    pub seen: usize,
    pub total: usize,
    pub percentage: f64,
    /// In the order they appear in the function
    pub missed: Vec<BlockName>,
}

impl BlockCoverage {
    fn new(blocks: &[(BlockName, bool)]) -> Self {
        let seen = blocks.iter().filter(|(_, s)| *s).count();
        let total = blocks.len();
        BlockCoverage {
            seen,
            total,
            percentage: if total == 0 {
                100.0
            } else {
                100.0 * seen as f64 / total as f64
            },
            missed: blocks
                .iter()
                .filter(|(_, s)| !*s)
                .map(|(b, _)| b.clone())
                .collect(),
        }
    }
}

impl fmt::Display for BlockCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}% ({}/{})", self.percentage, self.seen, self.total)?;
        if !self.missed.is_empty() {
            write!(f, ", missed:")?;
            for b in &self.missed {
                write!(f, " {}", b)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Every path was explored and none violates constant time
    Clean,
    /// Some path violates constant time
    Violating,
    /// No violation found, but some paths could not be analyzed
    Inconclusive,
    /// An exploration budget ran out
    Incomplete,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Clean => write!(f, "clean"),
            Status::Violating => write!(f, "violating"),
            Status::Inconclusive => write!(f, "inconclusive"),
            Status::Incomplete => write!(f, "incomplete"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub function: FunctionName,
    pub status: Status,
    pub violations: Vec<Violation>,
    pub errors: Vec<PathErrorRecord>,
    pub statistics: PathStatistics,
    /// Per function entered, the analyzed one included
    pub coverage: BTreeMap<FunctionName, BlockCoverage>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.status == Status::Clean
    }

    pub fn violations_of(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }

    /// Block coverage of the analyzed function.
    pub fn coverage(&self) -> Option<&BlockCoverage> {
        self.coverage.get(&self.function)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.function, self.status)?;
        for v in &self.violations {
            writeln!(f, "  violation: {}", v)?;
            for d in &v.path {
                writeln!(f, "    {}", d)?;
            }
        }
        for e in &self.errors {
            writeln!(f, "  error: {}", e)?;
        }
        let s = &self.statistics;
        write!(
            f,
            "  paths: {} completed, {} violating, {} pruned",
            s.completed, s.violating, s.pruned
        )?;
        for (kind, n) in &s.errors {
            write!(f, ", {} {}", n, kind)?;
        }
        if s.unexplored != 0 {
            write!(f, ", {} unexplored", s.unexplored)?;
        }
        if let Some(c) = self.coverage() {
            write!(f, "\n  block coverage: {}", c)?;
        }
        for (name, c) in &self.coverage {
            if *name != self.function {
                write!(f, "\n  block coverage of {}: {}", name, c)?;
            }
        }
        Ok(())
    }
}

/// Accumulates the findings of one function's exploration.
#[derive(Debug)]
pub(crate) struct Reporter {
    function: FunctionName,
    dedup: bool,
    violations: Vec<Violation>,
    seen: FxHashMap<(InstructionName, ViolationKind, BTreeSet<Source>), usize>,
    errors: Vec<PathErrorRecord>,
    seen_errors: FxHashMap<(InstructionName, PathError), usize>,
    statistics: PathStatistics,
    blocks: BTreeMap<FunctionName, Vec<(BlockName, bool)>>,
    exhausted: bool,
}

impl Reporter {
    pub(crate) fn new(function: FunctionName, dedup: bool) -> Self {
        Reporter {
            function,
            dedup,
            violations: Vec::new(),
            seen: FxHashMap::default(),
            errors: Vec::new(),
            seen_errors: FxHashMap::default(),
            statistics: PathStatistics::default(),
            blocks: BTreeMap::new(),
            exhausted: false,
        }
    }

    /// Returns whether this is a new violation.
    pub(crate) fn record(
        &mut self,
        instruction: InstructionName,
        kind: ViolationKind,
        causes: BTreeSet<Source>,
        path: &[Decision],
    ) -> bool {
        debug!(%instruction, %kind, "violation");
        if self.dedup {
            let key = (instruction.clone(), kind, causes.clone());
            if let Some(i) = self.seen.get(&key) {
                self.violations[*i].count += 1;
                return false;
            }
            self.seen.insert(key, self.violations.len());
        }
        self.violations.push(Violation {
            function: self.function.clone(),
            instruction,
            kind,
            path: path.to_vec(),
            causes,
            count: 1,
        });
        true
    }

    pub(crate) fn record_error(
        &mut self,
        instruction: InstructionName,
        error: PathError,
        path: &[Decision],
    ) {
        debug!(%instruction, %error, "path error");
        let key = (instruction.clone(), error.clone());
        if let Some(i) = self.seen_errors.get(&key) {
            self.errors[*i].count += 1;
            return;
        }
        self.seen_errors.insert(key, self.errors.len());
        self.errors.push(PathErrorRecord {
            instruction,
            error,
            path: path.to_vec(),
            count: 1,
        });
    }

    pub(crate) fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub(crate) fn completed(&mut self, violating: bool) {
        self.statistics.completed += 1;
        if violating {
            self.statistics.violating += 1;
        }
    }

    /// A path cut short by the keep-going policy after a violation.
    pub(crate) fn stopped(&mut self) {
        self.statistics.violating += 1;
    }

    pub(crate) fn pruned(&mut self) {
        self.statistics.pruned += 1;
    }

    pub(crate) fn abandoned(&mut self, error: &PathError, violating: bool) {
        *self
            .statistics
            .errors
            .entry(error.kind().to_string())
            .or_default() += 1;
        if violating {
            self.statistics.violating += 1;
        }
    }

    pub(crate) fn unexplored(&mut self, n: usize) {
        if n != 0 {
            self.statistics.unexplored += n;
            self.exhausted = true;
        }
    }

    /// Some path entered block `block` of `function`.
    pub(crate) fn visit(&mut self, function: &Function, block: usize) {
        if !self.blocks.contains_key(&function.name) {
            let blocks = function
                .blocks
                .iter()
                .map(|b| (b.name.clone(), false))
                .collect();
            self.blocks.insert(function.name.clone(), blocks);
        }
        if let Some(b) = self
            .blocks
            .get_mut(&function.name)
            .and_then(|bs| bs.get_mut(block))
        {
            b.1 = true;
        }
    }

    pub(crate) fn steps(&mut self, n: usize) {
        self.statistics.steps += n as u64;
    }

    pub(crate) fn finalize(self) -> Report {
        let incomplete = self.exhausted || self.errors.iter().any(|e| e.error.is_budget());
        let status = if incomplete {
            Status::Incomplete
        } else if !self.violations.is_empty() {
            Status::Violating
        } else if !self.errors.is_empty() {
            Status::Inconclusive
        } else {
            Status::Clean
        };
        Report {
            function: self.function,
            status,
            violations: self.violations,
            errors: self.errors,
            statistics: self.statistics,
            coverage: self
                .blocks
                .iter()
                .map(|(f, bs)| (f.clone(), BlockCoverage::new(bs)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(idx: usize) -> InstructionName {
        InstructionName::new("f".into(), "entry".into(), idx)
    }

    #[test]
    fn dedup_merges_identical_violations() {
        let mut r = Reporter::new("f".into(), true);
        let causes = BTreeSet::from([Source::from("x")]);
        assert!(r.record(at(1), ViolationKind::SecretBranch, causes.clone(), &[]));
        assert!(!r.record(at(1), ViolationKind::SecretBranch, causes.clone(), &[]));
        assert!(r.record(
            at(1),
            ViolationKind::SecretAddress {
                access: Access::Load
            },
            causes,
            &[]
        ));
        let report = r.finalize();
        assert_eq!(Status::Violating, report.status);
        assert_eq!(2, report.violations.len());
        assert_eq!(2, report.violations[0].count);
    }

    #[test]
    fn budget_errors_make_reports_incomplete() {
        let mut r = Reporter::new("f".into(), true);
        r.record_error(at(0), PathError::UnresolvedPointer("%p".to_string()), &[]);
        assert_eq!(Status::Inconclusive, r.finalize().status);

        let mut r = Reporter::new("f".into(), true);
        let e = PathError::LoopBoundExceeded {
            block: "loop".into(),
            bound: 3,
        };
        r.record_error(at(0), e.clone(), &[]);
        r.abandoned(&e, false);
        r.record(at(2), ViolationKind::SecretBranch, BTreeSet::new(), &[]);
        let report = r.finalize();
        assert_eq!(Status::Incomplete, report.status);
        assert_eq!(1, report.violations.len());
        assert_eq!(Some(&1), report.statistics.errors.get("loop-bound-exceeded"));
    }

    #[test]
    fn coverage_lists_missed_blocks() {
        let m = crate::ir::Module::from_json(
            r#"{"functions": [{"name": "f", "params": [], "blocks": [
                {"name": "entry", "terminator": {"term": "br", "target": "a"}},
                {"name": "a", "terminator": {"term": "ret"}},
                {"name": "b", "terminator": {"term": "ret"}},
                {"name": "c", "terminator": {"term": "ret"}}]}]}"#,
        )
        .unwrap();
        let f = &m.functions[&FunctionName::from("f")];
        let mut r = Reporter::new("f".into(), true);
        r.visit(f, 0);
        r.visit(f, 1);
        r.visit(f, 1);
        let report = r.finalize();
        let c = report.coverage().unwrap();
        assert_eq!((2, 4), (c.seen, c.total));
        assert_eq!(50.0, c.percentage);
        assert_eq!(vec![BlockName::from("b"), BlockName::from("c")], c.missed);
        assert!(report
            .to_string()
            .contains("block coverage: 50.0% (2/4), missed: b c"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(50.0, json["coverage"]["f"]["percentage"]);
        assert_eq!("c", json["coverage"]["f"]["missed"][1]);
    }

    #[test]
    fn serialize_violation() {
        let v = Violation {
            function: "f".into(),
            instruction: at(3),
            kind: ViolationKind::SecretAddress {
                access: Access::Store,
            },
            path: vec![Decision {
                at: at(1),
                taken: Choice::Block("then".into()),
            }],
            causes: BTreeSet::from([Source::from("x")]),
            count: 1,
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!("secret-address", json["kind"]);
        assert_eq!("store", json["access"]);
        assert_eq!("f:entry:3", json["instruction"]);
        assert_eq!("then", json["path"][0]["taken"]);
    }
}
