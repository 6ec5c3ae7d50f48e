// SPDX-License-Identifier: BSD-3-Clause
//! Callgraph analysis
//!
//! Used before exploration to find the external functions a check will run
//! into and the recursion it will have to bound. Exploration itself follows
//! the function pointers it actually sees.

use std::collections::{BTreeMap, BTreeSet};

#[cfg(not(feature = "par"))]
use ascent::ascent_run;
#[cfg(feature = "par")]
use ascent::ascent_run_par as ascent_run;

use tracing::trace_span;

use crate::{
    ir::{FunctionName, Module, Opcode, Operand},
    signatures::Signatures,
};

/// Operands whose function constants escape as values, rather than being
/// called directly.
fn address_operands(opcode: &Opcode) -> Vec<&Operand> {
    match opcode {
        Opcode::Call(c) => c.args.iter().collect(),
        // No `_` pattern to ensure this is updated if the type changes
        Opcode::Alloca(_) => opcode.operands(),
        Opcode::Load(_) => opcode.operands(),
        Opcode::Store(_) => opcode.operands(),
        Opcode::Binary(_) => opcode.operands(),
        Opcode::Icmp(_) => opcode.operands(),
        Opcode::Cast(_) => opcode.operands(),
        Opcode::Field(_) => opcode.operands(),
        Opcode::Index(_) => opcode.operands(),
        Opcode::Select(_) => opcode.operands(),
        Opcode::Phi(_) => opcode.operands(),
        Opcode::Other(_) => opcode.operands(),
    }
}

/// Functions whose address is taken somewhere in the module.
pub fn address_taken(module: &Module) -> BTreeSet<FunctionName> {
    let mut taken = BTreeSet::new();
    for f in module.functions.values() {
        for b in &f.blocks {
            let ops = b
                .instrs
                .iter()
                .flat_map(|i| address_operands(&i.opcode))
                .chain(b.terminator.operands());
            for o in ops {
                if let Operand::Function(g) = o {
                    taken.insert(g.clone());
                }
            }
        }
    }
    taken
}

/// Possible targets of a call through a function pointer with `nargs`
/// arguments: functions whose address is taken and that take at most that
/// many parameters (calling a function with extra arguments is generally
/// OK in practice).
pub fn indirect_call_targets(module: &Module, nargs: usize) -> Vec<FunctionName> {
    address_taken(module)
        .into_iter()
        .filter(|f| {
            let arity = module
                .functions
                .get(f)
                .map(|d| d.params.len())
                .or_else(|| module.decls.get(f).map(|d| d.params.len()));
            arity.map(|n| n <= nargs).unwrap_or(false)
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct CallGraph {
    pub calls: BTreeMap<FunctionName, BTreeSet<FunctionName>>,
    /// Functions reachable from the roots, roots included
    pub reachable: BTreeSet<FunctionName>,
    /// Functions that may (transitively) call themselves
    pub recursive: BTreeSet<FunctionName>,
    /// Reachable external functions without a signature
    pub needs_signature: BTreeSet<FunctionName>,
}

/// Over-approximate callgraph of everything reachable from `roots`
#[allow(clippy::clone_on_copy)]
#[allow(clippy::collapsible_if)]
#[allow(clippy::just_underscores_and_digits)]
#[allow(clippy::let_unit_value)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unused_unit)]
pub fn analysis(module: &Module, roots: &[FunctionName], signatures: &Signatures) -> CallGraph {
    let span = trace_span!("callgraph");
    let _span = span.enter();

    let taken = address_taken(module);

    let outs = ascent_run! {
        relation arity(FunctionName, usize);
        arity(f.clone(), def.params.len()) <-- for (f, def) in &module.functions;
        arity(f.clone(), decl.params.len()) <-- for (f, decl) in &module.decls;

        relation declared(FunctionName);
        declared(f.clone()) <-- for (f, _) in &module.decls;

        relation escapes(FunctionName);
        escapes(f.clone()) <-- for f in &taken;

        relation call(FunctionName, Operand, usize);
        call(f.clone(), c.callee.clone(), c.args.len()) <--
          for (f, def) in &module.functions,
          for b in &def.blocks,
          for i in &b.instrs,
          if let Opcode::Call(c) = &i.opcode;

        relation calls(FunctionName, FunctionName);
        calls(caller, callee.clone()) <--
          call(caller, callee_op, _),
          if let Operand::Function(callee) = callee_op;

        calls(caller, callee) <--
          call(caller, callee_op, nargs),
          if let Operand::Local(_) = callee_op,
          escapes(callee),
          arity(callee, n),
          if n <= nargs;

        relation reachable(FunctionName);
        reachable(f.clone()) <-- for f in roots;
        reachable(callee) <-- reachable(caller), calls(caller, callee);

        relation calls_trans(FunctionName, FunctionName);
        calls_trans(f, g) <-- calls(f, g);
        calls_trans(f, h) <-- calls(f, g), calls_trans(g, h);

        relation recursive(FunctionName);
        recursive(f) <-- calls_trans(f, g), if f == g;

        relation needs_signature(FunctionName);
        needs_signature(f) <--
          reachable(f),
          declared(f),
          if !signatures.has_signatures_for(f.get());
    };

    let mut calls: BTreeMap<FunctionName, BTreeSet<FunctionName>> = BTreeMap::new();
    for (caller, callee) in outs.calls.into_iter() {
        calls.entry(caller).or_default().insert(callee);
    }
    CallGraph {
        calls,
        reachable: outs.reachable.into_iter().map(|tup| tup.0).collect(),
        recursive: outs.recursive.into_iter().map(|tup| tup.0).collect(),
        needs_signature: outs.needs_signature.into_iter().map(|tup| tup.0).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = r#"{
      "declarations": [{"name": "memset", "params": ["i8*", "i32"]}, {"name": "hash", "params": ["i8*"]}],
      "functions": [
        {"name": "main", "params": [{"name": "p", "ty": "i8*"}],
         "blocks": [{"name": "entry", "instrs": [
           {"inst": "call", "callee": "@helper", "args": ["%p"]},
           {"result": "fp", "inst": "select", "cond": "i1 1", "true_value": "@leaf", "false_value": "@hash"},
           {"inst": "call", "callee": "%fp", "args": ["%p"]}
         ], "terminator": {"term": "ret"}}]},
        {"name": "helper", "params": [{"name": "q", "ty": "i8*"}],
         "blocks": [{"name": "entry", "instrs": [
           {"inst": "call", "callee": "@memset", "args": ["%q", "i32 0"]},
           {"inst": "call", "callee": "@helper", "args": ["%q"]}
         ], "terminator": {"term": "ret"}}]},
        {"name": "leaf", "params": [{"name": "r", "ty": "i8*"}],
         "blocks": [{"name": "entry", "terminator": {"term": "ret"}}]},
        {"name": "unused",
         "blocks": [{"name": "entry", "terminator": {"term": "ret"}}]}
      ]
    }"#;

    #[test]
    fn callgraph() {
        let m = Module::from_json(MODULE).unwrap();
        let sigs = Signatures::from_json(r#"{"^hash$": ["propagate-taint"]}"#).unwrap();
        let main = FunctionName::from("main");
        let cg = analysis(&m, &[main.clone()], &sigs);
        assert_eq!(
            BTreeSet::from([
                FunctionName::from("hash"),
                FunctionName::from("helper"),
                FunctionName::from("leaf"),
            ]),
            cg.calls[&main]
        );
        assert!(cg.reachable.contains(&FunctionName::from("memset")));
        assert!(!cg.reachable.contains(&FunctionName::from("unused")));
        assert_eq!(
            BTreeSet::from([FunctionName::from("helper")]),
            cg.recursive
        );
        assert_eq!(
            BTreeSet::from([FunctionName::from("memset")]),
            cg.needs_signature
        );
        assert_eq!(
            vec![FunctionName::from("hash"), FunctionName::from("leaf")],
            indirect_call_targets(&m, 1)
        );
        assert!(indirect_call_targets(&m, 0).is_empty());
    }
}
