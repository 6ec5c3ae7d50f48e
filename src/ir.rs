// SPDX-License-Identifier: BSD-3-Clause
//! Representation of a module that is amenable to analysis.
//!
//! Modules are produced by an external front end and read from JSON. The
//! serialized form ([`ModuleSource`]) is checked and indexed by
//! [`Module::new`], so the analyses can assume that every referenced local,
//! block, struct and function exists.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

mod error;
pub use error::*;
mod name;
pub use name::*;
mod operand;
pub use operand::*;
mod ty;
pub use ty::*;
pub mod instruction;
pub use instruction::{Instruction, Opcode};
mod terminator;
pub use terminator::*;

fn void() -> Type {
    Type::Void
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Parameter {
    pub name: LocalName,
    pub ty: Type,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Block {
    pub name: BlockName,
    #[serde(default)]
    pub instrs: Vec<Instruction>,
    pub terminator: Terminator,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Function {
    pub name: FunctionName,
    #[serde(default)]
    pub params: Vec<Parameter>,
    #[serde(default = "void")]
    pub ret: Type,
    pub blocks: Vec<Block>,
    #[serde(skip)]
    block_index: BTreeMap<BlockName, usize>,
}

impl Function {
    /// The first block. Validated functions always have one.
    pub fn entry(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn block(&self, name: &BlockName) -> Option<&Block> {
        self.block_index.get(name).map(|i| &self.blocks[*i])
    }

    pub fn block_position(&self, name: &BlockName) -> Option<usize> {
        self.block_index.get(name).copied()
    }

    pub fn instruction_name(&self, block: &BlockName, idx: usize) -> InstructionName {
        InstructionName::new(self.name.clone(), block.clone(), idx)
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name.get() == name)
    }
}

/// An external function: only its type is known.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Declaration {
    pub name: FunctionName,
    #[serde(default)]
    pub params: Vec<Type>,
    #[serde(default = "void")]
    pub ret: Type,
}

/// A module as written by the front end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleSource {
    #[serde(default)]
    pub structs: Structs,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub structs: Structs,
    pub functions: BTreeMap<FunctionName, Function>,
    pub decls: BTreeMap<FunctionName, Declaration>,
}

impl Module {
    pub fn new(src: ModuleSource) -> Result<Self, Error> {
        let ModuleSource {
            structs,
            functions: fs,
            declarations,
        } = src;

        for (name, def) in &structs {
            let mut seen = BTreeSet::new();
            for f in &def.fields {
                if !seen.insert(&f.name) {
                    return Err(Error(format!("Duplicate field {} in %{}", f.name, name)));
                }
                check_type(&structs, &f.ty)?;
            }
            Type::Struct(name.clone()).leaves(&structs)?;
        }

        let mut decls = BTreeMap::new();
        for d in declarations {
            for ty in d.params.iter().chain(std::iter::once(&d.ret)) {
                check_type(&structs, ty)?;
            }
            if decls.insert(d.name.clone(), d).is_some() {
                return Err(Error("Duplicate declaration".to_string()));
            }
        }

        let mut functions = BTreeMap::new();
        for f in fs {
            if decls.contains_key(&f.name) || functions.contains_key(&f.name) {
                return Err(Error(format!("Duplicate function {}", f.name)));
            }
            functions.insert(f.name.clone(), f);
        }

        let names: BTreeSet<FunctionName> =
            functions.keys().chain(decls.keys()).cloned().collect();
        for f in functions.values_mut() {
            validate_function(&structs, &names, f)?;
        }

        Ok(Module {
            structs,
            functions,
            decls,
        })
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        let src: ModuleSource = serde_json::from_str(s).map_err(|e| Error(e.to_string()))?;
        Self::new(src)
    }

    pub fn function(&self, name: &FunctionName) -> Option<&Function> {
        self.functions.get(name)
    }
}

fn check_type(structs: &Structs, ty: &Type) -> Result<(), Error> {
    match ty {
        Type::Void | Type::Int { .. } => Ok(()),
        Type::Pointer(t) => check_type(structs, t),
        Type::Array { element, .. } => check_type(structs, element),
        Type::Struct(name) => {
            if structs.contains_key(name) {
                Ok(())
            } else {
                Err(Error(format!("Unknown struct: %{}", name)))
            }
        }
    }
}

fn validate_function(
    structs: &Structs,
    functions: &BTreeSet<FunctionName>,
    f: &mut Function,
) -> Result<(), Error> {
    let fname = f.name.clone();
    let err = |msg: String| Error(format!("{}: {}", fname, msg));

    if f.blocks.is_empty() {
        return Err(err("no blocks".to_string()));
    }
    check_type(structs, &f.ret)?;

    f.block_index.clear();
    for (i, b) in f.blocks.iter().enumerate() {
        if f.block_index.insert(b.name.clone(), i).is_some() {
            return Err(err(format!("duplicate block {}", b.name)));
        }
    }

    let mut locals = BTreeSet::new();
    for p in &f.params {
        check_type(structs, &p.ty)?;
        if !locals.insert(p.name.clone()) {
            return Err(err(format!("duplicate local {}", p.name)));
        }
    }
    for b in &f.blocks {
        for i in &b.instrs {
            if let Some(r) = &i.result {
                if !i.opcode.has_result() {
                    return Err(err(format!("{} names an instruction without a value", r)));
                }
                if !locals.insert(r.clone()) {
                    return Err(err(format!("duplicate local {}", r)));
                }
            }
        }
    }

    let check_operand = |o: &Operand| -> Result<(), Error> {
        match o {
            Operand::Local(l) if !locals.contains(l) => {
                Err(err(format!("undefined local {}", l)))
            }
            Operand::Function(g) if !functions.contains(g) => {
                Err(err(format!("undefined function {}", g)))
            }
            _ => Ok(()),
        }
    };
    let check_block = |name: &BlockName| -> Result<(), Error> {
        if f.block_index.contains_key(name) {
            Ok(())
        } else {
            Err(err(format!("undefined block {}", name)))
        }
    };

    for b in &f.blocks {
        for i in &b.instrs {
            for o in i.opcode.operands() {
                check_operand(o)?;
            }
            match &i.opcode {
                Opcode::Alloca(a) => check_type(structs, &a.ty)?,
                Opcode::Load(l) => check_type(structs, &l.ty)?,
                Opcode::Cast(c) => check_type(structs, &c.ty)?,
                Opcode::Index(x) => check_type(structs, &x.element)?,
                Opcode::Phi(p) => {
                    check_type(structs, &p.ty)?;
                    for (_, pred) in &p.incoming {
                        check_block(pred)?;
                    }
                }
                Opcode::Call(c) => check_type(structs, &c.ty)?,
                Opcode::Field(fa) => {
                    let def = structs
                        .get(&fa.struct_name)
                        .ok_or_else(|| err(format!("unknown struct %{}", fa.struct_name)))?;
                    let idx = match &fa.field {
                        instruction::FieldRef::Index(idx) => *idx,
                        instruction::FieldRef::Name(n) => def.field_index(n).ok_or_else(|| {
                            err(format!("no field {} in %{}", n, fa.struct_name))
                        })?,
                    };
                    if idx >= def.fields.len() {
                        return Err(err(format!(
                            "field {} out of range for %{}",
                            idx, fa.struct_name
                        )));
                    }
                }
                Opcode::Store(_) | Opcode::Binary(_) | Opcode::Icmp(_) => (),
                Opcode::Select(_) | Opcode::Other(_) => (),
            }
        }
        for o in b.terminator.operands() {
            check_operand(o)?;
        }
        for s in b.terminator.successors() {
            check_block(s)?;
        }
    }

    // Resolve field names to positions
    for b in &mut f.blocks {
        for i in &mut b.instrs {
            if let Opcode::Field(fa) = &mut i.opcode {
                if let instruction::FieldRef::Name(n) = &fa.field {
                    if let Some(idx) = structs.get(&fa.struct_name).and_then(|d| d.field_index(n))
                    {
                        fa.field = instruction::FieldRef::Index(idx);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"{
      "structs": {"S": [{"name": "a", "ty": "i32"}, {"name": "b", "ty": "i32"}]},
      "functions": [{
        "name": "f",
        "params": [{"name": "p", "ty": "%S*"}],
        "ret": "i32",
        "blocks": [{
          "name": "entry",
          "instrs": [
            {"result": "q", "inst": "field", "pointer": "%p", "struct": "S", "field": "b"},
            {"result": "v", "inst": "load", "ty": "i32", "pointer": "%q"}
          ],
          "terminator": {"term": "ret", "value": "%v"}
        }]
      }]
    }"#;

    #[test]
    fn resolves_field_names() {
        let m = Module::from_json(SMALL).unwrap();
        let f = m.function(&FunctionName::from("f")).unwrap();
        match &f.entry().instrs[0].opcode {
            Opcode::Field(fa) => assert_eq!(1, fa.field_index()),
            o => panic!("unexpected opcode {:?}", o),
        }
        assert!(f.block(&BlockName::from("entry")).is_some());
        assert_eq!(Some(0), f.param_index("p"));
    }

    #[test]
    fn rejects_undefined_local() {
        let bad = SMALL.replace("\"%q\"", "\"%nope\"");
        let e = Module::from_json(&bad).unwrap_err();
        assert!(e.to_string().contains("undefined local %nope"), "{}", e);
    }

    #[test]
    fn rejects_undefined_block() {
        let bad = SMALL.replace(
            r#"{"term": "ret", "value": "%v"}"#,
            r#"{"term": "br", "target": "nowhere"}"#,
        );
        assert!(Module::from_json(&bad).is_err());
    }

    #[test]
    fn rejects_unknown_field() {
        let bad = SMALL.replace("\"field\": \"b\"", "\"field\": \"c\"");
        assert!(Module::from_json(&bad).is_err());
    }
}
