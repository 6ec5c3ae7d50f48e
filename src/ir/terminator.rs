// SPDX-License-Identifier: BSD-3-Clause
use serde::{Deserialize, Serialize};

use super::name::BlockName;
use super::operand::Operand;

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "term", rename_all = "kebab-case")]
pub enum Terminator {
    Br {
        target: BlockName,
    },
    CondBr {
        cond: Operand,
        then: BlockName,
        #[serde(rename = "else")]
        otherwise: BlockName,
    },
    Switch {
        value: Operand,
        default: BlockName,
        #[serde(default)]
        cases: Vec<(i64, BlockName)>,
    },
    Ret {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Operand>,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<&BlockName> {
        match self {
            Terminator::Br { target } => vec![target],
            Terminator::CondBr {
                then, otherwise, ..
            } => vec![then, otherwise],
            Terminator::Switch { default, cases, .. } => {
                let mut succs = vec![default];
                succs.extend(cases.iter().map(|(_, b)| b));
                succs
            }
            Terminator::Ret { .. } => Vec::new(),
            Terminator::Unreachable => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Terminator::Br { .. } => Vec::new(),
            Terminator::CondBr { cond, .. } => vec![cond],
            Terminator::Switch { value, .. } => vec![value],
            Terminator::Ret { value } => value.iter().collect(),
            Terminator::Unreachable => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_cond_br() {
        let t: Terminator = serde_json::from_str(
            r#"{"term": "cond-br", "cond": "%c", "then": "a", "else": "b"}"#,
        )
        .unwrap();
        assert_eq!(
            vec![&BlockName::from("a"), &BlockName::from("b")],
            t.successors()
        );
        let t: Terminator = serde_json::from_str(r#"{"term": "ret"}"#).unwrap();
        assert_eq!(Terminator::Ret { value: None }, t);
    }
}
