// SPDX-License-Identifier: BSD-3-Clause
//! Control-flow facts about a single function

#[cfg(not(feature = "par"))]
use ascent::ascent_run;
#[cfg(feature = "par")]
use ascent::ascent_run_par as ascent_run;

use rustc_hash::FxHashSet;
use tracing::trace_span;

use crate::ir::Function;

/// Block-to-block reachability, by block position.
#[derive(Debug, Default)]
pub struct Cfg {
    reaches: FxHashSet<(usize, usize)>,
}

impl Cfg {
    #[allow(clippy::clone_on_copy)]
    pub fn new(function: &Function) -> Self {
        let span = trace_span!("cfg", function = %function.name);
        let _span = span.enter();

        let edges: Vec<(usize, usize)> = function
            .blocks
            .iter()
            .enumerate()
            .flat_map(|(from, b)| {
                b.terminator
                    .successors()
                    .into_iter()
                    .filter_map(move |s| function.block_position(s).map(|to| (from, to)))
            })
            .collect();

        let outs = ascent_run! {
            relation edge(usize, usize);
            edge(*from, *to) <-- for (from, to) in &edges;

            relation reaches(usize, usize);
            reaches(from, to) <-- edge(from, to);
            reaches(from, to) <-- edge(from, mid), reaches(mid, to);
        };

        Cfg {
            reaches: outs.reaches.into_iter().collect(),
        }
    }

    /// Whether some non-empty path leads from `from` to `to`.
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        self.reaches.contains(&(from, to))
    }

    pub fn in_loop(&self, block: usize) -> bool {
        self.reaches(block, block)
    }

    /// For a two-way branch at the end of `block`, the successor that leaves
    /// the loop around `block` while the other one stays inside it.
    pub fn loop_exit(&self, block: usize, then: usize, otherwise: usize) -> Option<usize> {
        if !self.in_loop(block) {
            return None;
        }
        let stays = |s: usize| s == block || self.reaches(s, block);
        match (stays(then), stays(otherwise)) {
            (true, false) => Some(otherwise),
            (false, true) => Some(then),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionName, Module};

    const LOOP: &str = r#"{
      "functions": [{
        "name": "count",
        "params": [{"name": "n", "ty": "i32"}],
        "blocks": [
          {"name": "entry", "terminator": {"term": "br", "target": "head"}},
          {"name": "head",
           "instrs": [
             {"result": "i", "inst": "phi", "ty": "i32",
              "incoming": [["i32 0", "entry"], ["%next", "body"]]},
             {"result": "c", "inst": "icmp", "pred": "slt", "lhs": "%i", "rhs": "%n"}
           ],
           "terminator": {"term": "cond-br", "cond": "%c", "then": "body", "else": "exit"}},
          {"name": "body",
           "instrs": [{"result": "next", "inst": "binary", "op": "add", "lhs": "%i", "rhs": "i32 1"}],
           "terminator": {"term": "br", "target": "head"}},
          {"name": "exit", "terminator": {"term": "ret"}}
        ]
      }]
    }"#;

    #[test]
    fn finds_loop_exit() {
        let m = Module::from_json(LOOP).unwrap();
        let f = m.function(&FunctionName::from("count")).unwrap();
        let cfg = Cfg::new(f);
        assert!(cfg.in_loop(1));
        assert!(cfg.in_loop(2));
        assert!(!cfg.in_loop(0));
        assert!(!cfg.in_loop(3));
        assert!(cfg.reaches(0, 3));
        assert!(!cfg.reaches(3, 0));
        assert_eq!(Some(3), cfg.loop_exit(1, 2, 3));
        assert_eq!(None, cfg.loop_exit(0, 1, 1));
    }
}
