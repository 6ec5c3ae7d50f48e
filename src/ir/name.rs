// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct FunctionName(String);

impl From<&str> for FunctionName {
    fn from(s: &str) -> Self {
        FunctionName(s.to_string())
    }
}

impl From<String> for FunctionName {
    fn from(s: String) -> Self {
        FunctionName(s)
    }
}

impl<T> PartialEq<T> for FunctionName
where
    T: AsRef<str>,
{
    fn eq(&self, other: &T) -> bool {
        self.0.as_str().eq(other.as_ref())
    }
}

impl FunctionName {
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BlockName(String);

impl From<&str> for BlockName {
    fn from(s: &str) -> Self {
        BlockName(s.to_string())
    }
}

impl BlockName {
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for BlockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an SSA value: a parameter or an instruction result.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LocalName(String);

impl From<&str> for LocalName {
    fn from(s: &str) -> Self {
        LocalName(s.to_string())
    }
}

impl From<String> for LocalName {
    fn from(s: String) -> Self {
        LocalName(s)
    }
}

impl LocalName {
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for LocalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Position of an instruction (or terminator) within a module. Terminators
/// take the index one past the last instruction of their block.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstructionName {
    function: FunctionName,
    block: BlockName,
    idx: usize,
}

impl InstructionName {
    pub(crate) fn new(function: FunctionName, block: BlockName, idx: usize) -> Self {
        Self {
            function,
            block,
            idx,
        }
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    pub fn block(&self) -> &BlockName {
        &self.block
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    // reduce heap allocations by precomputing string size
    fn name(&self) -> String {
        let iname = self.idx.to_string();
        let mut s = String::with_capacity(
            self.function.0.len()
            + 1 // :
            + self.block.0.len()
            + 1 // :
            + iname.len(),
        );
        s += &self.function.0;
        s += ":";
        s += &self.block.0;
        s += ":";
        s += &iname;
        s
    }
}

impl Display for InstructionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for InstructionName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_name_display() {
        let i = InstructionName::new("f".into(), "entry".into(), 3);
        assert_eq!("f:entry:3", i.to_string());
        assert_eq!("@f", i.function().to_string());
    }
}
