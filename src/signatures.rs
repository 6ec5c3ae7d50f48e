// SPDX-License-Identifier: BSD-3-Clause
//! Summaries of external functions, keyed by regular expressions over their
//! names, e.g.
//!
//! ```json
//! {
//!   "^memset$": [{"arg-pointee-public": {"arg": 0}}],
//!   "^(hash|mac)_.*": ["propagate-taint"],
//!   "^getrandom$": [{"arg-pointee-secret": {"arg": 0}}, "return-public"]
//! }
//! ```

use std::collections::BTreeMap;

use regex::RegexSet;

#[allow(clippy::enum_variant_names)]
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signature {
    /// Return an unconstrained public value, ignoring the arguments
    ReturnPublic,
    /// Return an unconstrained secret value
    ReturnSecret,
    /// Return a secret value if any argument is or points to secret data,
    /// otherwise a public one
    PropagateTaint,
    /// Return the pointer passed as the given argument
    ReturnAliasesArg { arg: usize },
    /// Everything the given argument points to may now be secret
    ArgPointeeSecret { arg: usize },
    /// Everything the given argument points to may now hold any public value
    ArgPointeePublic { arg: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("Couldn't deserialize signatures: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bad signature pattern: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug)]
pub struct Signatures {
    sigs: BTreeMap<String, Vec<Signature>>,
    regexes: Vec<String>,
    set: RegexSet,
}

impl Default for Signatures {
    fn default() -> Self {
        Signatures {
            sigs: BTreeMap::new(),
            regexes: Vec::new(),
            set: RegexSet::empty(),
        }
    }
}

impl Signatures {
    pub fn new(sigs: BTreeMap<String, Vec<Signature>>) -> Result<Self, regex::Error> {
        let regexes: Vec<String> = sigs.keys().cloned().collect();
        let set = RegexSet::new(&regexes)?;
        Ok(Signatures { sigs, regexes, set })
    }

    pub fn from_json(s: &str) -> Result<Self, SignatureError> {
        let sigs: BTreeMap<String, Vec<Signature>> = serde_json::from_str(s)?;
        Ok(Self::new(sigs)?)
    }

    pub fn has_signatures_for(&self, func: &str) -> bool {
        self.set.is_match(func)
    }

    /// All summaries whose pattern matches, in pattern order.
    pub fn signatures_for(&self, func: &str) -> Option<Vec<Signature>> {
        let mut matched = false;
        let mut sigs = Vec::new();
        for m in self.set.matches(func) {
            matched = true;
            if let Some(s) = self.sigs.get(&self.regexes[m]) {
                sigs.extend(s.iter().cloned());
            }
        }
        if matched {
            Some(sigs)
        } else {
            None
        }
    }
}
