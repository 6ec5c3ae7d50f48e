// SPDX-License-Identifier: BSD-3-Clause
//! Constant-time checking of a function.
//!
//! Inputs are materialized from the secrecy specification, then every path
//! through the function is explored with taint propagation. A branch, an
//! address or a call target that depends on secret data is a violation.

#[cfg(feature = "par")]
use rayon::prelude::*;
use tracing::{info, trace_span, warn};

use crate::{
    abstractdata::{SecrecySpec, SpecError},
    ir::{FunctionName, Module},
    report::Report,
    signatures::Signatures,
};

pub mod callgraph;
pub mod cfg;
mod entry;
mod eval;
mod explore;

/// What to do after finding a violation.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum KeepGoing {
    /// End the whole analysis at the first violation
    Stop,
    /// End each path at its first violation
    StopPerPath,
    /// Explore every path to its end
    #[default]
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub keep_going: KeepGoing,
    /// Times a path may enter the same block of one frame
    pub loop_bound: usize,
    /// Paths to explore per function, `None` for no limit
    pub max_paths: Option<usize>,
    /// Instructions per path
    pub max_steps: usize,
    pub max_call_depth: usize,
    /// Merge violations at the same instruction with the same causes
    pub dedup: bool,
    /// Pointer levels materialized below a parameter described as `default`
    pub pointee_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            keep_going: KeepGoing::Full,
            loop_bound: 100,
            max_paths: Some(10_000),
            max_steps: 100_000,
            max_call_depth: 32,
            dedup: false,
            pointee_depth: 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no function named {0}")]
    UnknownFunction(FunctionName),
    #[error("bad secrecy specification for {function}")]
    Spec {
        function: FunctionName,
        #[source]
        source: SpecError,
    },
}

/// Check one function, with inputs described by `spec`.
pub fn check_function(
    module: &Module,
    name: &FunctionName,
    spec: &SecrecySpec,
    signatures: &Signatures,
    opts: &Options,
) -> Result<Report, Error> {
    let span = trace_span!("check", function = %name);
    let _span = span.enter();

    let function = module
        .function(name)
        .ok_or_else(|| Error::UnknownFunction(name.clone()))?;

    let cg = callgraph::analysis(module, std::slice::from_ref(name), signatures);
    for f in &cg.needs_signature {
        warn!(callee = %f, "external function without a signature");
    }
    for f in &cg.recursive {
        warn!(callee = %f, "recursion is only explored up to the call depth bound");
    }

    let entry = entry::materialize(module, function, spec, opts).map_err(|source| {
        Error::Spec {
            function: name.clone(),
            source,
        }
    })?;
    let initial = explore::PathState::new(function, entry);
    let report = explore::Explorer::new(module, signatures, opts, name).explore(initial);
    info!(
        function = %name,
        status = %report.status,
        violations = report.violations.len(),
        completed = report.statistics.completed,
        "checked"
    );
    Ok(report)
}

/// Check one function with every input secret.
pub fn check_function_in_inputs(
    module: &Module,
    name: &FunctionName,
    signatures: &Signatures,
    opts: &Options,
) -> Result<Report, Error> {
    check_function(module, name, &SecrecySpec::all_secret(), signatures, opts)
}

/// Check the functions the specification describes, or every function
/// defined in the module if it describes none. Results are in name order.
pub fn check_module(
    module: &Module,
    spec: &SecrecySpec,
    signatures: &Signatures,
    opts: &Options,
) -> Vec<(FunctionName, Result<Report, Error>)> {
    let names: Vec<FunctionName> = if spec.functions.is_empty() {
        module.functions.keys().cloned().collect()
    } else {
        spec.functions
            .keys()
            .map(|f| FunctionName::from(f.as_str()))
            .collect()
    };
    #[cfg(not(feature = "par"))]
    let names = names.into_iter();
    #[cfg(feature = "par")]
    let names = names.into_par_iter();
    names
        .map(|f| {
            let r = check_function(module, &f, spec, signatures, opts);
            (f, r)
        })
        .collect()
}
