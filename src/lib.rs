// SPDX-License-Identifier: BSD-3-Clause
//! Constant-time checking by secrecy taint tracking and path exploration.

pub mod abstractdata;
pub mod analysis;
pub mod ir;
pub mod lattice;
pub mod memory;
pub mod report;
pub mod signatures;

pub use abstractdata::{Abstract, AbstractValue, FunctionSpec, SecrecySpec};
pub use analysis::{check_function, check_function_in_inputs, check_module, KeepGoing, Options};
pub use ir::Module;
pub use report::{Report, Status, ViolationKind};
pub use signatures::Signatures;
