// SPDX-License-Identifier: BSD-3-Clause
use std::fmt;
use std::path::PathBuf;

use ctcheck::KeepGoing as Policy;

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum KeepGoing {
    Stop,
    StopPerPath,
    Full,
}

impl fmt::Display for KeepGoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepGoing::Stop => write!(f, "stop"),
            KeepGoing::StopPerPath => write!(f, "stop-per-path"),
            KeepGoing::Full => write!(f, "full"),
        }
    }
}

impl From<KeepGoing> for Policy {
    fn from(k: KeepGoing) -> Self {
        match k {
            KeepGoing::Stop => Policy::Stop,
            KeepGoing::StopPerPath => Policy::StopPerPath,
            KeepGoing::Full => Policy::Full,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Check functions for secret-dependent branches and memory accesses
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Module, as JSON
    #[arg()]
    pub module: PathBuf,

    /// Secrecy specification of function inputs, as JSON
    #[arg(long)]
    pub spec: Option<PathBuf>,

    /// Signatures of external functions
    #[arg(short, long)]
    pub signatures: Option<PathBuf>,

    /// Function to check (repeatable; default: every function)
    #[arg(short, long)]
    pub function: Vec<String>,

    /// Treat every input as secret
    #[arg(long)]
    pub all_secret: bool,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,

    /// Times a path may enter the same block
    #[arg(long, default_value_t = 100)]
    pub loop_bound: usize,

    /// Paths to explore per function (0 for no limit)
    #[arg(long, default_value_t = 10_000)]
    pub max_paths: usize,

    /// Instructions per path
    #[arg(long, default_value_t = 100_000)]
    pub max_steps: usize,

    /// Nested call depth
    #[arg(long, default_value_t = 32)]
    pub max_call_depth: usize,

    /// What to do after a violation
    #[arg(long, default_value_t = KeepGoing::Full)]
    pub keep_going: KeepGoing,

    /// Merge identical violations found on different paths
    #[arg(long)]
    pub dedup: bool,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Tracing
    #[arg(long)]
    pub tracing: bool,

    /// Fail if a reachable external function has no signature
    #[arg(long)]
    pub strict: bool,

    /// Quiet
    #[arg(long)]
    pub quiet: bool,
}
