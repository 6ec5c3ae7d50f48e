// SPDX-License-Identifier: BSD-3-Clause
use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use tracing::error;
use tracing_flame::{FlameLayer, FlushGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ctcheck::{
    abstractdata::SecrecySpec,
    analysis::{self, callgraph},
    ir::{FunctionName, Module},
    report::{Report, Status},
    signatures::Signatures,
};

mod cli;
mod layers;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn setup_global_subscriber(
    level: cli::LogLevel,
    tracing: bool,
) -> Result<Option<FlushGuard<BufWriter<File>>>> {
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let fmt_layer = fmt::Layer::default().with_writer(io::stderr);
    let (flame_layer, guard) = if tracing {
        let (layer, guard) = FlameLayer::with_file("./tracing.folded")
            .context("Couldn't create ./tracing.folded")?;
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(flame_layer)
        .with(tracing.then(layers::BusyTimeLayer::default))
        .init();
    Ok(guard)
}

fn read_json(path: &std::path::Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Couldn't read {} at {}", what, path.display()))
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = cli::Args::parse();

    let _guard = setup_global_subscriber(args.log_level, args.tracing)?;

    let signatures = if let Some(signatures_path) = &args.signatures {
        Signatures::from_json(&read_json(signatures_path, "signatures")?)
            .context("Couldn't construct signatures")?
    } else {
        Signatures::default()
    };

    let mut spec = if let Some(spec_path) = &args.spec {
        SecrecySpec::from_json(&read_json(spec_path, "secrecy specification")?)
            .context("Couldn't deserialize secrecy specification")?
    } else {
        SecrecySpec::new()
    };
    spec.all_secret |= args.all_secret;

    let module = Module::from_json(&read_json(&args.module, "module")?)
        .with_context(|| format!("Couldn't load module at {}", args.module.display()))?;

    let opts = analysis::Options {
        keep_going: args.keep_going.into(),
        loop_bound: args.loop_bound,
        max_paths: if args.max_paths == 0 {
            None
        } else {
            Some(args.max_paths)
        },
        max_steps: args.max_steps,
        max_call_depth: args.max_call_depth,
        dedup: args.dedup,
        ..analysis::Options::default()
    };

    let results = if args.function.is_empty() {
        analysis::check_module(&module, &spec, &signatures, &opts)
    } else {
        args.function
            .iter()
            .map(|f| {
                let f = FunctionName::from(f.as_str());
                let r = analysis::check_function(&module, &f, &spec, &signatures, &opts);
                (f, r)
            })
            .collect()
    };

    let mut reports: Vec<Report> = Vec::with_capacity(results.len());
    let mut failed = 0;
    for (f, r) in results {
        match r {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(function = %f, "{:#}", anyhow::Error::from(e));
                failed += 1;
            }
        }
    }

    if !args.quiet {
        let mut stdout = io::stdout().lock();
        if args.json {
            serde_json::to_writer_pretty(&mut stdout, &reports)?;
            writeln!(stdout)?;
        } else {
            for report in &reports {
                writeln!(stdout, "{}", report)?;
            }
        }
    }

    if args.strict {
        let roots: Vec<FunctionName> = reports.iter().map(|r| r.function.clone()).collect();
        let cg = callgraph::analysis(&module, &roots, &signatures);
        if !cg.needs_signature.is_empty() {
            return Err(anyhow!("Found functions that need signatures!"));
        }
    }
    if failed != 0 {
        return Err(anyhow!("Couldn't check {} function(s)", failed));
    }
    if reports.iter().any(|r| r.status == Status::Violating) {
        return Err(anyhow!("Found constant-time violations!"));
    }
    Ok(())
}
