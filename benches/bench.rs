// SPDX-License-Identifier: BSD-3-Clause
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ctcheck::{
    check_function, check_module, ir::FunctionName, Abstract, AbstractValue, FunctionSpec,
    KeepGoing, Module, Options, SecrecySpec, Signatures,
};

fn module() -> Module {
    Module::from_json(include_str!("../tests/fixtures/ct.json")).unwrap()
}

fn bench_function(c: &mut Criterion, module: &Module, name: &str, args: Vec<Abstract>) {
    let f = FunctionName::from(name);
    let spec = SecrecySpec::new().with_function(name, FunctionSpec::positional(args));
    let sigs = Signatures::default();
    let opts = Options::default();
    c.bench_function(name, |b| {
        b.iter(|| check_function(module, &f, black_box(&spec), &sigs, &opts).unwrap())
    });
}

fn bench(c: &mut Criterion) {
    let module = module();
    bench_function(c, &module, "notct_branch", vec![Abstract::Secret]);
    bench_function(
        c,
        &module,
        "related_args",
        vec![
            Abstract::public(AbstractValue::Range(0, 20)),
            Abstract::Default,
            Abstract::Secret,
        ],
    );
    bench_function(
        c,
        &module,
        "indirectly_recursive_struct",
        vec![
            Abstract::Default,
            Abstract::pointer_to(Abstract::Struct(vec![
                Abstract::Secret,
                Abstract::Default,
                Abstract::Default,
            ])),
        ],
    );

    let all = SecrecySpec::all_secret();
    let sigs = Signatures::default();
    let opts = Options {
        keep_going: KeepGoing::StopPerPath,
        ..Options::default()
    };
    c.bench_function("module", |b| {
        b.iter(|| check_module(&module, black_box(&all), &sigs, &opts))
    });
}

criterion_group!(benches, bench);
criterion_main!(benches);
