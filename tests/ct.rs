// SPDX-License-Identifier: BSD-3-Clause
// The functions in fixtures/ct.json are small C programs written out in the
// module format. To debug a test, try `eprintln!("{}", report)`.

use ctcheck::{
    abstractdata::{Abstract, AbstractValue, FunctionSpec, SecrecySpec},
    analysis::{self, KeepGoing, Options},
    ir::{FunctionName, Module},
    report::{Choice, Report, Status, ViolationKind},
    signatures::Signatures,
};

// ------------------------------------------------------------------
// Helpers

fn module() -> Module {
    match Module::from_json(include_str!("fixtures/ct.json")) {
        Ok(m) => m,
        Err(e) => panic!("{}", e),
    }
}

fn options() -> Options {
    Options::default()
}

fn check_in_inputs(function: &str) -> Report {
    let m = module();
    analysis::check_function_in_inputs(
        &m,
        &FunctionName::from(function),
        &Signatures::default(),
        &options(),
    )
    .unwrap()
}

fn check_with(function: &str, spec: &SecrecySpec, opts: &Options) -> Report {
    let m = module();
    analysis::check_function(
        &m,
        &FunctionName::from(function),
        spec,
        &Signatures::default(),
        opts,
    )
    .unwrap()
}

fn check(function: &str, params: Vec<Abstract>) -> Report {
    let spec = SecrecySpec::new().with_function(function, FunctionSpec::positional(params));
    check_with(function, &spec, &options())
}

fn assert_no_ct_violation(report: &Report) {
    assert!(report.errors.is_empty(), "unexpected errors:\n{}", report);
    assert!(
        report.violations.is_empty(),
        "expected no violation:\n{}",
        report
    );
    assert_eq!(Status::Clean, report.status);
}

fn assert_is_ct_violation(report: &Report) {
    assert!(report.errors.is_empty(), "unexpected errors:\n{}", report);
    assert!(!report.violations.is_empty(), "expected a violation:\n{}", report);
    assert_eq!(Status::Violating, report.status);
}

fn secret() -> Abstract {
    Abstract::Secret
}

fn public() -> Abstract {
    Abstract::public(AbstractValue::Unconstrained)
}

fn public_array(len: usize) -> Abstract {
    Abstract::pointer_to(Abstract::array_of(public(), len))
}

fn partially_secret() -> Abstract {
    Abstract::Struct(vec![
        Abstract::public(AbstractValue::Range(0, 4096)),
        secret(),
    ])
}

fn ptr_to_ptr_to_secrets() -> Abstract {
    Abstract::pointer_to(Abstract::array_of(
        Abstract::pointer_to(Abstract::array_of(secret(), 30)),
        5,
    ))
}

fn secret_secret_public() -> Vec<Abstract> {
    vec![secret(), secret(), public()]
}

// ------------------------------------------------------------------
// Tests

#[test]
fn ct_simple() {
    assert_no_ct_violation(&check_in_inputs("ct_simple"));
}

#[test]
fn ct_simple2() {
    let report = check_in_inputs("ct_simple2");
    assert_no_ct_violation(&report);
    assert_eq!(2, report.statistics.completed);
}

#[test]
fn notct_branch() {
    let report = check_in_inputs("notct_branch");
    assert_is_ct_violation(&report);
    assert_eq!(1, report.violations.len());
    let v = &report.violations[0];
    assert_eq!(ViolationKind::SecretBranch, v.kind);
    assert_eq!("entry", v.instruction.block().get());
    assert!(v.path.is_empty());
    assert_eq!(
        vec!["x"],
        v.causes.iter().map(|s| s.get()).collect::<Vec<_>>()
    );
    // Both sides are still explored
    assert_eq!(2, report.statistics.completed);
    assert_eq!(2, report.statistics.violating);
}

#[test]
fn notct_mem() {
    let report = check_in_inputs("notct_mem");
    assert_is_ct_violation(&report);
    assert!(matches!(
        report.violations[0].kind,
        ViolationKind::SecretAddress { .. }
    ));
}

#[test]
fn notct_onepath() {
    assert_is_ct_violation(&check_in_inputs("notct_onepath"));
}

#[test]
fn notct_truepath() {
    let report = check("notct_truepath", secret_secret_public());
    assert_is_ct_violation(&report);
    assert_eq!(1, report.violations.len());
    let v = &report.violations[0];
    assert_eq!("if.then", v.instruction.block().get());
    assert_eq!(Choice::Block("if.then".into()), v.path[0].taken);
    assert_eq!(2, report.statistics.completed);
    assert_eq!(1, report.statistics.violating);
}

#[test]
fn notct_falsepath() {
    let report = check("notct_falsepath", secret_secret_public());
    assert_is_ct_violation(&report);
    assert_eq!(1, report.violations.len());
    let v = &report.violations[0];
    assert_eq!("if.else", v.instruction.block().get());
    assert_eq!(Choice::Block("if.else".into()), v.path[0].taken);
}

#[test]
fn two_ct_violations() {
    // Two violations on three paths
    let report = check("two_ct_violations", secret_secret_public());
    assert_is_ct_violation(&report);
    assert_eq!(3, report.statistics.completed);
    assert_eq!(2, report.statistics.violating);
    assert_eq!(2, report.violations.len());
    assert_ne!(report.violations[0].instruction, report.violations[1].instruction);

    // Only one with Stop
    let spec = SecrecySpec::new().with_function(
        "two_ct_violations",
        FunctionSpec::positional(secret_secret_public()),
    );
    let opts = Options {
        keep_going: KeepGoing::Stop,
        ..options()
    };
    let report = check_with("two_ct_violations", &spec, &opts);
    assert!(report.errors.is_empty(), "{}", report);
    assert_eq!(1, report.violations.len());
    assert_eq!(Status::Violating, report.status);

    // Each path ends at its own first violation
    let opts = Options {
        keep_going: KeepGoing::StopPerPath,
        ..options()
    };
    let report = check_with("two_ct_violations", &spec, &opts);
    assert!(report.errors.is_empty(), "{}", report);
    assert_eq!(2, report.violations.len());
    assert_eq!(1, report.statistics.completed);
    assert_eq!(2, report.statistics.violating);
}

#[test]
fn ct_onearg() {
    let report = check("ct_onearg", vec![public(), secret()]);
    assert_no_ct_violation(&report);
    let report = check("ct_onearg", vec![secret(), public()]);
    assert_is_ct_violation(&report);
}

#[test]
fn ct_secrets() {
    let arg = vec![Abstract::pointer_to(Abstract::array_of(secret(), 100))];
    assert_no_ct_violation(&check("ct_secrets", arg));
}

#[test]
fn notct_secrets() {
    let arg = vec![Abstract::pointer_to(Abstract::array_of(secret(), 100))];
    assert_is_ct_violation(&check("notct_secrets", arg));
}

#[test]
fn ct_struct() {
    let args = vec![public_array(100), Abstract::pointer_to(partially_secret())];
    assert_no_ct_violation(&check("ct_struct", args));

    // Again, with `default` and a struct description
    let spec = SecrecySpec::new()
        .with_function(
            "ct_struct",
            FunctionSpec::positional(vec![Abstract::Default, Abstract::Default]),
        )
        .with_struct("PartiallySecret", partially_secret());
    assert_no_ct_violation(&check_with("ct_struct", &spec, &options()));

    // Again, with only the struct description
    let spec = SecrecySpec::new().with_struct("PartiallySecret", partially_secret());
    assert_no_ct_violation(&check_with("ct_struct", &spec, &options()));
}

#[test]
fn notct_struct() {
    let args = vec![public_array(100), Abstract::pointer_to(partially_secret())];
    assert_is_ct_violation(&check("notct_struct", args));

    let spec = SecrecySpec::new()
        .with_function(
            "notct_struct",
            FunctionSpec::positional(vec![Abstract::Default, Abstract::Default]),
        )
        .with_struct("PartiallySecret", partially_secret());
    assert_is_ct_violation(&check_with("notct_struct", &spec, &options()));

    let spec = SecrecySpec::new().with_struct("PartiallySecret", partially_secret());
    let report = check_with("notct_struct", &spec, &options());
    assert_is_ct_violation(&report);
    assert_eq!(
        vec!["ps->secret"],
        report.violations[0]
            .causes
            .iter()
            .map(|s| s.get())
            .collect::<Vec<_>>()
    );
}

#[test]
fn notct_maybenull_null() {
    let args = vec![
        public_array(100),
        Abstract::MaybeNullPointerTo(Box::new(Abstract::array_of(public(), 100))),
        Abstract::pointer_to(partially_secret()),
    ];
    let report = check("notct_maybenull_null", args);
    assert_is_ct_violation(&report);
    assert_eq!("isnull", report.violations[0].instruction.block().get());
}

#[test]
fn notct_maybenull_notnull() {
    let args = vec![
        public_array(100),
        Abstract::MaybeNullPointerTo(Box::new(Abstract::array_of(public(), 100))),
        Abstract::pointer_to(partially_secret()),
    ];
    let report = check("notct_maybenull_notnull", args);
    assert_is_ct_violation(&report);
    assert_eq!("notnull", report.violations[0].instruction.block().get());
}

#[test]
fn ct_doubleptr() {
    assert_no_ct_violation(&check("ct_doubleptr", vec![ptr_to_ptr_to_secrets()]));
}

#[test]
fn notct_doubleptr() {
    assert_is_ct_violation(&check("notct_doubleptr", vec![ptr_to_ptr_to_secrets()]));
}

#[test]
fn ct_struct_voidptr() {
    let args = vec![
        public_array(100),
        Abstract::pointer_to(Abstract::VoidOverride {
            ty: "%PartiallySecret".parse().unwrap(),
            data: Box::new(partially_secret()),
        }),
    ];
    assert_no_ct_violation(&check("ct_struct_voidptr", args));
}

#[test]
fn notct_struct_voidptr() {
    let args = vec![
        public_array(100),
        Abstract::pointer_to(Abstract::VoidOverride {
            ty: "%PartiallySecret".parse().unwrap(),
            data: Box::new(partially_secret()),
        }),
    ];
    assert_is_ct_violation(&check("notct_struct_voidptr", args));
}

#[test]
fn indirectly_recursive_struct() {
    // Both children must point back at exactly the parent passed in, whose
    // `x` is secret. A pointer to some other, default `Parent` would make
    // `x` public and hide the violation.
    let parent = Abstract::Struct(vec![secret(), Abstract::Default, Abstract::Default]);
    let child = Abstract::Struct(vec![public(), Abstract::PointerToParent]);
    let spec = SecrecySpec::new()
        .with_function(
            "indirectly_recursive_struct",
            FunctionSpec::positional(vec![public_array(100), Abstract::pointer_to(parent)]),
        )
        .with_struct("Child", child);
    let report = check_with("indirectly_recursive_struct", &spec, &options());
    assert_is_ct_violation(&report);
    assert_eq!(
        vec!["parent->x"],
        report.violations[0]
            .causes
            .iter()
            .map(|s| s.get())
            .collect::<Vec<_>>()
    );
}

#[test]
fn indirectly_recursive_struct_all_public() {
    // The cycle through `Child::parent` still ends at the parent passed in
    let report = check_with("indirectly_recursive_struct", &SecrecySpec::new(), &options());
    assert_no_ct_violation(&report);
    assert_eq!(Status::Clean, report.status);
    assert_eq!(1, report.statistics.completed);
}

#[test]
fn related_args() {
    // Without a relation between `x` and `length`, `arr[x]` may read a
    // slot holding the secret.
    let args = vec![
        Abstract::public(AbstractValue::Range(0, 20)),
        Abstract::Default,
        secret(),
    ];
    let report = check("related_args", args);
    assert_is_ct_violation(&report);
    assert!(report
        .violations
        .iter()
        .all(|v| v.kind == ViolationKind::SecretBranch));
}

#[test]
fn struct_related_fields() {
    let s = Abstract::Struct(vec![
        Abstract::public(AbstractValue::Range(0, 20)),
        Abstract::Default,
        secret(),
    ]);
    let report = check("struct_related_fields", vec![Abstract::pointer_to(s)]);
    assert_is_ct_violation(&report);
}

#[test]
fn dedup_merges_paths() {
    let args = vec![
        Abstract::public(AbstractValue::Range(0, 20)),
        Abstract::Default,
        secret(),
    ];
    let spec = SecrecySpec::new().with_function("related_args", FunctionSpec::positional(args));
    let all = check_with("related_args", &spec, &options());
    assert!(all.violations.len() > 1);
    let merged = check_with(
        "related_args",
        &spec,
        &Options {
            dedup: true,
            ..options()
        },
    );
    assert_eq!(1, merged.violations.len());
    assert_eq!(all.violations.len(), merged.violations[0].count);
    assert_eq!(all.statistics, merged.statistics);
}

#[test]
fn deterministic() {
    let spec = SecrecySpec::new().with_function(
        "two_ct_violations",
        FunctionSpec::positional(secret_secret_public()),
    );
    let a = check_with("two_ct_violations", &spec, &options());
    let b = check_with("two_ct_violations", &spec, &options());
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn whole_module() {
    let m = module();
    let spec = SecrecySpec::all_secret();
    let results = analysis::check_module(&m, &spec, &Signatures::default(), &options());
    assert_eq!(m.functions.len(), results.len());
    let status = |f: &str| {
        results
            .iter()
            .find(|(g, _)| g.get() == f)
            .map(|(_, r)| r.as_ref().unwrap().status)
            .unwrap()
    };
    assert_eq!(Status::Clean, status("ct_simple"));
    assert_eq!(Status::Violating, status("notct_branch"));
}
