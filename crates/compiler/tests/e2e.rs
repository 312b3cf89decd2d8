//! End-to-end tests: source text through the full pipeline into the
//! VM, against a recording runtime.

use flow_core::{DiagnosticReport, LiteralType, Value};
use flow_vm::{Program, Runner, RunnerState, Runtime};
use std::sync::{Arc, Mutex};

type CallLog = Arc<Mutex<Vec<String>>>;

/// A runtime that records which handlers ran and with what arguments.
fn recording_runtime(log: &CallLog, request_path: &str) -> Runtime {
    let mut runtime = Runtime::new();

    runtime.register_handler("pass").bind({
        let log = log.clone();
        move |params| {
            log.lock().unwrap().push("pass".to_string());
            params.set_handled(true);
        }
    });

    for name in ["a_handler", "b_handler", "default_handler"] {
        runtime.register_handler(name).bind({
            let log = log.clone();
            move |params| {
                log.lock().unwrap().push(name.to_string());
                params.set_handled(true);
            }
        });
    }

    let path = request_path.to_string();
    runtime
        .register_function("req.path", LiteralType::String)
        .bind(move |params| {
            params.set_result(Value::String(path.clone()));
        });

    runtime
        .register_handler("show_user")
        .param(LiteralType::String, "id")
        .bind({
            let log = log.clone();
            move |params| {
                let id = params.get_string(1).to_string();
                log.lock().unwrap().push(format!("show_user({})", id));
                params.set_handled(true);
            }
        });

    runtime
        .register_function("async_lookup", LiteralType::Number)
        .param(LiteralType::String, "key")
        .bind(|params| {
            params.suspend();
        });

    runtime
}

fn compile(source: &str, runtime: &mut Runtime) -> Program {
    let mut report = DiagnosticReport::new();
    let mut program = flowc::compile(source, "e2e.flow", runtime, &[], true, &mut report)
        .unwrap_or_else(|| panic!("compilation failed:\n{}", report));
    program.link(runtime).unwrap();
    program
}

fn run_main(source: &str, request_path: &str) -> (bool, Vec<String>) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = recording_runtime(&log, request_path);
    let program = compile(source, &mut runtime);

    let mut userdata = ();
    let mut runner = Runner::new(&program, &runtime, "main", &mut userdata).unwrap();
    let handled = runner.run().unwrap();
    let calls = log.lock().unwrap().clone();
    (handled, calls)
}

#[test]
fn test_arithmetic_handler() {
    let (handled, calls) = run_main(
        "handler main { var x = 2; var y = 3; if x + y == 5 then pass; }",
        "/",
    );
    assert!(handled);
    assert_eq!(calls, vec!["pass"]);
}

#[test]
fn test_string_concat_and_compare() {
    let (handled, calls) = run_main(
        r#"handler main { if "foo" + "bar" == "foobar" then pass; }"#,
        "/",
    );
    assert!(handled);
    assert_eq!(calls, vec!["pass"]);
}

#[test]
fn test_match_on_head() {
    let source = r#"
handler main {
  match req.path =^ {
    on "/a" a_handler;
    on "/b" b_handler;
    else    default_handler;
  }
}
"#;
    let (handled, calls) = run_main(source, "/b/x");
    assert!(handled);
    assert_eq!(calls, vec!["b_handler"]);

    let (_, calls) = run_main(source, "/a/y");
    assert_eq!(calls, vec!["a_handler"]);

    let (_, calls) = run_main(source, "/zzz");
    assert_eq!(calls, vec!["default_handler"]);
}

#[test]
fn test_regex_capture() {
    let source = r#"
handler main {
  if req.path =~ /^\/user\/(\d+)$/ then
    show_user($1);
}
"#;
    let (handled, calls) = run_main(source, "/user/42");
    assert!(handled);
    assert_eq!(calls, vec!["show_user(42)"]);

    let (handled, calls) = run_main(source, "/user/nope");
    assert!(!handled);
    assert!(calls.is_empty());
}

#[test]
fn test_suspend_resume() {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = recording_runtime(&log, "/");
    let program = compile(
        r#"handler main { var x = async_lookup("key"); if x == 99 then pass; }"#,
        &mut runtime,
    );

    let mut userdata = ();
    let mut runner = Runner::new(&program, &runtime, "main", &mut userdata).unwrap();

    // first run suspends inside the native call
    assert_eq!(runner.run().unwrap(), false);
    assert_eq!(runner.state(), RunnerState::Suspended);

    // host completion delivers the lookup result, then resumes
    runner.set_result(Value::Number(99)).unwrap();
    assert!(runner.resume().unwrap());
    assert_eq!(log.lock().unwrap().clone(), vec!["pass"]);
}

#[test]
fn test_else_branch_and_not_handled() {
    let (handled, calls) = run_main(
        "handler main { var x = 1; if x == 2 then pass; }",
        "/",
    );
    assert!(!handled);
    assert!(calls.is_empty());
}

#[test]
fn test_user_handler_inlining_end_to_end() {
    let source = r#"
handler check_admin {
  if req.path =^ "/admin" then pass;
}
handler main {
  check_admin;
  default_handler;
}
"#;
    let (handled, calls) = run_main(source, "/admin/users");
    assert!(handled);
    assert_eq!(calls, vec!["pass"]);

    let (handled, calls) = run_main(source, "/public");
    assert!(handled);
    assert_eq!(calls, vec!["default_handler"]);
}

#[test]
fn test_cidr_membership_end_to_end() {
    let source = r#"
handler main {
  var net = 10.0.0.0/8;
  if 10.1.2.3 in net then pass;
}
"#;
    let (handled, _) = run_main(source, "/");
    assert!(handled);
}

#[test]
fn test_logical_or_over_request_paths() {
    let source = r#"
handler main {
  var p = req.path;
  if p == "/x" or p =^ "/y" then pass;
}
"#;
    let (handled, _) = run_main(source, "/y/z");
    assert!(handled);
    let (handled, _) = run_main(source, "/x");
    assert!(handled);
    let (handled, _) = run_main(source, "/other");
    assert!(!handled);
}

#[test]
fn test_userdata_reaches_native_callbacks() {
    struct RequestContext {
        client: String,
        seen: bool,
    }

    let mut runtime = Runtime::new();
    runtime
        .register_function("client.name", LiteralType::String)
        .bind(|params| {
            let ctx = params
                .userdata()
                .downcast_mut::<RequestContext>()
                .expect("userdata type");
            ctx.seen = true;
            let name = ctx.client.clone();
            params.set_result(Value::String(name));
        });
    runtime.register_handler("pass").bind(|params| {
        params.set_handled(true);
    });

    let program = compile(
        r#"handler main { if client.name == "argo" then pass; }"#,
        &mut runtime,
    );

    let mut context = RequestContext {
        client: "argo".to_string(),
        seen: false,
    };
    let mut runner = Runner::new(&program, &runtime, "main", &mut context).unwrap();
    assert!(runner.run().unwrap());
    assert!(context.seen);
}

#[test]
fn test_division_by_zero_faults_at_runtime() {
    let mut runtime = Runtime::new();
    runtime.register_handler("pass").bind(|params| {
        params.set_handled(true);
    });
    runtime
        .register_function("zero", LiteralType::Number)
        .bind(|params| params.set_result(Value::Number(0)));

    let program = compile(
        "handler main { var x = 10 / zero(); if x == 1 then pass; }",
        &mut runtime,
    );
    let mut userdata = ();
    let mut runner = Runner::new(&program, &runtime, "main", &mut userdata).unwrap();
    assert!(runner.run().is_err());
    assert!(runner.is_faulted());
}

#[test]
fn test_globals_are_visible_in_handlers() {
    let source = r#"
var greeting = "hello " + "world";
handler main {
  if greeting == "hello world" then pass;
}
"#;
    let (handled, _) = run_main(source, "/");
    assert!(handled);
}
