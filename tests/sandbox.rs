use preflight_sandbox::config::{AppConfig, NonPrimitivePolicy};
use preflight_sandbox::{
    AbortSignal, DiagnosticKind, Environment, EnvironmentStore, ExecutionReport, LogLevel,
    PreflightError, RequestContext, SandboxRuntime, substitute,
};
use serde_json::json;
use std::time::{Duration, Instant};

async fn run_with(config: &AppConfig, source: &str, environment: Environment) -> ExecutionReport {
    SandboxRuntime::new(config)
        .execute(
            source,
            EnvironmentStore::new(environment),
            RequestContext::default(),
            None,
        )
        .await
        .expect("run should not fail")
}

async fn run(source: &str) -> ExecutionReport {
    run_with(&AppConfig::test_config(), source, Environment::new()).await
}

fn rendered(report: &ExecutionReport) -> Vec<String> {
    report.logs.iter().map(ToString::to_string).collect()
}

// ============================================================================
// Global scope
// ============================================================================

#[tokio::test]
async fn test_host_and_codegen_globals_are_absent() {
    let report = run(
        "console.log(typeof Uint8Array, typeof ArrayBuffer, typeof globalThis, \
         typeof eval, typeof Function, typeof require, typeof process, typeof window)",
    )
    .await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(
        rendered(&report),
        vec!["Log: undefined undefined undefined undefined undefined undefined undefined undefined"]
    );
}

#[tokio::test]
async fn test_allowed_globals_are_present() {
    let report = run(
        "console.log(typeof JSON, typeof Math, typeof Promise, typeof Date, typeof fetch, \
         typeof setTimeout, typeof btoa, typeof atob, typeof lab.CryptoJS)",
    )
    .await;
    assert_eq!(
        rendered(&report),
        vec!["Log: object object function function function function function function object"]
    );
}

#[tokio::test]
async fn test_function_constructor_routes_are_sealed() {
    let cases = [
        "(() => {}).constructor('return 1')()",
        "Object.getPrototypeOf(async function () {}).constructor('return 1')",
        "Object.getPrototypeOf(function* () {}).constructor('yield 1')",
        "[].map.constructor('return this')()",
        "const c = ['con', 'structor'].join(''); (() => {})[c]('return this')()",
        "const { constructor: F } = () => {}; F('return this')()",
        "Reflect.construct((() => {}).constructor, ['return this'])",
    ];
    for source in cases {
        let report = run(source).await;
        let error = report.error.expect("constructor call must throw");
        assert_eq!(error.kind, DiagnosticKind::RuntimeThrow, "{}", source);
        assert!(error.message.starts_with("EvalError:"), "{}: {}", source, error.message);
    }
}

#[tokio::test]
async fn test_sealed_constructor_cannot_be_restored() {
    let report = run(
        "const proto = Object.getPrototypeOf(function () {});\n\
         proto.constructor = function () { return 'pwned' };",
    )
    .await;
    let error = report.error.expect("assignment to a frozen slot throws in strict mode");
    assert!(error.message.starts_with("TypeError:"), "{}", error.message);
}

#[tokio::test]
async fn test_sandbox_objects_are_frozen() {
    let report = run("lab.environment = null; console.log('unreachable')").await;
    assert!(report.error.is_some());
    assert!(report.logs.iter().all(|entry| entry.text != "unreachable"));
}

// ============================================================================
// console
// ============================================================================

#[tokio::test]
async fn test_console_levels_and_arguments() {
    let report = run(
        "console.log('a', 1, true, null, undefined);\n\
         console.info({ a: 1 });\n\
         console.warn([1, 2]);\n\
         console.error('bad');",
    )
    .await;
    assert_eq!(
        rendered(&report),
        vec![
            "Log: a 1 true null undefined",
            "Info: [object Object]",
            "Warn: 1,2",
            "Error: bad",
        ]
    );
    let lines: Vec<Option<u32>> = report.logs.iter().map(|entry| entry.line).collect();
    assert_eq!(lines, vec![Some(1), Some(2), Some(3), Some(4)]);
}

#[tokio::test]
async fn test_console_entries_point_at_call_start() {
    let report = run(
        "const x = 1\n\
         const r = { [Symbol.toStringTag]: 'Response' }\n\
         console.log(r)\n\
         if (x) {\n\
         \x20\x20console.warn('nested', [1, 2].map((n) => n * 2))\n\
         }\n\
         [1].forEach((n) => console.info(n))",
    )
    .await;
    assert!(report.is_success(), "{:?}", report.error);
    let located: Vec<String> = report
        .logs
        .iter()
        .map(|entry| entry.display_with_location())
        .collect();
    assert_eq!(
        located,
        vec![
            "Log: [object Response] (Line: 3, Column: 1)",
            "Warn: nested 2,4 (Line: 5, Column: 3)",
            "Info: 1 (Line: 7, Column: 20)",
        ]
    );
}

#[tokio::test]
async fn test_thrown_entry_reports_location() {
    let report = run("const a = 1;\n\nnull.boom;").await;
    let last = report.logs.last().expect("thrown entry");
    assert_eq!(last.level, LogLevel::Thrown);
    assert_eq!(last.error_name.as_deref(), Some("TypeError"));
    assert_eq!(last.line, Some(3));
    assert!(last.display_with_location().contains("(Line: 3"));
    assert_eq!(report.error.unwrap().line, Some(3));
}

#[tokio::test]
async fn test_non_error_throw_is_uncaught() {
    let report = run("throw 'plain string'").await;
    assert_eq!(rendered(&report), vec!["Uncaught: plain string"]);
}

#[tokio::test]
async fn test_log_limit_truncates_once() {
    let mut config = AppConfig::test_config();
    config.sandbox.max_log_entries = 5;
    let report = run_with(
        &config,
        "for (let i = 0; i < 20; i++) console.log(i);\nthrow new Error('end')",
        Environment::new(),
    )
    .await;
    assert_eq!(report.logs.len(), 7);
    assert_eq!(report.logs[5].level, LogLevel::Warn);
    assert_eq!(report.logs[6].to_string(), "Error: end");
}

// ============================================================================
// lab.environment
// ============================================================================

#[tokio::test]
async fn test_environment_read_modify_write() {
    let baseline = Environment::from_json(json!({"foo": 10, "keep": "x"})).unwrap();
    let report = run_with(
        &AppConfig::test_config(),
        "lab.environment.set('foo', lab.environment.get('foo') + 82);\n\
         lab.environment.set('keep', undefined);\n\
         lab.environment.set('fresh', null);\n\
         console.log(lab.environment.get('missing') === undefined);",
        baseline,
    )
    .await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(rendered(&report), vec!["Log: true"]);
    assert_eq!(
        report.environment_after.get().to_json(),
        json!({"foo": 92, "fresh": null})
    );
    assert_eq!(report.environment_after.baseline().get("foo"), Some(&json!(10)));
}

#[tokio::test]
async fn test_large_and_small_numbers_substitute_like_string() {
    let report = run(
        "lab.environment.set('big', 1e20);\n\
         lab.environment.set('small', 1e-7);\n\
         console.log(String(1e20), String(1e-7));",
    )
    .await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(rendered(&report), vec!["Log: 100000000000000000000 1e-7"]);
    assert_eq!(
        substitute("{{big}}|{{small}}", &report.environment_after.snapshot()),
        "100000000000000000000|1e-7"
    );
}

#[tokio::test]
async fn test_read_only_script_leaves_environment_clean() {
    let baseline = Environment::from_json(json!({"foo": 1})).unwrap();
    let report = run_with(
        &AppConfig::test_config(),
        "console.log(lab.environment.get('foo'));\nlab.environment.set('foo', 1);",
        baseline.clone(),
    )
    .await;
    assert!(!report.environment_after.is_dirty());
    assert_eq!(report.environment_after.get(), baseline);
}

#[tokio::test]
async fn test_non_primitive_values_are_stringified() {
    let report = run("lab.environment.set('obj', { a: 1 }); lab.environment.set('list', [1, 2]);").await;
    assert!(report.is_success());
    assert_eq!(
        report.environment_after.get().to_json(),
        json!({"obj": "[object Object]", "list": "1,2"})
    );
}

#[tokio::test]
async fn test_non_primitive_values_can_be_rejected() {
    let mut config = AppConfig::test_config();
    config.sandbox.non_primitive_values = NonPrimitivePolicy::Reject;
    let report = run_with(
        &config,
        "lab.environment.set('obj', { a: 1 })",
        Environment::new(),
    )
    .await;
    let error = report.error.expect("set must throw");
    assert!(error.message.starts_with("TypeError:"), "{}", error.message);
    assert!(error.message.contains("obj"));
    assert!(report.environment_after.get_value("obj").is_none());
}

// ============================================================================
// lab.CryptoJS, btoa, atob
// ============================================================================

#[tokio::test]
async fn test_crypto_digests() {
    let report = run(
        "console.log(lab.CryptoJS.SHA256('🐝').toString());\n\
         const mac = lab.CryptoJS.HmacSHA256('The quick brown fox jumps over the lazy dog', 'key');\n\
         console.log(mac.toString(lab.CryptoJS.enc.Hex));\n\
         console.log(mac.toString(lab.CryptoJS.enc.Base64));\n\
         console.log(lab.CryptoJS.SHA512('').toString().length);",
    )
    .await;
    assert_eq!(
        rendered(&report),
        vec![
            "Log: d5b51e79e4be0c4f4d6b9a14e16ca864de96afe68459e60a794e80393a4809e8",
            "Log: f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8",
            "Log: 97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=",
            "Log: 128",
        ]
    );
}

#[tokio::test]
async fn test_btoa_and_atob() {
    let report = run(
        "console.log(btoa('Hello'), atob('SGVsbG8='));\n\
         try { btoa('🐝') } catch (e) { console.error(e.name) }\n\
         try { atob('*') } catch (e) { console.error(e.name) }",
    )
    .await;
    assert_eq!(
        rendered(&report),
        vec![
            "Log: SGVsbG8= Hello",
            "Error: InvalidCharacterError",
            "Error: InvalidCharacterError",
        ]
    );
}

// ============================================================================
// Async work, timers and limits
// ============================================================================

#[tokio::test]
async fn test_timers_fire_in_due_order() {
    let report = run(
        "setTimeout(() => console.log('second'), 20);\n\
         setTimeout((word) => console.log(word), 0, 'first');\n\
         await new Promise((resolve) => setTimeout(resolve, 50));\n\
         console.log('done');",
    )
    .await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(rendered(&report), vec!["Log: first", "Log: second", "Log: done"]);
}

#[tokio::test]
async fn test_timers_pending_after_completion_are_dropped() {
    let report = run("setTimeout(() => lab.environment.set('late', 1), 10);").await;
    assert!(report.is_success());
    assert!(report.environment_after.get_value("late").is_none());
}

#[tokio::test]
async fn test_string_timer_is_refused_at_runtime() {
    let report = run("const code = 'x'; setTimeout(code, 0)").await;
    let error = report.error.expect("string callback throws");
    assert!(error.message.starts_with("EvalError:"), "{}", error.message);
}

#[tokio::test]
async fn test_throw_inside_timer_fails_run() {
    let report = run(
        "setTimeout(() => { throw new RangeError('late') }, 0);\n\
         await new Promise((resolve) => setTimeout(resolve, 10));",
    )
    .await;
    assert_eq!(report.error.unwrap().message, "RangeError: late");
}

#[tokio::test]
async fn test_rejected_top_level_await() {
    let report = run("await Promise.reject(new SyntaxError('nope'))").await;
    assert_eq!(report.error.unwrap().message, "SyntaxError: nope");
}

#[tokio::test]
async fn test_never_settling_promise_times_out() {
    let report = run("await new Promise(() => {})").await;
    assert_eq!(report.error.unwrap().kind, DiagnosticKind::Timeout);
}

#[tokio::test]
async fn test_timeout_discards_nothing_from_baseline() {
    let mut config = AppConfig::test_config();
    config.sandbox.timeout_ms = 150;
    let baseline = Environment::from_json(json!({"foo": 10})).unwrap();
    let started = Instant::now();
    let report = run_with(
        &config,
        "lab.environment.set('foo', 92); while (true) {}",
        baseline,
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.error.unwrap().kind, DiagnosticKind::Timeout);
    assert_eq!(report.environment_after.baseline().get("foo"), Some(&json!(10)));
}

#[tokio::test]
async fn test_runaway_recursion_is_contained() {
    let report = run("function f() { return f() + 1 }\nf()").await;
    let error = report.error.expect("stack overflow is reported");
    assert_eq!(error.kind, DiagnosticKind::RuntimeThrow);
}

#[tokio::test]
async fn test_abort_signal_cancels_running_script() {
    let signal = AbortSignal::new();
    let runtime = SandboxRuntime::new(&AppConfig::test_config());
    let canceller = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = runtime
        .execute(
            "while (true) {}",
            EnvironmentStore::default(),
            RequestContext::default(),
            Some(signal),
        )
        .await;
    assert!(matches!(result, Err(PreflightError::Cancelled)));
}

#[tokio::test]
async fn test_runs_are_isolated() {
    let runtime = SandboxRuntime::new(&AppConfig::test_config());
    let first = runtime
        .execute(
            "Array.prototype.leak = 1; Object.prototype.polluted = true;",
            EnvironmentStore::default(),
            RequestContext::default(),
            None,
        )
        .await
        .unwrap();
    assert!(first.is_success());

    let second = runtime
        .execute(
            "console.log([].leak, ({}).polluted)",
            EnvironmentStore::default(),
            RequestContext::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(rendered(&second), vec!["Log: undefined undefined"]);
}
