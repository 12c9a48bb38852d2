//! Integration tests for telemetry initialization and span helpers.

use std::path::Path;

#[test]
fn telemetry_logs_to_stderr_without_endpoint() {
    let config = workbatch::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workbatch-test".to_string(),
        log_level: "debug".to_string(),
    };
    // Only the first subscriber in a process installs; a second call fails
    // cleanly instead of panicking.
    match workbatch::telemetry::init_telemetry(config) {
        Ok(guard) => assert!(!guard.is_exporting()),
        Err(e) => assert!(e.to_string().contains("tracing subscriber")),
    }
}

#[test]
fn telemetry_config_follows_process_config() {
    let config = workbatch::config::Config {
        tool: "codeagent-wrapper".into(),
        backend: "codex".to_string(),
        state_dir: ".workbatch".into(),
        otel_endpoint: Some("http://localhost:4317".to_string()),
        log_level: "warn".to_string(),
    };

    let telemetry = workbatch::telemetry::TelemetryConfig::from_config(&config);
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.service_name, workbatch::telemetry::SERVICE_NAME);
    assert_eq!(telemetry.log_level, "warn");
}

#[test]
fn task_span_creates_and_records_transition() {
    let span = workbatch::telemetry::work::start_task_span("audit", "src/lib.rs");
    workbatch::telemetry::work::record_state_transition(&span, "pending", "running");
    workbatch::telemetry::work::record_state_transition(&span, "running", "completed");
}

#[test]
fn invocation_span_creates() {
    let span = workbatch::telemetry::work::start_invocation_span(
        "codex",
        Path::new("/usr/local/bin/codeagent-wrapper"),
    );
    let _entered = span.enter();
}

#[test]
fn metric_instruments_are_usable_without_provider() {
    use opentelemetry::KeyValue;
    use workbatch::telemetry::metrics;

    metrics::invocations().add(1, &[KeyValue::new("result", "ok")]);
    metrics::retries().add(1, &[KeyValue::new("rate_limited", false)]);
    metrics::rate_limited().add(1, &[KeyValue::new("backend", "codex")]);
    metrics::task_outcomes().add(1, &[KeyValue::new("status", "failed")]);
    metrics::invocation_duration_ms().record(12.5, &[]);
}
