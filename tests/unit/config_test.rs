//! Tests for configuration validation and loading

use std::collections::HashMap;
use std::time::Duration;

use prometheus_model_mutex::config::SchedulerConfig;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.core_worker_count >= 4);
    assert!(cfg.core_worker_count <= cfg.max_worker_count);
    assert_eq!(cfg.max_worker_count, 512);
    assert_eq!(cfg.keep_alive(), Duration::from_secs(60));
    assert_eq!(cfg.max_queue_depth, 10_000);
    assert_eq!(cfg.thread_name_prefix, "model-worker");
}

#[test]
fn test_config_invalid_core_workers() {
    let invalid = SchedulerConfig::new().with_core_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_max_below_core() {
    let invalid = SchedulerConfig::new().with_core_worker_count(8).with_max_worker_count(4);
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("max_worker_count"));
}

#[test]
fn test_config_invalid_queue_depth() {
    let invalid = SchedulerConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_keep_alive() {
    let invalid = SchedulerConfig::new().with_keep_alive(Duration::ZERO);
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("keep_alive_secs"));
}

#[test]
fn test_config_keep_alive_rounds_up_to_whole_seconds() {
    let short = SchedulerConfig::new().with_keep_alive(Duration::from_millis(10));
    assert_eq!(short.keep_alive_secs, 1);
    assert!(short.validate().is_ok());

    let fractional = SchedulerConfig::new().with_keep_alive(Duration::from_millis(1500));
    assert_eq!(fractional.keep_alive(), Duration::from_secs(2));

    let whole = SchedulerConfig::new().with_keep_alive(Duration::from_secs(3));
    assert_eq!(whole.keep_alive_secs, 3);
}

#[test]
fn test_config_invalid_stack_and_prefix() {
    assert!(SchedulerConfig::new().with_thread_stack_size(1024).validate().is_err());
    assert!(SchedulerConfig::new().with_thread_name_prefix("  ").validate().is_err());
}

#[test]
fn test_config_from_json_fills_defaults() {
    let cfg = SchedulerConfig::from_json_str(r#"{ "core_worker_count": 2, "keep_alive_secs": 5 }"#).unwrap();
    assert_eq!(cfg.core_worker_count, 2);
    assert_eq!(cfg.keep_alive_secs, 5);
    assert_eq!(cfg.max_worker_count, 512);
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(SchedulerConfig::from_json_str(r#"{ "core_worker_count": 0 }"#).is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}

#[test]
fn test_config_json_round_trip() {
    let cfg = SchedulerConfig::new().with_core_worker_count(3).with_thread_name_prefix("jobs");
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(SchedulerConfig::from_json_str(&json).unwrap(), cfg);
}

#[test]
fn test_config_from_lookup() {
    let cfg = SchedulerConfig::from_lookup(lookup(&[
        ("MODEL_MUTEX_CORE_WORKERS", "6"),
        ("MODEL_MUTEX_MAX_WORKERS", " 64 "),
        ("MODEL_MUTEX_THREAD_NAME_PREFIX", "session"),
    ]))
    .unwrap();
    assert_eq!(cfg.core_worker_count, 6);
    assert_eq!(cfg.max_worker_count, 64);
    assert_eq!(cfg.thread_name_prefix, "session");
    assert_eq!(cfg.max_queue_depth, 10_000);
}

#[test]
fn test_config_from_lookup_reports_malformed_variable() {
    let err = SchedulerConfig::from_lookup(lookup(&[("MODEL_MUTEX_KEEP_ALIVE_SECS", "soon")])).unwrap_err();
    assert!(err.contains("MODEL_MUTEX_KEEP_ALIVE_SECS"));
}
