//! senseflow.toml 통합 설정 테스트
//!
//! - senseflow.toml.example 파싱 테스트
//! - 부분 설정 (일부 섹션만) 로딩 테스트
//! - 환경변수 우선순위 테스트
//! - 빈 파일 / 잘못된 형식 에러 테스트

use std::io::Write;

use senseflow_core::config::SenseflowConfig;
use senseflow_core::error::{ConfigError, SenseflowError};

// =============================================================================
// senseflow.toml.example 파싱 테스트
// =============================================================================

#[test]
fn example_config_parses_successfully() {
    let content = include_str!("../../../senseflow.toml.example");
    let config = SenseflowConfig::parse(content).expect("example config should parse");

    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
    assert_eq!(config.general.pid_file, "/var/run/senseflow/senseflow.pid");
}

#[test]
fn example_config_passes_validation() {
    let content = include_str!("../../../senseflow.toml.example");
    let config = SenseflowConfig::parse(content).expect("should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_ingest_section_matches_code_defaults() {
    let content = include_str!("../../../senseflow.toml.example");
    let config = SenseflowConfig::parse(content).expect("should parse");
    let defaults = SenseflowConfig::default();

    assert_eq!(config.ingest.enabled, defaults.ingest.enabled);
    assert_eq!(
        config.ingest.record_channel_capacity,
        defaults.ingest.record_channel_capacity
    );
    assert_eq!(
        config.ingest.reconnect_backoff_base_ms,
        defaults.ingest.reconnect_backoff_base_ms
    );
    assert_eq!(
        config.ingest.reconnect_backoff_max_ms,
        defaults.ingest.reconnect_backoff_max_ms
    );
    assert_eq!(config.ingest.keep_alive_secs, defaults.ingest.keep_alive_secs);
    assert_eq!(
        config.ingest.max_payload_bytes,
        defaults.ingest.max_payload_bytes
    );
    assert_eq!(
        config.ingest.outlier_window_size,
        defaults.ingest.outlier_window_size
    );
    assert_eq!(
        config.ingest.outlier_replace_on_detect,
        defaults.ingest.outlier_replace_on_detect
    );
    assert_eq!(config.metrics.port, defaults.metrics.port);
    assert_eq!(config.metrics.endpoint, defaults.metrics.endpoint);
}

#[test]
fn example_config_registers_three_devices() {
    let content = include_str!("../../../senseflow.toml.example");
    let config = SenseflowConfig::parse(content).expect("should parse");

    assert_eq!(config.devices.len(), 3);
    let kinds: Vec<&str> = config
        .devices
        .iter()
        .map(|d| d.decoder.kind.as_str())
        .collect();
    assert_eq!(kinds, vec!["json", "csv", "binary-mask"]);

    let json_device = &config.devices[0];
    assert_eq!(json_device.decoder.path.as_deref(), Some("$.measurements"));
    assert_eq!(json_device.username.as_deref(), Some("sensebox"));

    let csv_device = &config.devices[1];
    let outlier = csv_device.outlier.as_ref().expect("outlier override");
    assert_eq!(outlier.window_size, Some(30));
    assert_eq!(outlier.replace_on_detect, Some(true));

    let lora_device = &config.devices[2];
    assert_eq!(lora_device.decoder.preset.as_deref(), Some("sensebox-home"));
    assert!(lora_device.decoder.mask_fields.is_empty());
}

// =============================================================================
// 부분 설정 로딩 테스트
// =============================================================================

#[test]
fn partial_config_general_only() {
    let toml = r#"
[general]
log_level = "debug"
log_format = "pretty"
"#;
    let config = SenseflowConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");

    assert_eq!(config.general.log_level, "debug");
    assert_eq!(config.general.log_format, "pretty");
    assert!(config.general.pid_file.is_empty());
    assert!(config.ingest.enabled);
    assert!(config.devices.is_empty());
}

#[test]
fn partial_config_ingest_only() {
    let toml = r#"
[ingest]
keep_alive_secs = 60
outlier_replace_on_detect = true
"#;
    let config = SenseflowConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");

    assert_eq!(config.ingest.keep_alive_secs, 60);
    assert!(config.ingest.outlier_replace_on_detect);
    assert_eq!(config.ingest.outlier_window_size, 15);
}

#[test]
fn partial_config_devices_only() {
    let toml = r#"
[[devices]]
id = "box-1"
endpoint = "mqtt://localhost"
topic = "boxes/1"

[devices.decoder]
kind = "plain-debug"
"#;
    let config = SenseflowConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");

    assert_eq!(config.devices.len(), 1);
    assert_eq!(config.devices[0].decoder.kind, "plain-debug");
    assert!(config.devices[0].outlier.is_none());
}

#[test]
fn device_without_decoder_table_is_parse_error() {
    let toml = r#"
[[devices]]
id = "box-1"
endpoint = "mqtt://localhost"
topic = "boxes/1"
"#;
    let result = SenseflowConfig::parse(toml);
    assert!(matches!(
        result.unwrap_err(),
        SenseflowError::Config(ConfigError::ParseFailed { .. })
    ));
}

// =============================================================================
// 파일 로딩 테스트
// =============================================================================

#[tokio::test]
#[serial_test::serial]
async fn load_from_file_applies_validation() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(
        file,
        r#"
[ingest]
outlier_window_size = 0
"#
    )
    .expect("write");

    let result = SenseflowConfig::load(file.path()).await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("outlier_window_size"));
}

#[tokio::test]
#[serial_test::serial]
async fn load_from_file_reads_devices() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(include_str!("../../../senseflow.toml.example").as_bytes())
        .expect("write");

    let config = SenseflowConfig::load(file.path())
        .await
        .expect("example should load");
    assert_eq!(config.devices.len(), 3);
}

// =============================================================================
// 환경변수 우선순위 테스트
// =============================================================================

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[general]
log_level = "info"
"#;

    let original = std::env::var("SENSEFLOW_GENERAL_LOG_LEVEL").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("SENSEFLOW_GENERAL_LOG_LEVEL", "error");
    }

    let mut config = SenseflowConfig::parse(toml).expect("should parse");
    config.apply_env_overrides();
    let result = config.general.log_level.clone();

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("SENSEFLOW_GENERAL_LOG_LEVEL", val),
            None => std::env::remove_var("SENSEFLOW_GENERAL_LOG_LEVEL"),
        }
    }

    assert_eq!(result, "error");
}

#[test]
#[serial_test::serial]
fn env_override_numeric_field() {
    let original = std::env::var("SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE", "42");
    }

    let mut config = SenseflowConfig::parse("").expect("should parse");
    config.apply_env_overrides();
    let result = config.ingest.outlier_window_size;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE", val),
            None => std::env::remove_var("SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE"),
        }
    }

    assert_eq!(result, 42);
}

#[test]
#[serial_test::serial]
fn env_override_bool_field() {
    let original = std::env::var("SENSEFLOW_METRICS_ENABLED").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("SENSEFLOW_METRICS_ENABLED", "true");
    }

    let mut config = SenseflowConfig::parse("").expect("should parse");
    config.apply_env_overrides();
    let result = config.metrics.enabled;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("SENSEFLOW_METRICS_ENABLED", val),
            None => std::env::remove_var("SENSEFLOW_METRICS_ENABLED"),
        }
    }

    assert!(result);
}

#[test]
#[serial_test::serial]
fn env_override_unparsable_value_keeps_toml_value() {
    let toml = r#"
[ingest]
keep_alive_secs = 45
"#;
    let original = std::env::var("SENSEFLOW_INGEST_KEEP_ALIVE_SECS").ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe {
        std::env::set_var("SENSEFLOW_INGEST_KEEP_ALIVE_SECS", "forever");
    }

    let mut config = SenseflowConfig::parse(toml).expect("should parse");
    config.apply_env_overrides();
    let result = config.ingest.keep_alive_secs;

    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("SENSEFLOW_INGEST_KEEP_ALIVE_SECS", val),
            None => std::env::remove_var("SENSEFLOW_INGEST_KEEP_ALIVE_SECS"),
        }
    }

    assert_eq!(result, 45);
}

#[test]
#[serial_test::serial]
fn env_override_missing_var_keeps_toml_value() {
    let toml = r#"
[general]
log_level = "warn"
"#;

    // SAFETY: 존재하지 않는 변수를 명시적으로 제거
    unsafe {
        std::env::remove_var("SENSEFLOW_GENERAL_LOG_LEVEL");
    }

    let mut config = SenseflowConfig::parse(toml).expect("should parse");
    config.apply_env_overrides();

    assert_eq!(config.general.log_level, "warn");
}

// =============================================================================
// 빈 파일 / 잘못된 형식 에러 테스트
// =============================================================================

#[test]
fn empty_string_parses_with_defaults() {
    let config = SenseflowConfig::parse("").expect("empty string should parse");
    config.validate().expect("should validate");

    assert_eq!(config.general.log_level, "info");
    assert!(config.ingest.enabled);
    assert!(!config.metrics.enabled);
}

#[test]
fn comments_only_parses_with_defaults() {
    let toml = r#"
# 주석만 있는 파일
# 모든 줄이 주석입니다
"#;
    let config = SenseflowConfig::parse(toml).expect("comments-only should parse");
    config.validate().expect("should validate");
    assert_eq!(config.general.log_level, "info");
}

#[test]
fn invalid_type_returns_parse_error() {
    let toml = r#"
[ingest]
enabled = "not_a_bool"
"#;
    let result = SenseflowConfig::parse(toml);
    assert!(matches!(
        result.unwrap_err(),
        SenseflowError::Config(ConfigError::ParseFailed { .. })
    ));
}
