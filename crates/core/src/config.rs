//! 설정 관리: senseflow.toml 파싱 및 런타임 설정
//!
//! [`SenseflowConfig`]는 모든 모듈의 설정과 디바이스 등록 목록을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`SENSEFLOW_INGEST_KEEP_ALIVE_SECS=60` 형식)
//! 3. 설정 파일 (`senseflow.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! 디바이스 등록(`[[devices]]`)은 환경변수로 오버라이드하지 않습니다.
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), senseflow_core::error::SenseflowError> {
//! use senseflow_core::config::SenseflowConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = SenseflowConfig::load("senseflow.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = SenseflowConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, SenseflowError};

/// 지원하는 디코더 형식 이름 (별칭 포함)
pub const DECODER_KINDS: &[&str] = &["json", "csv", "delimited-text", "binary-mask", "plain-debug"];

/// senseflow 통합 설정
///
/// `senseflow.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenseflowConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 수집 파이프라인 설정
    #[serde(default)]
    pub ingest: IngestConfig,
    /// 메트릭 엔드포인트 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 디바이스 등록 목록
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl SenseflowConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SenseflowError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SenseflowError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SenseflowError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                SenseflowError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, SenseflowError> {
        toml::from_str(toml_str).map_err(|e| {
            SenseflowError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `SENSEFLOW_{SECTION}_{FIELD}`
    /// 예: `SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE=30`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "SENSEFLOW_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "SENSEFLOW_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "SENSEFLOW_GENERAL_PID_FILE");

        // Ingest
        override_bool(&mut self.ingest.enabled, "SENSEFLOW_INGEST_ENABLED");
        override_usize(
            &mut self.ingest.record_channel_capacity,
            "SENSEFLOW_INGEST_RECORD_CHANNEL_CAPACITY",
        );
        override_u64(
            &mut self.ingest.reconnect_backoff_base_ms,
            "SENSEFLOW_INGEST_RECONNECT_BACKOFF_BASE_MS",
        );
        override_u64(
            &mut self.ingest.reconnect_backoff_max_ms,
            "SENSEFLOW_INGEST_RECONNECT_BACKOFF_MAX_MS",
        );
        override_u64(
            &mut self.ingest.keep_alive_secs,
            "SENSEFLOW_INGEST_KEEP_ALIVE_SECS",
        );
        override_usize(
            &mut self.ingest.max_payload_bytes,
            "SENSEFLOW_INGEST_MAX_PAYLOAD_BYTES",
        );
        override_bool(
            &mut self.ingest.outlier_enabled,
            "SENSEFLOW_INGEST_OUTLIER_ENABLED",
        );
        override_usize(
            &mut self.ingest.outlier_window_size,
            "SENSEFLOW_INGEST_OUTLIER_WINDOW_SIZE",
        );
        override_bool(
            &mut self.ingest.outlier_replace_on_detect,
            "SENSEFLOW_INGEST_OUTLIER_REPLACE_ON_DETECT",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "SENSEFLOW_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "SENSEFLOW_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "SENSEFLOW_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    ///
    /// 디코더 세부 설정(마스크 필드, 경로 식 등)은 수집 세션 활성화 시점에
    /// `senseflow-ingest`가 별도로 검증합니다.
    pub fn validate(&self) -> Result<(), SenseflowError> {
        // log_level 검증
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        // log_format 검증
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        self.ingest.validate()?;

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(invalid("metrics.port", "must be greater than 0"));
            }
            if self.metrics.endpoint != "/metrics" {
                return Err(invalid(
                    "metrics.endpoint",
                    "only '/metrics' is currently supported",
                ));
            }
        }

        // 디바이스 ID 중복 및 필수 필드 검증
        let mut seen = HashSet::new();
        for (idx, device) in self.devices.iter().enumerate() {
            device.validate(idx)?;
            if !seen.insert(device.id.as_str()) {
                return Err(invalid(
                    format!("devices[{idx}].id"),
                    format!("duplicate device id '{}'", device.id),
                ));
            }
        }

        Ok(())
    }
}

// Default는 derive 매크로로 자동 생성 (각 필드가 Default를 구현하므로)

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 생성하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 수집 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 측정값 레코드 채널 용량
    pub record_channel_capacity: usize,
    /// 재연결 백오프 시작 간격 (밀리초)
    pub reconnect_backoff_base_ms: u64,
    /// 재연결 백오프 최대 간격 (밀리초)
    pub reconnect_backoff_max_ms: u64,
    /// MQTT keep-alive 간격 (초)
    pub keep_alive_secs: u64,
    /// 페이로드 최대 크기 (바이트). 초과 시 디코딩 없이 버림
    pub max_payload_bytes: usize,
    /// 이상치 필터 기본 활성화 여부
    pub outlier_enabled: bool,
    /// 이상치 필터 기본 윈도우 크기
    pub outlier_window_size: usize,
    /// 이상치 탐지 시 평균값으로 대체할지 여부 (false면 플래그만 설정)
    pub outlier_replace_on_detect: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record_channel_capacity: 1024,
            reconnect_backoff_base_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            keep_alive_secs: 30,
            max_payload_bytes: 256 * 1024, // 256KB
            outlier_enabled: true,
            outlier_window_size: 15,
            outlier_replace_on_detect: false,
        }
    }
}

/// 이상치 필터 윈도우 크기 상한 (전역 설정과 디바이스 오버라이드에 공통 적용)
pub const MAX_OUTLIER_WINDOW_SIZE: usize = 10_000;

impl IngestConfig {
    /// 수집 설정값의 범위를 검증합니다.
    pub fn validate(&self) -> Result<(), SenseflowError> {
        const MAX_CHANNEL_CAPACITY: usize = 1_000_000;
        const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024; // 16MB

        if self.record_channel_capacity == 0 || self.record_channel_capacity > MAX_CHANNEL_CAPACITY
        {
            return Err(invalid(
                "ingest.record_channel_capacity",
                format!("must be 1-{}", MAX_CHANNEL_CAPACITY),
            ));
        }

        if self.reconnect_backoff_base_ms == 0 {
            return Err(invalid(
                "ingest.reconnect_backoff_base_ms",
                "must be greater than 0",
            ));
        }

        if self.reconnect_backoff_max_ms < self.reconnect_backoff_base_ms {
            return Err(invalid(
                "ingest.reconnect_backoff_max_ms",
                "must be greater than or equal to reconnect_backoff_base_ms",
            ));
        }

        if self.keep_alive_secs == 0 {
            return Err(invalid("ingest.keep_alive_secs", "must be greater than 0"));
        }

        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_PAYLOAD_BYTES {
            return Err(invalid(
                "ingest.max_payload_bytes",
                format!("must be 1-{}", MAX_PAYLOAD_BYTES),
            ));
        }

        if self.outlier_window_size == 0 || self.outlier_window_size > MAX_OUTLIER_WINDOW_SIZE {
            return Err(invalid(
                "ingest.outlier_window_size",
                format!("must be 1-{}", MAX_OUTLIER_WINDOW_SIZE),
            ));
        }

        Ok(())
    }
}

/// 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 스크레이프 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// 디바이스 등록 설정
///
/// 하나의 현장 디바이스(box)를 식별하고, 전송 엔드포인트와 디코더 선택을 담습니다.
/// 세션이 활성화된 동안에는 변경되지 않으며, 재설정 시 통째로 교체됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 디바이스(box) ID
    pub id: String,
    /// 브로커 엔드포인트 (예: "mqtt://broker.example.org:1883")
    pub endpoint: String,
    /// 구독할 토픽
    pub topic: String,
    /// 브로커 사용자명
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// 브로커 비밀번호
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 디코더 설정
    pub decoder: DecoderSection,
    /// 디바이스별 이상치 필터 오버라이드
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier: Option<OutlierSection>,
}

impl DeviceConfig {
    fn validate(&self, idx: usize) -> Result<(), SenseflowError> {
        if self.id.trim().is_empty() {
            return Err(invalid(format!("devices[{idx}].id"), "must not be empty"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(invalid(
                format!("devices[{idx}].endpoint"),
                "must not be empty",
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(invalid(format!("devices[{idx}].topic"), "must not be empty"));
        }
        if !DECODER_KINDS.contains(&self.decoder.kind.as_str()) {
            return Err(invalid(
                format!("devices[{idx}].decoder.kind"),
                format!("must be one of: {}", DECODER_KINDS.join(", ")),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(invalid(
                format!("devices[{idx}].password"),
                "password requires a username",
            ));
        }
        if let Some(window_size) = self.outlier.as_ref().and_then(|o| o.window_size) {
            if window_size == 0 || window_size > MAX_OUTLIER_WINDOW_SIZE {
                return Err(invalid(
                    format!("devices[{idx}].outlier.window_size"),
                    format!("must be 1-{}", MAX_OUTLIER_WINDOW_SIZE),
                ));
            }
        }
        Ok(())
    }
}

/// 디코더 설정 섹션
///
/// `kind`에 따라 사용하는 필드가 다릅니다.
/// - `json`: `path`
/// - `csv` / `delimited-text`: 추가 설정 없음
/// - `binary-mask`: `preset` 또는 `mask_fields` + `scaling` + `composites`
/// - `plain-debug`: 추가 설정 없음
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecoderSection {
    /// 디코더 형식
    pub kind: String,
    /// JSON 경로 식 (예: "$.measurements")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 바이너리 마스크 사전 정의 프로파일 (예: "sensebox-home")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// 바이너리 마스크 필드 목록 (순서대로 소비)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mask_fields: Vec<MaskFieldSection>,
    /// 필드 라벨 → 스케일링 종류 (temperature, humidity, pressure)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scaling: BTreeMap<String, String>,
    /// mod/times 합성 필드 목록
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub composites: Vec<CompositeSection>,
}

/// 바이너리 마스크 필드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskFieldSection {
    /// 필드 폭 (바이트)
    pub width_bytes: usize,
    /// 변환기 이름 (uint8, uint16, humidity)
    pub converter: String,
    /// 출력 라벨. 없으면 위치 인덱스 사용
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// mod/times 합성 필드 설정 (값 = times * 255 + mod)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSection {
    /// 나머지(mod) 필드 라벨
    pub mod_field: String,
    /// 몫(times) 필드 라벨
    pub times_field: String,
    /// 결과 라벨
    pub output: String,
}

/// 디바이스별 이상치 필터 오버라이드 (없는 항목은 `[ingest]` 기본값 사용)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlierSection {
    /// 활성화 여부
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// 윈도우 크기
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    /// 평균값 대체 여부
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_on_detect: Option<bool>,
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> SenseflowError {
    SenseflowError::Config(ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    })
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
