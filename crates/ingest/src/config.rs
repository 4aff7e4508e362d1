//! 수집 파이프라인 설정과 디바이스 등록
//!
//! [`IngestSettings`]는 core의 [`IngestConfig`]를,
//! [`DeviceRegistration`]은 core의 [`DeviceConfig`]를 타입이 있는 형태로 변환한 것입니다.
//!
//! # 사용 예시
//! ```ignore
//! use senseflow_core::config::SenseflowConfig;
//! use senseflow_ingest::config::{DeviceRegistration, IngestSettings};
//!
//! let core_config = SenseflowConfig::default();
//! let settings = IngestSettings::from_core(&core_config.ingest);
//! for device in &core_config.devices {
//!     let registration = DeviceRegistration::from_core(device, &core_config.ingest)?;
//! }
//! ```

use std::fmt;
use std::time::Duration;

use senseflow_core::config::{DeviceConfig, IngestConfig, MAX_OUTLIER_WINDOW_SIZE};

use crate::decoder::{DecoderConfig, JsonPath};
use crate::error::IngestError;
use crate::filter::OutlierSettings;

/// MQTT 기본 포트
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// 수집 파이프라인 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    /// 측정값 레코드 채널 용량
    pub record_channel_capacity: usize,
    /// 재연결 백오프 시작 간격
    pub reconnect_backoff_base: Duration,
    /// 재연결 백오프 최대 간격
    pub reconnect_backoff_max: Duration,
    /// MQTT keep-alive 간격
    pub keep_alive: Duration,
    /// 페이로드 최대 크기 (바이트)
    pub max_payload_bytes: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_core(&IngestConfig::default())
    }
}

impl IngestSettings {
    /// core의 `IngestConfig`에서 설정을 생성합니다.
    pub fn from_core(core: &IngestConfig) -> Self {
        Self {
            record_channel_capacity: core.record_channel_capacity,
            reconnect_backoff_base: Duration::from_millis(core.reconnect_backoff_base_ms),
            reconnect_backoff_max: Duration::from_millis(core.reconnect_backoff_max_ms),
            keep_alive: Duration::from_secs(core.keep_alive_secs),
            max_payload_bytes: core.max_payload_bytes,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.record_channel_capacity == 0 {
            return Err(IngestError::configuration(
                "record_channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.reconnect_backoff_base.is_zero() {
            return Err(IngestError::configuration(
                "reconnect_backoff_base_ms",
                "must be greater than 0",
            ));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_base {
            return Err(IngestError::configuration(
                "reconnect_backoff_max_ms",
                "must be greater than or equal to reconnect_backoff_base_ms",
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(IngestError::configuration(
                "max_payload_bytes",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// `attempt`번째 재연결(0부터)의 백오프 간격을 계산합니다.
    ///
    /// 시작 간격에서 매번 두 배씩 늘어나며 최대 간격을 넘지 않습니다.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.reconnect_backoff_base
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max)
    }
}

/// 브로커 엔드포인트 (`mqtt://host[:port]` 또는 `tcp://host[:port]`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// 스킴 (mqtt, tcp)
    pub scheme: String,
    /// 호스트
    pub host: String,
    /// 포트
    pub port: u16,
}

impl Endpoint {
    /// 엔드포인트 문자열을 파싱합니다.
    pub fn parse(s: &str) -> Result<Self, IngestError> {
        let invalid = |reason: &str| IngestError::configuration("endpoint", format!("'{s}': {reason}"));

        let (scheme, rest) = s
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme (expected mqtt:// or tcp://)"))?;
        if scheme != "mqtt" && scheme != "tcp" {
            return Err(invalid("unsupported scheme (expected mqtt or tcp)"));
        }
        let authority = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6: [::1]:1883
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '[' in host"))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(invalid("unexpected characters after host")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid("invalid host"));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("invalid port"))?,
            None => DEFAULT_MQTT_PORT,
        };

        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// 브로커 자격 증명
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// 사용자명
    pub username: String,
    /// 비밀번호
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 디바이스 등록
///
/// 세션이 활성화된 동안에는 변경되지 않으며, 재설정 시 통째로 교체됩니다.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRegistration {
    /// 디바이스(box) ID
    pub id: String,
    /// 브로커 엔드포인트
    pub endpoint: Endpoint,
    /// 구독 토픽
    pub topic: String,
    /// 디코더 설정
    pub decoder: DecoderConfig,
    /// 브로커 자격 증명
    pub credentials: Option<Credentials>,
    /// 이상치 필터 설정. `None`이면 필터를 적용하지 않습니다.
    pub outlier: Option<OutlierSettings>,
}

impl DeviceRegistration {
    /// 필수 항목으로 등록을 생성합니다. 이상치 필터는 기본 설정으로 켜집니다.
    pub fn new(
        id: impl Into<String>,
        endpoint: &str,
        topic: impl Into<String>,
        decoder: DecoderConfig,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            id: id.into(),
            endpoint: Endpoint::parse(endpoint)?,
            topic: topic.into(),
            decoder,
            credentials: None,
            outlier: Some(OutlierSettings::default()),
        })
    }

    /// 자격 증명을 설정합니다.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// 이상치 필터 설정을 지정합니다. `None`이면 필터를 끕니다.
    pub fn with_outlier(mut self, outlier: Option<OutlierSettings>) -> Self {
        self.outlier = outlier;
        self
    }

    /// core의 `DeviceConfig`에서 등록을 생성합니다.
    ///
    /// 디바이스별 이상치 설정이 없는 항목은 `[ingest]` 기본값을 사용합니다.
    pub fn from_core(device: &DeviceConfig, ingest: &IngestConfig) -> Result<Self, IngestError> {
        let decoder = DecoderConfig::from_core(&device.decoder).map_err(|e| match e {
            IngestError::Configuration { field, reason } => IngestError::Configuration {
                field: format!("devices.{}.{}", device.id, field),
                reason,
            },
            other => other,
        })?;

        let overrides = device.outlier.clone().unwrap_or_default();
        let enabled = overrides.enabled.unwrap_or(ingest.outlier_enabled);
        let outlier = enabled.then(|| OutlierSettings {
            window_size: overrides.window_size.unwrap_or(ingest.outlier_window_size),
            replace_on_detect: overrides
                .replace_on_detect
                .unwrap_or(ingest.outlier_replace_on_detect),
        });

        let credentials = device.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: device.password.clone().unwrap_or_default(),
        });

        let registration = Self {
            id: device.id.clone(),
            endpoint: Endpoint::parse(&device.endpoint)?,
            topic: device.topic.clone(),
            decoder,
            credentials,
            outlier,
        };
        registration.validate()?;
        Ok(registration)
    }

    /// 등록의 유효성을 검증합니다. 실패하면 세션을 시작하지 않습니다.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.id.trim().is_empty() {
            return Err(IngestError::configuration("id", "must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(IngestError::configuration(
                format!("devices.{}.topic", self.id),
                "must not be empty",
            ));
        }
        if !rumqttc::valid_filter(&self.topic) {
            return Err(IngestError::configuration(
                format!("devices.{}.topic", self.id),
                format!("'{}' is not a valid MQTT topic filter", self.topic),
            ));
        }
        if let Some(outlier) = &self.outlier {
            if outlier.window_size == 0 || outlier.window_size > MAX_OUTLIER_WINDOW_SIZE {
                return Err(IngestError::configuration(
                    format!("devices.{}.outlier.window_size", self.id),
                    format!("must be 1-{MAX_OUTLIER_WINDOW_SIZE}"),
                ));
            }
        }
        match &self.decoder {
            DecoderConfig::Json(json) => {
                if let Some(path) = &json.path {
                    JsonPath::parse(path)?;
                }
            }
            DecoderConfig::BinaryMask(mask) => {
                if mask.mask_fields.is_empty() {
                    return Err(IngestError::configuration(
                        format!("devices.{}.decoder.mask_fields", self.id),
                        "must not be empty",
                    ));
                }
            }
            DecoderConfig::Csv | DecoderConfig::PlainDebug => {}
        }
        Ok(())
    }

    /// MQTT 클라이언트 ID를 반환합니다.
    pub fn client_id(&self) -> String {
        format!("senseflow-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::JsonConfig;
    use senseflow_core::config::{DecoderSection, OutlierSection};

    fn core_device(kind: &str) -> DeviceConfig {
        DeviceConfig {
            id: "box-a".to_owned(),
            endpoint: "mqtt://broker.local".to_owned(),
            topic: "boxes/a".to_owned(),
            username: None,
            password: None,
            decoder: DecoderSection {
                kind: kind.to_owned(),
                ..Default::default()
            },
            outlier: None,
        }
    }

    #[test]
    fn settings_from_core() {
        let core = IngestConfig::default();
        let settings = IngestSettings::from_core(&core);
        assert_eq!(settings.reconnect_backoff_base, Duration::from_millis(500));
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.max_payload_bytes, 256 * 1024);
        settings.validate().unwrap();
    }

    #[test]
    fn settings_validate_rejects_inverted_backoff() {
        let settings = IngestSettings {
            reconnect_backoff_base: Duration::from_secs(10),
            reconnect_backoff_max: Duration::from_secs(1),
            ..IngestSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let settings = IngestSettings {
            reconnect_backoff_base: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_millis(1000),
            ..IngestSettings::default()
        };
        assert_eq!(settings.backoff_for(0), Duration::from_millis(100));
        assert_eq!(settings.backoff_for(1), Duration::from_millis(200));
        assert_eq!(settings.backoff_for(3), Duration::from_millis(800));
        assert_eq!(settings.backoff_for(4), Duration::from_millis(1000));
        assert_eq!(settings.backoff_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn endpoint_parse_forms() {
        let e = Endpoint::parse("mqtt://broker.local").unwrap();
        assert_eq!(e.host, "broker.local");
        assert_eq!(e.port, DEFAULT_MQTT_PORT);

        let e = Endpoint::parse("tcp://10.0.0.5:1884/").unwrap();
        assert_eq!(e.scheme, "tcp");
        assert_eq!(e.host, "10.0.0.5");
        assert_eq!(e.port, 1884);

        let e = Endpoint::parse("mqtt://[::1]:1885").unwrap();
        assert_eq!(e.host, "::1");
        assert_eq!(e.port, 1885);
        assert_eq!(e.to_string(), "mqtt://[::1]:1885");
    }

    #[test]
    fn endpoint_parse_rejects_invalid() {
        for bad in [
            "broker.local",
            "http://broker.local",
            "mqtt://",
            "mqtt://host:0",
            "mqtt://host:99999",
            "mqtt://host:abc",
            "mqtt://[::1",
            "mqtt://host/path/x",
        ] {
            assert!(Endpoint::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let c = Credentials {
            username: "box".to_owned(),
            password: "secret".to_owned(),
        };
        let dbg = format!("{c:?}");
        assert!(dbg.contains("box"));
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn from_core_applies_ingest_defaults() {
        let ingest = IngestConfig::default();
        let reg = DeviceRegistration::from_core(&core_device("csv"), &ingest).unwrap();
        assert_eq!(reg.client_id(), "senseflow-box-a");
        assert_eq!(reg.decoder, DecoderConfig::Csv);
        assert_eq!(
            reg.outlier,
            Some(OutlierSettings {
                window_size: ingest.outlier_window_size,
                replace_on_detect: ingest.outlier_replace_on_detect,
            })
        );
        assert!(reg.credentials.is_none());
    }

    #[test]
    fn from_core_applies_device_overrides() {
        let mut device = core_device("json");
        device.username = Some("box-a".to_owned());
        device.password = Some("pw".to_owned());
        device.outlier = Some(OutlierSection {
            enabled: None,
            window_size: Some(5),
            replace_on_detect: Some(true),
        });
        let reg = DeviceRegistration::from_core(&device, &IngestConfig::default()).unwrap();
        assert_eq!(
            reg.outlier,
            Some(OutlierSettings {
                window_size: 5,
                replace_on_detect: true,
            })
        );
        assert_eq!(reg.credentials.unwrap().password, "pw");
    }

    #[test]
    fn from_core_disables_filter() {
        let mut device = core_device("csv");
        device.outlier = Some(OutlierSection {
            enabled: Some(false),
            ..Default::default()
        });
        let reg = DeviceRegistration::from_core(&device, &IngestConfig::default()).unwrap();
        assert!(reg.outlier.is_none());
    }

    #[test]
    fn from_core_reports_decoder_field_with_device_prefix() {
        let mut device = core_device("json");
        device.decoder.path = Some("$[".to_owned());
        let err = DeviceRegistration::from_core(&device, &IngestConfig::default()).unwrap_err();
        match err {
            IngestError::Configuration { field, .. } => {
                assert_eq!(field, "devices.box-a.decoder.path");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_rejects_bad_registrations() {
        let base = DeviceRegistration::new(
            "box-a",
            "mqtt://localhost",
            "boxes/a",
            DecoderConfig::Json(JsonConfig::default()),
        )
        .unwrap();
        base.validate().unwrap();

        let mut r = base.clone();
        r.id = " ".to_owned();
        assert!(r.validate().is_err());

        let mut r = base.clone();
        r.topic = String::new();
        assert!(r.validate().is_err());

        let r = base.clone().with_outlier(Some(OutlierSettings {
            window_size: 0,
            replace_on_detect: false,
        }));
        assert!(r.validate().is_err());

        let mut r = base;
        r.decoder = DecoderConfig::Json(JsonConfig {
            path: Some("$.a[".to_owned()),
        });
        assert!(r.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_topic_filters() {
        let base = DeviceRegistration::new("box-a", "mqtt://localhost", "boxes/a", DecoderConfig::Csv)
            .unwrap();
        for bad in ["a/#/b", "boxes/a#", "boxes/++", "sport/tennis+/x"] {
            let mut r = base.clone();
            r.topic = bad.to_owned();
            match r.validate() {
                Err(IngestError::Configuration { field, .. }) => {
                    assert_eq!(field, "devices.box-a.topic");
                }
                other => panic!("{bad} should be rejected, got {other:?}"),
            }
        }
        for good in ["boxes/+/data", "boxes/#", "#", "boxes/a/up"] {
            let mut r = base.clone();
            r.topic = good.to_owned();
            assert!(r.validate().is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn validate_rejects_oversized_outlier_window() {
        let base = DeviceRegistration::new("box-a", "mqtt://localhost", "boxes/a", DecoderConfig::Csv)
            .unwrap();
        let r = base.clone().with_outlier(Some(OutlierSettings {
            window_size: MAX_OUTLIER_WINDOW_SIZE,
            replace_on_detect: false,
        }));
        assert!(r.validate().is_ok());

        let r = base.with_outlier(Some(OutlierSettings {
            window_size: 9_000_000_000_000_000_000,
            replace_on_detect: false,
        }));
        match r.validate() {
            Err(IngestError::Configuration { field, .. }) => {
                assert_eq!(field, "devices.box-a.outlier.window_size");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn from_core_rejects_oversized_device_window() {
        let mut device = core_device("csv");
        device.outlier = Some(OutlierSection {
            enabled: None,
            window_size: Some(9_000_000_000_000_000_000),
            replace_on_detect: None,
        });
        assert!(DeviceRegistration::from_core(&device, &IngestConfig::default()).is_err());
    }
}
