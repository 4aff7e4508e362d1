//! 페이로드 디코더 모듈 -- 형식별 디코더와 전역 레지스트리
//!
//! 각 디코더는 [`PayloadDecoder`] trait을 구현하며, 원시 바이트를
//! 센서 ID → 판독값 맵([`ReadingSet`])으로 변환합니다.
//! 디코더는 어떤 입력에도 panic하거나 에러를 밖으로 던지지 않고,
//! 쓸 수 있는 데이터가 없으면 `None`을 반환합니다.
//!
//! # 지원 형식
//! - JSON ([`JsonDecoder`]): 경로 식으로 노드를 선택한 뒤 정규화
//! - 구분자 텍스트 ([`CsvDecoder`]): `sensorId,value[,timestamp]` 줄 단위
//! - 바이너리 마스크 ([`BinaryMaskDecoder`]): LoRa 스타일 고정 폭 프레임
//! - plain-debug ([`PlainDebugDecoder`]): 진단용 `id=value` 텍스트
//!
//! # 사용 예시
//! ```ignore
//! use senseflow_ingest::decoder::{DecoderConfig, DecoderKind, DecoderRegistry};
//!
//! let decoder = DecoderRegistry::global().get(DecoderKind::Csv).unwrap();
//! let readings = decoder.decode(b"42,3.14", &DecoderConfig::Csv);
//! ```

pub mod binary;
pub mod csv;
pub mod json;
pub mod plain;

pub use binary::{BinaryMaskConfig, BinaryMaskDecoder, CompositeField, RawFallback, ScalingKind};
pub use csv::CsvDecoder;
pub use json::{JsonConfig, JsonDecoder, JsonPath};
pub use plain::PlainDebugDecoder;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use senseflow_core::config::DecoderSection;

use crate::error::IngestError;

/// 디코딩된 원시 값
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// 텍스트 값 (수치 변환은 세션에서 수행)
    Text(String),
    /// 수치 값
    Number(f64),
}

impl RawValue {
    /// 유한한 `f64`로 변환합니다. 숫자가 아니거나 NaN/무한대이면 `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        v.is_finite().then_some(v)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// 센서 하나의 판독값
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// 값
    pub value: RawValue,
    /// 페이로드에 포함된 디바이스 측 타임스탬프 (원문)
    pub timestamp: Option<String>,
}

impl Reading {
    /// 타임스탬프 없는 텍스트 판독값을 생성합니다.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: RawValue::Text(value.into()),
            timestamp: None,
        }
    }

    /// 타임스탬프 없는 수치 판독값을 생성합니다.
    pub fn number(value: f64) -> Self {
        Self {
            value: RawValue::Number(value),
            timestamp: None,
        }
    }

    /// 타임스탬프를 설정합니다.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// 디코딩 결과: 센서 ID → 판독값 (디코딩 한 번에 키당 값 하나)
pub type ReadingSet = BTreeMap<String, Reading>;

/// 디코더 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DecoderKind {
    /// JSON
    Json,
    /// 구분자 텍스트 (CSV)
    Csv,
    /// 바이너리 마스크 (LoRa)
    BinaryMask,
    /// 진단용 plain 텍스트
    PlainDebug,
}

impl DecoderKind {
    /// 형식 이름을 반환합니다.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::BinaryMask => "binary-mask",
            Self::PlainDebug => "plain-debug",
        }
    }

    /// 이 형식의 레코드가 이상치 필터를 건너뛰는지 여부
    pub fn bypasses_filter(&self) -> bool {
        matches!(self, Self::PlainDebug)
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecoderKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "csv" | "delimited-text" => Ok(Self::Csv),
            "binary-mask" => Ok(Self::BinaryMask),
            "plain-debug" => Ok(Self::PlainDebug),
            other => Err(IngestError::configuration(
                "decoder.kind",
                format!("unsupported decoder '{other}'"),
            )),
        }
    }
}

/// 디코더별 설정
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderConfig {
    /// JSON 경로 설정
    Json(JsonConfig),
    /// 구분자 텍스트 (추가 설정 없음)
    Csv,
    /// 바이너리 마스크 설정
    BinaryMask(BinaryMaskConfig),
    /// plain-debug (추가 설정 없음)
    PlainDebug,
}

impl DecoderConfig {
    /// 설정이 가리키는 디코더 형식을 반환합니다.
    pub fn kind(&self) -> DecoderKind {
        match self {
            Self::Json(_) => DecoderKind::Json,
            Self::Csv => DecoderKind::Csv,
            Self::BinaryMask(_) => DecoderKind::BinaryMask,
            Self::PlainDebug => DecoderKind::PlainDebug,
        }
    }

    /// core 설정의 `[devices.decoder]` 섹션에서 디코더 설정을 생성합니다.
    ///
    /// 경로 식 문법, 변환기 이름, 스케일링 종류, 합성 필드 참조를 검증합니다.
    pub fn from_core(section: &DecoderSection) -> Result<Self, IngestError> {
        let kind: DecoderKind = section.kind.parse()?;
        match kind {
            DecoderKind::Json => {
                if let Some(path) = &section.path {
                    JsonPath::parse(path)?;
                }
                Ok(Self::Json(JsonConfig {
                    path: section.path.clone(),
                }))
            }
            DecoderKind::Csv => Ok(Self::Csv),
            DecoderKind::BinaryMask => Ok(Self::BinaryMask(BinaryMaskConfig::from_core(section)?)),
            DecoderKind::PlainDebug => Ok(Self::PlainDebug),
        }
    }
}

/// 페이로드 디코더 trait
///
/// `None`은 "수집할 것이 없음"(빈 페이로드, 해석 불가)을 뜻합니다.
/// 구현체는 어떤 입력에도 panic하지 않아야 합니다.
pub trait PayloadDecoder: Send + Sync {
    /// 디코더 형식을 반환합니다.
    fn kind(&self) -> DecoderKind;

    /// 페이로드를 디코딩합니다.
    fn decode(&self, payload: &[u8], config: &DecoderConfig) -> Option<ReadingSet>;
}

/// 형식 → 디코더 레지스트리
///
/// 프로세스 전역 인스턴스([`DecoderRegistry::global`])는 처음 사용할 때 한 번 만들어지고
/// 이후에는 읽기 전용입니다.
pub struct DecoderRegistry {
    decoders: BTreeMap<DecoderKind, Box<dyn PayloadDecoder>>,
}

static REGISTRY: OnceLock<DecoderRegistry> = OnceLock::new();

impl DecoderRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// 기본 디코더 4종으로 레지스트리를 생성합니다.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(Box::new(JsonDecoder::new()))
            .register(Box::new(CsvDecoder::new()))
            .register(Box::new(BinaryMaskDecoder::new()))
            .register(Box::new(PlainDebugDecoder::new()))
    }

    /// 프로세스 전역 레지스트리를 반환합니다.
    pub fn global() -> &'static DecoderRegistry {
        REGISTRY.get_or_init(Self::with_defaults)
    }

    /// 디코더를 등록합니다. 같은 형식이 이미 있으면 교체합니다.
    pub fn register(mut self, decoder: Box<dyn PayloadDecoder>) -> Self {
        self.decoders.insert(decoder.kind(), decoder);
        self
    }

    /// 형식에 해당하는 디코더를 조회합니다.
    pub fn get(&self, kind: DecoderKind) -> Option<&dyn PayloadDecoder> {
        self.decoders.get(&kind).map(|d| d.as_ref())
    }

    /// 등록된 형식 목록을 반환합니다.
    pub fn kinds(&self) -> Vec<DecoderKind> {
        self.decoders.keys().copied().collect()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
