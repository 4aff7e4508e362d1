//! 바이너리 마스크(LoRa) 페이로드 디코더
//!
//! 처리 순서:
//! 1. [`decode_mask`]로 고정 폭 필드를 수치 값으로 변환
//! 2. 센서별 스케일링 ([`ScalingKind`])
//! 3. mod/times 합성 필드 복원 (`times * 255 + mod`, 원본 두 필드는 제거)
//!
//! 어느 단계에서든 실패하면 원시 바이트를 담은 [`RawFallback`]을 돌려줍니다.
//! [`PayloadDecoder::decode`]는 fallback을 로그로 남기고 `None`을 반환합니다.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use senseflow_core::config::DecoderSection;
use senseflow_core::metrics as m;
use tracing::{debug, warn};

use super::{DecoderConfig, DecoderKind, PayloadDecoder, Reading, ReadingSet};
use crate::codec::{Converter, FieldDescriptor, MAX_FIELD_WIDTH, decode_mask};
use crate::error::IngestError;

/// 사전 정의 프로파일 이름: senseBox:home LoRa 프레임
pub const PRESET_SENSEBOX_HOME: &str = "sensebox-home";

/// 합성 필드의 times 가중치
const COMPOSITE_BASE: f64 = 255.0;

/// 센서별 스케일링 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingKind {
    /// `raw / 771 - 18`, 소수 첫째 자리 반올림
    Temperature,
    /// 소수 첫째 자리 반올림
    Humidity,
    /// `raw / 81.9187 + 300`, 소수 둘째 자리 반올림. raw가 0이면 필드를 버림
    Pressure,
}

impl ScalingKind {
    /// 스케일링 이름을 반환합니다.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
        }
    }

    /// 스케일링을 적용합니다. `None`이면 해당 필드를 버립니다.
    pub fn apply(&self, raw: f64) -> Option<f64> {
        match self {
            Self::Temperature => Some(round_to(raw / 771.0 - 18.0, 1)),
            Self::Humidity => Some(round_to(raw, 1)),
            Self::Pressure => {
                if raw == 0.0 {
                    None
                } else {
                    Some(round_to(raw / 81.9187 + 300.0, 2))
                }
            }
        }
    }
}

impl FromStr for ScalingKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "pressure" => Ok(Self::Pressure),
            other => Err(IngestError::configuration(
                "decoder.scaling",
                format!("unknown scaling '{other}' (expected temperature, humidity, pressure)"),
            )),
        }
    }
}

/// mod/times 합성 필드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeField {
    /// 나머지 필드 라벨
    pub mod_field: String,
    /// 몫 필드 라벨
    pub times_field: String,
    /// 결과 라벨
    pub output: String,
}

impl CompositeField {
    /// 새 합성 필드를 생성합니다.
    pub fn new(
        mod_field: impl Into<String>,
        times_field: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            mod_field: mod_field.into(),
            times_field: times_field.into(),
            output: output.into(),
        }
    }
}

/// 바이너리 마스크 디코더 설정
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryMaskConfig {
    /// 마스크 필드 (왼쪽부터 순서대로 소비)
    pub mask_fields: Vec<FieldDescriptor>,
    /// 라벨 → 스케일링
    pub scaling: BTreeMap<String, ScalingKind>,
    /// 합성 필드 목록
    pub composites: Vec<CompositeField>,
}

impl BinaryMaskConfig {
    /// senseBox:home LoRa 프레임 프로파일
    ///
    /// | 필드 | 폭 | 변환 |
    /// |---|---|---|
    /// | temperature | 2 | uint16 → temperature |
    /// | humidity | 2 | humidity → humidity |
    /// | pressure | 2 | uint16 → pressure |
    /// | lux_mod / lux_times | 1 / 2 | uint8 / uint16 → lux |
    /// | uv_mod / uv_times | 1 / 2 | uint8 / uint16 → uv |
    pub fn sensebox_home() -> Self {
        let mask_fields = vec![
            FieldDescriptor::labeled(Converter::Uint16, "temperature"),
            FieldDescriptor::labeled(Converter::Humidity, "humidity"),
            FieldDescriptor::labeled(Converter::Uint16, "pressure"),
            FieldDescriptor::labeled(Converter::Uint8, "lux_mod"),
            FieldDescriptor::labeled(Converter::Uint16, "lux_times"),
            FieldDescriptor::labeled(Converter::Uint8, "uv_mod"),
            FieldDescriptor::labeled(Converter::Uint16, "uv_times"),
        ];
        let scaling = BTreeMap::from([
            ("temperature".to_owned(), ScalingKind::Temperature),
            ("humidity".to_owned(), ScalingKind::Humidity),
            ("pressure".to_owned(), ScalingKind::Pressure),
        ]);
        let composites = vec![
            CompositeField::new("lux_mod", "lux_times", "lux"),
            CompositeField::new("uv_mod", "uv_times", "uv"),
        ];
        Self {
            mask_fields,
            scaling,
            composites,
        }
    }

    /// core 설정 섹션에서 마스크 설정을 생성합니다.
    ///
    /// 필드 폭과 변환기 폭의 불일치는 여기서 거부하지 않습니다.
    /// 해당 프레임은 디코딩 시점에 [`RawFallback`]이 됩니다.
    pub fn from_core(section: &DecoderSection) -> Result<Self, IngestError> {
        if let Some(preset) = &section.preset {
            if !section.mask_fields.is_empty() {
                return Err(IngestError::configuration(
                    "decoder.preset",
                    "preset and mask_fields are mutually exclusive",
                ));
            }
            return match preset.as_str() {
                PRESET_SENSEBOX_HOME => Ok(Self::sensebox_home()),
                other => Err(IngestError::configuration(
                    "decoder.preset",
                    format!("unknown preset '{other}'"),
                )),
            };
        }

        if section.mask_fields.is_empty() {
            return Err(IngestError::configuration(
                "decoder.mask_fields",
                "binary-mask decoder requires mask_fields or a preset",
            ));
        }

        let mut mask_fields = Vec::with_capacity(section.mask_fields.len());
        for field in &section.mask_fields {
            if field.width_bytes == 0 || field.width_bytes > MAX_FIELD_WIDTH {
                return Err(IngestError::configuration(
                    "decoder.mask_fields.width_bytes",
                    format!("must be 1-{MAX_FIELD_WIDTH}"),
                ));
            }
            mask_fields.push(FieldDescriptor {
                width_bytes: field.width_bytes,
                converter: field.converter.parse()?,
                label: field.label.clone(),
            });
        }

        let labels: Vec<String> = mask_fields
            .iter()
            .enumerate()
            .map(|(idx, f)| f.label.clone().unwrap_or_else(|| idx.to_string()))
            .collect();
        let mut unique = HashSet::new();
        for label in &labels {
            if !unique.insert(label.as_str()) {
                return Err(IngestError::configuration(
                    "decoder.mask_fields.label",
                    format!("duplicate label '{label}'"),
                ));
            }
        }

        let mut scaling = BTreeMap::new();
        for (label, kind) in &section.scaling {
            if !unique.contains(label.as_str()) {
                return Err(IngestError::configuration(
                    "decoder.scaling",
                    format!("scaling refers to unknown field '{label}'"),
                ));
            }
            scaling.insert(label.clone(), kind.parse::<ScalingKind>()?);
        }

        let mut composites = Vec::with_capacity(section.composites.len());
        for composite in &section.composites {
            for source in [&composite.mod_field, &composite.times_field] {
                if !unique.contains(source.as_str()) {
                    return Err(IngestError::configuration(
                        "decoder.composites",
                        format!("composite refers to unknown field '{source}'"),
                    ));
                }
            }
            if composite.mod_field == composite.times_field {
                return Err(IngestError::configuration(
                    "decoder.composites",
                    "mod_field and times_field must differ",
                ));
            }
            composites.push(CompositeField::new(
                composite.mod_field.clone(),
                composite.times_field.clone(),
                composite.output.clone(),
            ));
        }

        Ok(Self {
            mask_fields,
            scaling,
            composites,
        })
    }
}

/// 디코딩 실패 시 원시 바이트와 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFallback {
    /// 원시 페이로드
    pub raw: Bytes,
    /// 실패 사유
    pub reason: String,
}

impl RawFallback {
    fn new(raw: &[u8], reason: impl Into<String>) -> Self {
        Self {
            raw: Bytes::copy_from_slice(raw),
            reason: reason.into(),
        }
    }

    /// 원시 페이로드의 16진수 표현을 반환합니다.
    pub fn hex(&self) -> String {
        self.raw.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for RawFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (raw: {})", self.reason, self.hex())
    }
}

/// 바이너리 마스크 디코더
#[derive(Debug, Default)]
pub struct BinaryMaskDecoder;

impl BinaryMaskDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self
    }

    /// 프레임을 디코딩합니다. 실패하면 원시 바이트를 담은 fallback을 반환합니다.
    pub fn decode_frame(
        &self,
        payload: &[u8],
        config: &BinaryMaskConfig,
    ) -> Result<ReadingSet, RawFallback> {
        let values =
            decode_mask(payload, &config.mask_fields).map_err(|e| RawFallback::new(payload, e.to_string()))?;

        let mut scaled: BTreeMap<String, f64> = BTreeMap::new();
        for (label, raw) in values.fields {
            match config.scaling.get(&label) {
                Some(kind) => {
                    if let Some(v) = kind.apply(raw) {
                        scaled.insert(label, v);
                    } else {
                        debug!(field = %label, scaling = kind.name(), "scaled field dropped");
                    }
                }
                None => {
                    scaled.insert(label, raw);
                }
            }
        }

        for composite in &config.composites {
            let modulo = scaled.remove(&composite.mod_field);
            let times = scaled.remove(&composite.times_field);
            match (modulo, times) {
                (Some(md), Some(tm)) => {
                    scaled.insert(composite.output.clone(), tm * COMPOSITE_BASE + md);
                }
                _ => {
                    return Err(RawFallback::new(
                        payload,
                        format!(
                            "composite '{}' is missing source '{}' or '{}'",
                            composite.output, composite.mod_field, composite.times_field
                        ),
                    ));
                }
            }
        }

        if scaled.is_empty() {
            return Err(RawFallback::new(payload, "frame produced no readings"));
        }

        Ok(scaled
            .into_iter()
            .map(|(label, v)| (label, Reading::number(v)))
            .collect())
    }
}

impl PayloadDecoder for BinaryMaskDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::BinaryMask
    }

    fn decode(&self, payload: &[u8], config: &DecoderConfig) -> Option<ReadingSet> {
        let DecoderConfig::BinaryMask(mask) = config else {
            debug!(expected = "binary-mask", got = %config.kind(), "decoder config mismatch");
            return None;
        };

        match self.decode_frame(payload, mask) {
            Ok(readings) => Some(readings),
            Err(fallback) => {
                metrics::counter!(m::INGEST_RAW_FALLBACKS_TOTAL).increment(1);
                warn!(
                    reason = %fallback.reason,
                    raw = %fallback.hex(),
                    "binary frame could not be decoded, keeping raw payload"
                );
                None
            }
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
