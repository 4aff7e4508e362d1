//! 바이너리 마스크 코덱
//!
//! 필드 디스크립터 목록(마스크)에 따라 바이트 버퍼를 왼쪽부터 순서대로 잘라
//! 각 조각을 변환기로 수치 값으로 바꿉니다.
//!
//! # 규칙
//! - 버퍼 길이가 마스크 전체 폭보다 짧으면 어떤 변환도 수행하기 전에
//!   [`IngestError::CodecLengthMismatch`]를 반환합니다 (부분 결과 없음).
//! - 정수는 little-endian으로 조립합니다: i번째 바이트가 비트 `[8i, 8i+8)`를 차지하며
//!   부호 확장은 하지 않습니다.
//! - 필드 사이에 겹침이나 간격은 없습니다. 마스크 폭을 넘는 trailing 바이트는 무시하고,
//!   실제로 소비한 폭을 [`MaskValues::consumed`]로 보고합니다.
//!
//! mod/times 합성 필드 복원은 코덱의 책임이 아니며 바이너리 디코더에서 처리합니다.

use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// 필드 변환기
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    /// 1바이트 부호 없는 정수
    Uint8,
    /// 2바이트 부호 없는 정수 (little-endian)
    Uint16,
    /// 2바이트 정수를 100으로 나눈 값
    Humidity,
}

impl Converter {
    /// 변환기 이름을 반환합니다.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Humidity => "humidity",
        }
    }

    /// 변환기가 요구하는 슬라이스 폭(바이트)을 반환합니다.
    pub fn width(&self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Uint16 | Self::Humidity => 2,
        }
    }

    /// 슬라이스를 수치 값으로 변환합니다.
    ///
    /// 슬라이스 길이가 변환기 폭과 다르면 [`IngestError::CodecWidthMismatch`]를 반환합니다.
    pub fn convert(&self, bytes: &[u8]) -> Result<f64, IngestError> {
        if bytes.len() != self.width() {
            return Err(IngestError::CodecWidthMismatch {
                converter: self.name().to_owned(),
                expected: self.width(),
                actual: bytes.len(),
            });
        }

        let raw = assemble_le(bytes);
        let value = match self {
            Self::Uint8 | Self::Uint16 => raw as f64,
            Self::Humidity => raw as f64 / 100.0,
        };
        Ok(value)
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Converter {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(Self::Uint8),
            "uint16" => Ok(Self::Uint16),
            "humidity" => Ok(Self::Humidity),
            other => Err(IngestError::configuration(
                "decoder.mask_fields.converter",
                format!("unknown converter '{other}' (expected uint8, uint16, humidity)"),
            )),
        }
    }
}

/// 마스크의 필드 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// 필드 폭 (바이트)
    pub width_bytes: usize,
    /// 변환기
    pub converter: Converter,
    /// 출력 라벨. 없으면 위치 인덱스("0", "1", ...)를 사용합니다.
    pub label: Option<String>,
}

impl FieldDescriptor {
    /// 변환기 폭과 같은 폭의 라벨 필드를 생성합니다.
    pub fn labeled(converter: Converter, label: impl Into<String>) -> Self {
        Self {
            width_bytes: converter.width(),
            converter,
            label: Some(label.into()),
        }
    }

    /// 변환기 폭과 같은 폭의 라벨 없는 필드를 생성합니다.
    pub fn unlabeled(converter: Converter) -> Self {
        Self {
            width_bytes: converter.width(),
            converter,
            label: None,
        }
    }
}

/// 마스크 디코딩 결과
#[derive(Debug, Clone, PartialEq)]
pub struct MaskValues {
    /// (라벨, 값) 목록. 마스크 순서를 유지합니다.
    pub fields: Vec<(String, f64)>,
    /// 소비한 바이트 수 (= 마스크 전체 폭)
    pub consumed: usize,
}

impl MaskValues {
    /// 라벨로 값을 조회합니다.
    pub fn get(&self, label: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| *v)
    }
}

/// 필드 하나가 가질 수 있는 최대 폭 (u64로 조립 가능한 범위)
pub const MAX_FIELD_WIDTH: usize = 8;

/// 마스크 전체 폭(필드 폭의 합)을 반환합니다. 합이 `usize`를 넘으면 `None`.
pub fn mask_width(fields: &[FieldDescriptor]) -> Option<usize> {
    fields
        .iter()
        .try_fold(0usize, |acc, f| acc.checked_add(f.width_bytes))
}

/// 바이트 버퍼를 마스크에 따라 디코딩합니다.
pub fn decode_mask(bytes: &[u8], fields: &[FieldDescriptor]) -> Result<MaskValues, IngestError> {
    // 폭 합이 넘치면 어떤 버퍼도 충분히 길 수 없음
    let expected = mask_width(fields).unwrap_or(usize::MAX);
    if bytes.len() < expected {
        return Err(IngestError::CodecLengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let mut values = Vec::with_capacity(fields.len());
    let mut offset = 0;
    for (idx, field) in fields.iter().enumerate() {
        let end = offset + field.width_bytes;
        let value = field.converter.convert(&bytes[offset..end])?;
        let label = field.label.clone().unwrap_or_else(|| idx.to_string());
        values.push((label, value));
        offset = end;
    }

    Ok(MaskValues {
        fields: values,
        consumed: offset,
    })
}

/// little-endian 바이트를 부호 없는 정수로 조립합니다.
///
/// 호출자는 슬라이스 길이가 8 이하임을 보장해야 합니다.
fn assemble_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}
