//! 도메인 타입: 시스템 전역에서 사용되는 공통 타입
//!
//! 수집 파이프라인의 최종 산출물인 [`Measurement`]를 정의합니다.
//! 파이프라인은 레코드를 downstream(저장소 등)에 넘긴 뒤 더 이상 소유하지 않습니다.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// 정규화된 측정값 레코드
///
/// 외부 인터페이스 형식(camelCase JSON):
/// `{ "boxId", "sensorId", "value", "timestamp", "outlier"?, "substituted"?, "reportedAt"? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// 측정값을 보낸 디바이스(box) ID
    pub box_id: String,
    /// 센서 ID
    pub sensor_id: String,
    /// 필터 적용 후 수치 값
    pub value: f64,
    /// 수신 시각 (ISO-8601)
    pub timestamp: DateTime<Utc>,
    /// 이상치 플래그. 플래그 모드에서 이상치로 판정된 경우에만 존재
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier: Option<bool>,
    /// 대체 표시. 대체 모드에서 이상치 값을 윈도우 평균으로 바꿔 내보낸 경우에만 `Some(true)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted: Option<bool>,
    /// 페이로드에 포함된 디바이스 측 타임스탬프 (원문 그대로)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<String>,
}

impl Measurement {
    /// 이상치 플래그 없이 새 레코드를 생성합니다.
    pub fn new(
        box_id: impl Into<String>,
        sensor_id: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            box_id: box_id.into(),
            sensor_id: sensor_id.into(),
            value,
            timestamp,
            outlier: None,
            substituted: None,
            reported_at: None,
        }
    }

    /// 이상치 플래그가 설정되어 있는지 확인합니다.
    pub fn is_flagged(&self) -> bool {
        self.outlier == Some(true)
    }

    /// 값이 이상치 대체값인지 확인합니다.
    pub fn is_substituted(&self) -> bool {
        self.substituted == Some(true)
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}={} @{}",
            self.box_id,
            self.sensor_id,
            self.value,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        if self.is_flagged() {
            write!(f, " [outlier]")?;
        }
        if self.is_substituted() {
            write!(f, " [substituted]")?;
        }
        Ok(())
    }
}
