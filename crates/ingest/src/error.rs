//! 수집 파이프라인 에러 타입
//!
//! [`IngestError`]는 수집 파이프라인 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<IngestError> for SenseflowError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.
//!
//! 페이로드 단위의 에러(디코딩, 코덱)는 세션 안에서 로그로 남기고 버려지며,
//! 세션 밖으로 전파되는 것은 설정 에러뿐입니다.

use senseflow_core::error::{ConfigError, PipelineError, SenseflowError};

/// 수집 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 전송 계층 에러 (연결 실패, 연결 끊김, 구독 실패)
    #[error("transport error: {endpoint}: {reason}")]
    Transport {
        /// 브로커 엔드포인트
        endpoint: String,
        /// 에러 사유
        reason: String,
    },

    /// 페이로드 디코딩 실패
    #[error("decode error: {format}: {reason}")]
    Decode {
        /// 디코더 형식 (json, csv, binary-mask 등)
        format: String,
        /// 실패 사유
        reason: String,
    },

    /// 바이너리 마스크 길이 불일치 (버퍼가 필드 폭 합보다 짧음)
    #[error("mask length mismatch: expected at least {expected} bytes, got {actual}")]
    CodecLengthMismatch {
        /// 마스크 전체 폭
        expected: usize,
        /// 실제 버퍼 길이
        actual: usize,
    },

    /// 변환기에 전달된 슬라이스 폭 불일치
    #[error("converter '{converter}' expects {expected} bytes, got {actual}")]
    CodecWidthMismatch {
        /// 변환기 이름
        converter: String,
        /// 변환기가 요구하는 폭
        expected: usize,
        /// 실제 슬라이스 폭
        actual: usize,
    },

    /// 디바이스 등록/디코더 설정 에러. 세션이 시작되지 않습니다.
    #[error("configuration error: {field}: {reason}")]
    Configuration {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl IngestError {
    /// 설정 에러를 생성합니다.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<IngestError> for SenseflowError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Configuration { field, reason } => {
                SenseflowError::Config(ConfigError::InvalidValue { field, reason })
            }
            IngestError::Channel(reason) => {
                SenseflowError::Pipeline(PipelineError::ChannelSend(reason))
            }
            other => SenseflowError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
