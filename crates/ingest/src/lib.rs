#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`codec`]: 바이너리 마스크 코덱 (필드 폭 + 변환기 목록으로 프레임 분해)
//! - [`decoder`]: 형식별 페이로드 디코더와 전역 레지스트리
//! - [`filter`]: 센서별 이상치 필터
//! - [`transport`]: 브로커 연결 추상화 (MQTT, 프로세스 내 채널)
//! - [`sink`]: 측정값 전달 대상 추상화
//! - [`session`]: 디바이스 세션 상태 머신
//! - [`manager`]: 세션 관리 (Pipeline trait 구현)
//! - [`config`]: 수집 설정과 디바이스 등록 (core 설정 변환)
//! - [`error`]: 도메인 에러 타입

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod manager;
pub mod session;
pub mod sink;

pub mod decoder;
pub mod transport;

// --- 주요 타입 re-export ---

// 관리자
pub use manager::{IngestionManager, IngestionManagerBuilder};

// 세션
pub use session::{DeviceSession, SessionState, SessionStateCell, run_session};

// 설정
pub use config::{Credentials, DeviceRegistration, Endpoint, IngestSettings};

// 에러
pub use error::IngestError;

// 코덱
pub use codec::{Converter, FieldDescriptor, MaskValues, decode_mask};

// 디코더
pub use decoder::{
    DecoderConfig, DecoderKind, DecoderRegistry, PayloadDecoder, RawValue, Reading, ReadingSet,
};

// 필터
pub use filter::{FilterBank, FilterOutcome, OutlierFilter, OutlierSettings};

// 전송
pub use transport::{
    ChannelConnector, ChannelHandle, MqttConnector, RawPayload, TransportConnection,
    TransportConnector,
};

// 싱크
pub use sink::MeasurementSink;
