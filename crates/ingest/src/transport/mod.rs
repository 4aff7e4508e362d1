//! 전송 계층 모듈 -- 디바이스 브로커 연결 추상화
//!
//! [`TransportConnector`]는 디바이스 등록으로부터 연결을 만들고,
//! [`TransportConnection`]은 토픽 구독과 페이로드 수신을 담당합니다.
//! 운영 환경에서는 [`MqttConnector`]를, 테스트나 프로세스 내 입력에는
//! [`ChannelConnector`]를 사용합니다.
//!
//! # 아키텍처
//!
//! ```text
//! run_session
//!     |
//!     v
//! TransportConnector (trait)
//!     |            |
//!     v            v
//! MqttConnector  ChannelConnector
//!     |
//!     v
//! MQTT broker
//! ```

pub mod channel;
pub mod mqtt;

pub use channel::{ChannelConnector, ChannelHandle};
pub use mqtt::MqttConnector;

use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::DeviceRegistration;
use crate::error::IngestError;

/// 수신된 원시 페이로드
///
/// 전송 계층이 생성하고, 디코딩 한 번에 소비되는 중간 데이터 형식입니다.
#[derive(Debug, Clone)]
pub struct RawPayload {
    /// 원시 바이트
    pub data: Bytes,
    /// 수신 토픽
    pub topic: String,
    /// 디바이스(box) ID
    pub device_id: String,
    /// 수신 시각
    pub received_at: DateTime<Utc>,
}

impl RawPayload {
    /// 현재 시각으로 새 페이로드를 생성합니다.
    pub fn new(data: Bytes, topic: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            data,
            topic: topic.into(),
            device_id: device_id.into(),
            received_at: Utc::now(),
        }
    }

    /// 수신 시각을 지정합니다.
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }
}

/// 연결된 브로커 세션
pub trait TransportConnection: Send + 'static {
    /// 토픽을 구독하고 브로커의 확인을 기다립니다.
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), IngestError>> + Send;

    /// 다음 페이로드를 기다립니다.
    ///
    /// 연결이 끊기면 [`IngestError::Transport`]를 반환하며, 이후 이 연결은 사용하지 않습니다.
    fn next_payload(&mut self) -> impl Future<Output = Result<RawPayload, IngestError>> + Send;
}

/// 디바이스 등록으로부터 연결을 만드는 팩토리
pub trait TransportConnector: Send + Sync + 'static {
    /// 생성하는 연결 타입
    type Connection: TransportConnection;

    /// 브로커에 연결하고 연결 확인을 기다립니다.
    fn connect(
        &self,
        registration: &DeviceRegistration,
    ) -> impl Future<Output = Result<Self::Connection, IngestError>> + Send;
}
