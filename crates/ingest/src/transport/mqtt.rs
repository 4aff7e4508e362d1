//! `rumqttc` 기반 MQTT 전송 구현
//!
//! 디바이스마다 클라이언트 ID `senseflow-<box id>`로 브로커에 연결합니다.
//! `connect`는 ConnAck를, `subscribe`는 SubAck를 받을 때까지 이벤트 루프를 구동합니다.
//! 재연결은 rumqttc 내부가 아니라 세션 루프가 담당하므로, 에러가 나면 연결을 버립니다.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use tracing::{debug, trace};

use super::{RawPayload, TransportConnection, TransportConnector};
use crate::config::{DeviceRegistration, IngestSettings};
use crate::error::IngestError;

/// 클라이언트 요청 채널 용량
const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// MQTT 커넥터
#[derive(Debug, Clone)]
pub struct MqttConnector {
    keep_alive: Duration,
    max_packet_size: usize,
}

impl MqttConnector {
    /// 수집 설정으로 커넥터를 생성합니다.
    pub fn new(settings: &IngestSettings) -> Self {
        Self {
            keep_alive: settings.keep_alive,
            max_packet_size: settings.max_payload_bytes,
        }
    }

    fn options(&self, registration: &DeviceRegistration) -> MqttOptions {
        let mut options = MqttOptions::new(
            registration.client_id(),
            registration.endpoint.host.clone(),
            registration.endpoint.port,
        );
        options.set_keep_alive(self.keep_alive);
        // 최대 크기 초과 페이로드는 세션에서 버리므로 여유를 둡니다.
        let limit = self.max_packet_size.saturating_mul(2).max(1024);
        options.set_max_packet_size(limit, limit);
        if let Some(credentials) = &registration.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        options
    }
}

impl TransportConnector for MqttConnector {
    type Connection = MqttConnection;

    async fn connect(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<MqttConnection, IngestError> {
        let endpoint = registration.endpoint.to_string();
        let (client, mut eventloop) =
            AsyncClient::new(self.options(registration), REQUEST_CHANNEL_CAPACITY);

        loop {
            let event = eventloop
                .poll()
                .await
                .map_err(|e| transport_error(&endpoint, e))?;
            if let Event::Incoming(Packet::ConnAck(ack)) = event {
                if ack.code != ConnectReturnCode::Success {
                    return Err(IngestError::Transport {
                        endpoint,
                        reason: format!("connection refused: {:?}", ack.code),
                    });
                }
                debug!(device = %registration.id, endpoint = %endpoint, "mqtt connected");
                break;
            }
        }

        Ok(MqttConnection {
            client,
            eventloop,
            endpoint,
            device_id: registration.id.clone(),
            pending: VecDeque::new(),
        })
    }
}

/// MQTT 연결
pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    endpoint: String,
    device_id: String,
    /// SubAck 대기 중 먼저 도착한 publish
    pending: VecDeque<RawPayload>,
}

impl MqttConnection {
    fn to_payload(&self, publish: rumqttc::Publish) -> RawPayload {
        RawPayload {
            data: publish.payload,
            topic: publish.topic,
            device_id: self.device_id.clone(),
            received_at: Utc::now(),
        }
    }
}

impl TransportConnection for MqttConnection {
    async fn subscribe(&mut self, topic: &str) -> Result<(), IngestError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;

        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| transport_error(&self.endpoint, e))?;
            match event {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(IngestError::Transport {
                            endpoint: self.endpoint.clone(),
                            reason: format!("subscription to '{topic}' rejected"),
                        });
                    }
                    return Ok(());
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let payload = self.to_payload(publish);
                    self.pending.push_back(payload);
                }
                other => trace!(event = ?other, "mqtt event while subscribing"),
            }
        }
    }

    async fn next_payload(&mut self) -> Result<RawPayload, IngestError> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(payload);
        }

        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| transport_error(&self.endpoint, e))?;
            match event {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(self.to_payload(publish));
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(IngestError::Transport {
                        endpoint: self.endpoint.clone(),
                        reason: "broker sent disconnect".to_owned(),
                    });
                }
                other => trace!(event = ?other, "mqtt event"),
            }
        }
    }
}

fn transport_error(endpoint: &str, err: impl std::fmt::Display) -> IngestError {
    IngestError::Transport {
        endpoint: endpoint.to_owned(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderConfig;

    fn registration() -> DeviceRegistration {
        DeviceRegistration::new("box-a", "mqtt://127.0.0.1:1", "boxes/a", DecoderConfig::Csv)
            .unwrap()
            .with_credentials("box-a", "secret")
    }

    #[test]
    fn options_carry_client_id_and_keep_alive() {
        let settings = IngestSettings {
            keep_alive: Duration::from_secs(45),
            ..IngestSettings::default()
        };
        let options = MqttConnector::new(&settings).options(&registration());
        assert_eq!(options.client_id(), "senseflow-box-a");
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert_eq!(options.broker_address(), ("127.0.0.1".to_owned(), 1));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_transport_error() {
        let connector = MqttConnector::new(&IngestSettings::default());
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            connector.connect(&registration()),
        )
        .await
        .expect("connect attempt should not hang");
        assert!(matches!(result, Err(IngestError::Transport { .. })));
    }
}
