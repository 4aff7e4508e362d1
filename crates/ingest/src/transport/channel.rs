//! 프로세스 내 채널 전송 구현
//!
//! 브로커 없이 `mpsc` 채널로 페이로드를 주입합니다. [`ChannelHandle`]로
//! 페이로드 발행, 연결 끊기, 연결 거부를 흉내낼 수 있어 세션의 재연결 동작을
//! 결정적으로 재현할 수 있습니다.
//!
//! # 사용 예시
//! ```ignore
//! let connector = ChannelConnector::new();
//! let handle = connector.handle("box-a");
//! // ... 세션 활성화 후
//! handle.publish(&b"temp,21.5"[..]);
//! handle.disconnect(); // 세션은 Reconnecting으로 전이
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{RawPayload, TransportConnection, TransportConnector};
use crate::config::DeviceRegistration;
use crate::error::IngestError;

type Links = Arc<Mutex<HashMap<String, LinkState>>>;

#[derive(Debug, Default)]
struct LinkState {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    connects: usize,
    refuse_remaining: usize,
    subscriptions: Vec<String>,
}

fn lock(links: &Links) -> MutexGuard<'_, HashMap<String, LinkState>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 채널 커넥터
#[derive(Debug, Clone, Default)]
pub struct ChannelConnector {
    links: Links,
}

impl ChannelConnector {
    /// 새 커넥터를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 디바이스의 제어 핸들을 반환합니다.
    pub fn handle(&self, device_id: impl Into<String>) -> ChannelHandle {
        ChannelHandle {
            device_id: device_id.into(),
            links: Arc::clone(&self.links),
        }
    }
}

impl TransportConnector for ChannelConnector {
    type Connection = ChannelConnection;

    async fn connect(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<ChannelConnection, IngestError> {
        let rx = {
            let mut links = lock(&self.links);
            let link = links.entry(registration.id.clone()).or_default();
            link.connects += 1;
            if link.refuse_remaining > 0 {
                link.refuse_remaining -= 1;
                return Err(IngestError::Transport {
                    endpoint: registration.endpoint.to_string(),
                    reason: "connection refused".to_owned(),
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            link.tx = Some(tx);
            rx
        };

        Ok(ChannelConnection {
            rx,
            device_id: registration.id.clone(),
            endpoint: registration.endpoint.to_string(),
            topic: String::new(),
            links: Arc::clone(&self.links),
        })
    }
}

/// 채널 연결
#[derive(Debug)]
pub struct ChannelConnection {
    rx: mpsc::UnboundedReceiver<Bytes>,
    device_id: String,
    endpoint: String,
    topic: String,
    links: Links,
}

impl TransportConnection for ChannelConnection {
    async fn subscribe(&mut self, topic: &str) -> Result<(), IngestError> {
        self.topic = topic.to_owned();
        let mut links = lock(&self.links);
        links
            .entry(self.device_id.clone())
            .or_default()
            .subscriptions
            .push(topic.to_owned());
        Ok(())
    }

    async fn next_payload(&mut self) -> Result<RawPayload, IngestError> {
        match self.rx.recv().await {
            Some(data) => Ok(RawPayload {
                data,
                topic: self.topic.clone(),
                device_id: self.device_id.clone(),
                received_at: Utc::now(),
            }),
            None => Err(IngestError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection closed".to_owned(),
            }),
        }
    }
}

/// 디바이스 하나의 채널 제어 핸들
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    device_id: String,
    links: Links,
}

impl ChannelHandle {
    /// 현재 연결로 페이로드를 발행합니다. 연결이 없으면 `false`.
    pub fn publish(&self, data: impl Into<Bytes>) -> bool {
        let links = lock(&self.links);
        links
            .get(&self.device_id)
            .and_then(|link| link.tx.as_ref())
            .is_some_and(|tx| tx.send(data.into()).is_ok())
    }

    /// 현재 연결을 끊습니다. 이미 보낸 페이로드는 먼저 전달됩니다.
    pub fn disconnect(&self) -> bool {
        let mut links = lock(&self.links);
        links
            .get_mut(&self.device_id)
            .and_then(|link| link.tx.take())
            .is_some()
    }

    /// 다음 `count`번의 연결 시도를 거부합니다.
    pub fn refuse_next_connects(&self, count: usize) {
        let mut links = lock(&self.links);
        links
            .entry(self.device_id.clone())
            .or_default()
            .refuse_remaining = count;
    }

    /// 연결 시도 횟수를 반환합니다 (거부된 시도 포함).
    pub fn connect_count(&self) -> usize {
        lock(&self.links)
            .get(&self.device_id)
            .map_or(0, |link| link.connects)
    }

    /// 구독 요청 기록을 반환합니다.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.links)
            .get(&self.device_id)
            .map(|link| link.subscriptions.clone())
            .unwrap_or_default()
    }

    /// 현재 연결이 살아있는지 확인합니다.
    pub fn is_connected(&self) -> bool {
        lock(&self.links)
            .get(&self.device_id)
            .and_then(|link| link.tx.as_ref())
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderConfig;

    fn registration(id: &str) -> DeviceRegistration {
        DeviceRegistration::new(id, "mqtt://localhost", format!("boxes/{id}"), DecoderConfig::Csv)
            .unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_connection() {
        let connector = ChannelConnector::new();
        let handle = connector.handle("box-a");
        assert!(!handle.publish(&b"lost"[..]));

        let mut conn = connector.connect(&registration("box-a")).await.unwrap();
        conn.subscribe("boxes/box-a").await.unwrap();
        assert!(handle.is_connected());
        assert!(handle.publish(&b"a,1"[..]));

        let payload = conn.next_payload().await.unwrap();
        assert_eq!(payload.data.as_ref(), b"a,1");
        assert_eq!(payload.topic, "boxes/box-a");
        assert_eq!(payload.device_id, "box-a");
        assert_eq!(handle.subscriptions(), vec!["boxes/box-a".to_owned()]);
    }

    #[tokio::test]
    async fn disconnect_drains_then_errors() {
        let connector = ChannelConnector::new();
        let handle = connector.handle("box-a");
        let mut conn = connector.connect(&registration("box-a")).await.unwrap();

        handle.publish(&b"a,1"[..]);
        assert!(handle.disconnect());
        assert!(!handle.disconnect());

        assert!(conn.next_payload().await.is_ok());
        assert!(matches!(
            conn.next_payload().await,
            Err(IngestError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let connector = ChannelConnector::new();
        let handle = connector.handle("box-a");
        handle.refuse_next_connects(2);

        assert!(connector.connect(&registration("box-a")).await.is_err());
        assert!(connector.connect(&registration("box-a")).await.is_err());
        assert!(connector.connect(&registration("box-a")).await.is_ok());
        assert_eq!(handle.connect_count(), 3);
    }

    #[tokio::test]
    async fn devices_are_isolated() {
        let connector = ChannelConnector::new();
        let mut a = connector.connect(&registration("box-a")).await.unwrap();
        let _b = connector.connect(&registration("box-b")).await.unwrap();

        connector.handle("box-b").publish(&b"b,2"[..]);
        connector.handle("box-a").publish(&b"a,1"[..]);

        let payload = a.next_payload().await.unwrap();
        assert_eq!(payload.data.as_ref(), b"a,1");
    }
}
