//! 디바이스 세션 -- 디바이스 하나의 연결 상태 머신과 페이로드 처리
//!
//! ```text
//! Idle -> Connecting -> Subscribed -> Receiving <-> Reconnecting -> Closed
//! ```
//!
//! - [`DeviceSession`]: 동기 처리 코어. 디코딩, 수치 변환, 이상치 필터를 거쳐
//!   [`Measurement`] 목록을 만듭니다. 페이로드 단위 실패는 세션 밖으로 나가지 않습니다.
//! - [`run_session`]: 비동기 태스크. 연결, 구독, 수신 루프, 재연결 백오프를 담당합니다.
//!   재연결 동안 필터 상태는 유지되고, 취소되면 `Closed`로 전이하며 필터 상태를 버립니다.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use senseflow_core::metrics as m;
use senseflow_core::types::Measurement;

use crate::config::{DeviceRegistration, IngestSettings};
use crate::decoder::{DecoderRegistry, PayloadDecoder};
use crate::error::IngestError;
use crate::filter::{Classification, FilterBank};
use crate::sink::MeasurementSink;
use crate::transport::{RawPayload, TransportConnection, TransportConnector};

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// 생성됨, 아직 연결 시도 전
    Idle = 0,
    /// 최초 연결 중
    Connecting = 1,
    /// 구독 완료, 아직 수신한 페이로드 없음
    Subscribed = 2,
    /// 페이로드 수신 중
    Receiving = 3,
    /// 연결이 끊겨 백오프 후 재연결 중
    Reconnecting = 4,
    /// 종료됨
    Closed = 5,
}

impl SessionState {
    /// 상태 이름을 반환합니다.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// 브로커와 연결이 정상인 상태인지 확인합니다.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Subscribed | Self::Receiving)
    }

    /// 연결을 기다리는 중인지 확인합니다.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Subscribed,
            3 => Self::Receiving,
            4 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 세션 태스크와 관리자가 공유하는 상태 셀
#[derive(Debug, Clone)]
pub struct SessionStateCell(Arc<AtomicU8>);

impl SessionStateCell {
    /// `Idle` 상태로 새 셀을 생성합니다.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Idle as u8)))
    }

    /// 현재 상태를 반환합니다.
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 상태를 변경하고 이전 상태를 반환합니다.
    pub fn set(&self, state: SessionState) -> SessionState {
        SessionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 디바이스 세션 처리 코어
pub struct DeviceSession {
    registration: DeviceRegistration,
    decoder: &'static dyn PayloadDecoder,
    filters: Option<FilterBank>,
    max_payload_bytes: usize,
}

impl DeviceSession {
    /// 등록을 검증하고 디코더를 해석하여 세션을 생성합니다.
    ///
    /// 검증에 실패하면 `IngestError::Configuration`을 반환하며 세션은 시작되지 않습니다.
    pub fn new(
        registration: DeviceRegistration,
        max_payload_bytes: usize,
    ) -> Result<Self, IngestError> {
        registration.validate()?;

        let kind = registration.decoder.kind();
        let decoder = DecoderRegistry::global().get(kind).ok_or_else(|| {
            IngestError::configuration(
                format!("devices.{}.decoder.kind", registration.id),
                format!("no decoder registered for '{kind}'"),
            )
        })?;

        let filters = match registration.outlier {
            Some(settings) if !kind.bypasses_filter() => Some(FilterBank::new(settings)),
            _ => None,
        };

        Ok(Self {
            registration,
            decoder,
            filters,
            max_payload_bytes,
        })
    }

    /// 디바이스 ID를 반환합니다.
    pub fn id(&self) -> &str {
        &self.registration.id
    }

    /// 디바이스 등록 정보를 반환합니다.
    pub fn registration(&self) -> &DeviceRegistration {
        &self.registration
    }

    /// 이상치 필터 뱅크를 반환합니다. 필터가 꺼져 있으면 `None`.
    pub fn filters(&self) -> Option<&FilterBank> {
        self.filters.as_ref()
    }

    /// 페이로드 하나를 처리하여 측정값 레코드 목록을 반환합니다.
    ///
    /// 크기 초과, 디코딩 실패, 수치가 아닌 값은 로그와 카운터로만 남기고 버립니다.
    pub fn handle_payload(&mut self, payload: &RawPayload) -> Vec<Measurement> {
        let started = Instant::now();
        let kind = self.decoder.kind();
        metrics::counter!(m::INGEST_PAYLOADS_RECEIVED_TOTAL, m::LABEL_DECODER => kind.name())
            .increment(1);

        if payload.data.len() > self.max_payload_bytes {
            warn!(
                device = %self.registration.id,
                topic = %payload.topic,
                size = payload.data.len(),
                limit = self.max_payload_bytes,
                "payload exceeds size limit, discarding"
            );
            metrics::counter!(m::INGEST_PAYLOADS_DISCARDED_TOTAL, m::LABEL_DECODER => kind.name())
                .increment(1);
            return Vec::new();
        }

        let Some(readings) = self.decoder.decode(&payload.data, &self.registration.decoder) else {
            debug!(
                device = %self.registration.id,
                topic = %payload.topic,
                decoder = kind.name(),
                "payload produced no readings, discarding"
            );
            metrics::counter!(m::INGEST_PAYLOADS_DISCARDED_TOTAL, m::LABEL_DECODER => kind.name())
                .increment(1);
            return Vec::new();
        };

        let mut records = Vec::with_capacity(readings.len());
        for (sensor_id, reading) in readings {
            let Some(value) = reading.value.as_f64() else {
                debug!(
                    device = %self.registration.id,
                    sensor = %sensor_id,
                    value = %reading.value,
                    "dropping non-numeric value"
                );
                metrics::counter!(m::INGEST_VALUES_REJECTED_TOTAL).increment(1);
                continue;
            };

            let (value, outlier, substituted) = match self.filters.as_mut() {
                Some(filters) => {
                    let outcome = filters.process(&sensor_id, value);
                    if outcome.classification == Classification::Outlier {
                        let action = if outcome.substituted {
                            "replaced"
                        } else {
                            "flagged"
                        };
                        debug!(
                            device = %self.registration.id,
                            sensor = %sensor_id,
                            original = value,
                            emitted = outcome.value,
                            action,
                            "outlier detected"
                        );
                        metrics::counter!(m::INGEST_OUTLIERS_DETECTED_TOTAL, m::LABEL_ACTION => action)
                            .increment(1);
                    }
                    (outcome.value, outcome.outlier, outcome.substituted.then_some(true))
                }
                None => (value, None, None),
            };

            let mut measurement = Measurement::new(
                self.registration.id.as_str(),
                sensor_id,
                value,
                payload.received_at,
            );
            measurement.outlier = outlier;
            measurement.substituted = substituted;
            measurement.reported_at = reading.timestamp;
            records.push(measurement);
        }

        metrics::histogram!(m::INGEST_PAYLOAD_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        records
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("registration", &self.registration)
            .field("decoder", &self.decoder.kind())
            .field(
                "sensors",
                &self.filters.as_ref().map_or(0, FilterBank::sensor_count),
            )
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

/// 세션 태스크 본체
///
/// 취소될 때까지 연결과 재연결을 반복합니다. 재연결 시도 횟수에는 제한이 없고,
/// 간격은 [`IngestSettings::backoff_for`]를 따릅니다.
pub async fn run_session<C, S>(
    mut session: DeviceSession,
    connector: Arc<C>,
    sink: Arc<S>,
    settings: IngestSettings,
    state: SessionStateCell,
    cancel: CancellationToken,
) where
    C: TransportConnector,
    S: MeasurementSink,
{
    let session_id = Uuid::new_v4();
    let device = session.id().to_owned();
    let topic = session.registration().topic.clone();
    let endpoint = session.registration().endpoint.to_string();
    let mut attempt: u32 = 0;

    state.set(SessionState::Connecting);
    info!(%session_id, %device, %topic, %endpoint, "session starting");

    'session: loop {
        let established = tokio::select! {
            _ = cancel.cancelled() => break 'session,
            result = establish(connector.as_ref(), session.registration()) => result,
        };

        match established {
            Ok(mut connection) => {
                attempt = 0;
                state.set(SessionState::Subscribed);
                info!(%session_id, %device, %topic, "subscribed");

                let error = loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break 'session,
                        result = connection.next_payload() => result,
                    };
                    match next {
                        Ok(payload) => {
                            state.set(SessionState::Receiving);
                            let records = session.handle_payload(&payload);
                            if !deliver(sink.as_ref(), records, &device, &cancel).await {
                                break 'session;
                            }
                        }
                        Err(e) => break e,
                    }
                };
                warn!(%session_id, %device, error = %error, "connection lost");
            }
            Err(e) => {
                warn!(%session_id, %device, %endpoint, error = %e, "connection attempt failed");
            }
        }

        state.set(SessionState::Reconnecting);
        let delay = settings.backoff_for(attempt);
        attempt = attempt.saturating_add(1);
        metrics::counter!(m::INGEST_RECONNECTS_TOTAL, m::LABEL_DEVICE => device.clone())
            .increment(1);
        info!(
            %session_id,
            %device,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => break 'session,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.set(SessionState::Closed);
    let sensors = session.filters().map_or(0, FilterBank::sensor_count);
    drop(session);
    info!(%session_id, %device, sensors, "session closed");
}

async fn establish<C: TransportConnector>(
    connector: &C,
    registration: &DeviceRegistration,
) -> Result<C::Connection, IngestError> {
    let mut connection = connector.connect(registration).await?;
    connection.subscribe(&registration.topic).await?;
    Ok(connection)
}

/// 레코드를 순서대로 전달합니다. 취소되면 `false`.
async fn deliver<S: MeasurementSink>(
    sink: &S,
    records: Vec<Measurement>,
    device: &str,
    cancel: &CancellationToken,
) -> bool {
    for record in records {
        let sensor = record.sensor_id.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = sink.submit(record) => result,
        };
        match result {
            Ok(()) => metrics::counter!(m::INGEST_RECORDS_EMITTED_TOTAL).increment(1),
            Err(e) => {
                warn!(%device, %sensor, error = %e, "failed to deliver measurement");
                metrics::counter!(m::INGEST_SINK_FAILURES_TOTAL).increment(1);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::decoder::{BinaryMaskConfig, DecoderConfig, JsonConfig};
    use crate::filter::OutlierSettings;
    use crate::transport::ChannelConnector;

    fn csv_registration(id: &str) -> DeviceRegistration {
        DeviceRegistration::new(id, "mqtt://localhost", format!("boxes/{id}"), DecoderConfig::Csv)
            .unwrap()
    }

    fn payload(id: &str, data: &'static [u8]) -> RawPayload {
        RawPayload::new(Bytes::from_static(data), format!("boxes/{id}"), id)
    }

    fn fast_settings() -> IngestSettings {
        IngestSettings {
            reconnect_backoff_base: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(40),
            ..IngestSettings::default()
        }
    }

    async fn wait_for(cell: &SessionStateCell, expected: SessionState) {
        for _ in 0..200 {
            if cell.get() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never became {expected}, last {}", cell.get());
    }

    #[test]
    fn state_cell_round_trips_every_state() {
        let cell = SessionStateCell::new();
        assert_eq!(cell.get(), SessionState::Idle);
        for state in [
            SessionState::Connecting,
            SessionState::Subscribed,
            SessionState::Receiving,
            SessionState::Reconnecting,
            SessionState::Closed,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn state_predicates() {
        assert!(SessionState::Receiving.is_connected());
        assert!(SessionState::Subscribed.is_connected());
        assert!(SessionState::Reconnecting.is_pending());
        assert!(!SessionState::Closed.is_pending());
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(SessionState::Reconnecting).unwrap(),
            "reconnecting"
        );
    }

    #[test]
    fn invalid_registration_never_builds_session() {
        let mut registration = csv_registration("box-a");
        registration.decoder = DecoderConfig::Json(JsonConfig {
            path: Some("$.[".to_owned()),
        });
        let err = DeviceSession::new(registration, 1024).unwrap_err();
        assert!(matches!(err, IngestError::Configuration { .. }));
    }

    #[test]
    fn csv_payload_becomes_measurements() {
        let mut session = DeviceSession::new(csv_registration("box-a"), 1024).unwrap();
        let records = session.handle_payload(&payload("box-a", b"temp,21.5\nhum,40,2024-01-01T00:00:00Z"));

        assert_eq!(records.len(), 2);
        let hum = records.iter().find(|r| r.sensor_id == "hum").unwrap();
        assert_eq!(hum.box_id, "box-a");
        assert_eq!(hum.value, 40.0);
        assert_eq!(hum.reported_at.as_deref(), Some("2024-01-01T00:00:00Z"));
        let temp = records.iter().find(|r| r.sensor_id == "temp").unwrap();
        assert!(temp.reported_at.is_none());
        assert!(temp.outlier.is_none());
    }

    #[test]
    fn non_numeric_values_are_dropped_individually() {
        let mut session = DeviceSession::new(csv_registration("box-a"), 1024).unwrap();
        let records = session.handle_payload(&payload("box-a", b"temp,abc\nhum,40\npm,NaN"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sensor_id, "hum");
    }

    #[test]
    fn oversized_payload_is_discarded() {
        let mut session = DeviceSession::new(csv_registration("box-a"), 4).unwrap();
        assert!(session.handle_payload(&payload("box-a", b"temp,21.5")).is_empty());
    }

    #[test]
    fn undecodable_payload_yields_nothing() {
        let mut registration = csv_registration("box-a");
        registration.decoder = DecoderConfig::BinaryMask(BinaryMaskConfig::sensebox_home());
        let mut session = DeviceSession::new(registration, 1024).unwrap();
        assert!(session.handle_payload(&payload("box-a", b"\x01\x02")).is_empty());
    }

    #[test]
    fn filter_flags_outlier_after_warmup() {
        let registration = csv_registration("box-a").with_outlier(Some(OutlierSettings {
            window_size: 5,
            replace_on_detect: false,
        }));
        let mut session = DeviceSession::new(registration, 1024).unwrap();
        for _ in 0..5 {
            let records = session.handle_payload(&payload("box-a", b"temp,10"));
            assert!(records[0].outlier.is_none());
        }
        let records = session.handle_payload(&payload("box-a", b"temp,1000"));
        assert_eq!(records[0].value, 1000.0);
        assert_eq!(records[0].outlier, Some(true));
        assert!(records[0].substituted.is_none());
    }

    #[test]
    fn filter_replaces_outlier_with_mean() {
        let registration = csv_registration("box-a").with_outlier(Some(OutlierSettings {
            window_size: 5,
            replace_on_detect: true,
        }));
        let mut session = DeviceSession::new(registration, 1024).unwrap();
        for _ in 0..5 {
            session.handle_payload(&payload("box-a", b"temp,10"));
        }
        let records = session.handle_payload(&payload("box-a", b"temp,1000"));
        assert_eq!(records[0].value, 10.0);
        assert!(records[0].outlier.is_none());
        assert_eq!(records[0].substituted, Some(true));
    }

    #[test]
    fn plain_debug_bypasses_filter() {
        let mut registration = csv_registration("box-a");
        registration.decoder = DecoderConfig::PlainDebug;
        let session = DeviceSession::new(registration, 1024).unwrap();
        assert!(session.filters().is_none());
    }

    #[test]
    fn disabled_outlier_settings_skip_filter() {
        let registration = csv_registration("box-a").with_outlier(None);
        let session = DeviceSession::new(registration, 1024).unwrap();
        assert!(session.filters().is_none());
    }

    #[tokio::test]
    async fn run_session_delivers_and_closes_on_cancel() {
        let connector = Arc::new(ChannelConnector::new());
        let handle = connector.handle("box-a");
        let (tx, mut rx) = mpsc::channel(16);
        let state = SessionStateCell::new();
        let cancel = CancellationToken::new();

        let session = DeviceSession::new(csv_registration("box-a"), 1024).unwrap();
        let task = tokio::spawn(run_session(
            session,
            Arc::clone(&connector),
            Arc::new(tx),
            fast_settings(),
            state.clone(),
            cancel.clone(),
        ));

        wait_for(&state, SessionState::Subscribed).await;
        assert_eq!(handle.subscriptions(), vec!["boxes/box-a".to_owned()]);
        assert!(handle.publish(&b"temp,21.5"[..]));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.sensor_id, "temp");
        assert_eq!(state.get(), SessionState::Receiving);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(state.get(), SessionState::Closed);
    }

    #[tokio::test]
    async fn run_session_reconnects_after_refused_connects() {
        let connector = Arc::new(ChannelConnector::new());
        let handle = connector.handle("box-a");
        handle.refuse_next_connects(2);
        let (tx, _rx) = mpsc::channel(16);
        let state = SessionStateCell::new();
        let cancel = CancellationToken::new();

        let session = DeviceSession::new(csv_registration("box-a"), 1024).unwrap();
        let task = tokio::spawn(run_session(
            session,
            Arc::clone(&connector),
            Arc::new(tx),
            fast_settings(),
            state.clone(),
            cancel.clone(),
        ));

        wait_for(&state, SessionState::Subscribed).await;
        assert_eq!(handle.connect_count(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_session() {
        let connector = Arc::new(ChannelConnector::new());
        let handle = connector.handle("box-a");
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let state = SessionStateCell::new();
        let cancel = CancellationToken::new();

        let session = DeviceSession::new(csv_registration("box-a"), 1024).unwrap();
        let task = tokio::spawn(run_session(
            session,
            connector,
            Arc::new(tx),
            fast_settings(),
            state.clone(),
            cancel.clone(),
        ));

        wait_for(&state, SessionState::Subscribed).await;
        handle.publish(&b"temp,1"[..]);
        wait_for(&state, SessionState::Receiving).await;
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(state.get(), SessionState::Closed);
    }
}
