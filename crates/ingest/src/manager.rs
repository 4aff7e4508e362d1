//! 수집 관리자 -- 디바이스 세션의 생성, 교체, 종료를 관리합니다.
//!
//! [`IngestionManager`]는 core의 [`Pipeline`] trait을 구현하여
//! `senseflow-daemon`에서 start/stop/health_check 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! TransportConnector -> DeviceSession task (디바이스마다 1개) -> MeasurementSink -> downstream
//! ```
//!
//! 세션 태스크끼리는 공유하는 가변 상태가 없습니다. 관리자는 각 세션의
//! 상태 셀과 취소 토큰만 가지고 있습니다.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use senseflow_core::config::SenseflowConfig;
use senseflow_core::error::{PipelineError, SenseflowError};
use senseflow_core::metrics as m;
use senseflow_core::pipeline::{HealthStatus, Pipeline};
use senseflow_core::types::Measurement;

use crate::config::{DeviceRegistration, IngestSettings};
use crate::error::IngestError;
use crate::session::{DeviceSession, SessionState, SessionStateCell, run_session};
use crate::sink::MeasurementSink;
use crate::transport::TransportConnector;

/// 관리자 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 디바이스 하나의 세션 슬롯
struct SessionSlot {
    registration: DeviceRegistration,
    state: SessionStateCell,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// `deactivate`로 내려간 슬롯은 재시작하지 않음
    retired: bool,
}

impl SessionSlot {
    fn new(registration: DeviceRegistration) -> Self {
        Self {
            registration,
            state: SessionStateCell::new(),
            cancel: CancellationToken::new(),
            task: None,
            retired: false,
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(device = %self.registration.id, error = %e, "session task ended abnormally");
            }
        }
        self.state.set(SessionState::Closed);
    }
}

/// 수집 관리자
///
/// # 사용 예시
/// ```ignore
/// use senseflow_ingest::{IngestionManagerBuilder, MqttConnector};
///
/// let (mut manager, record_rx) = IngestionManagerBuilder::new(MqttConnector::new(&settings))
///     .settings(settings)
///     .devices(registrations)
///     .build()?;
///
/// manager.start().await?;
/// ```
pub struct IngestionManager<C, S> {
    settings: IngestSettings,
    connector: Arc<C>,
    sink: Arc<S>,
    state: ManagerState,
    sessions: BTreeMap<String, SessionSlot>,
}

impl<C, S> IngestionManager<C, S>
where
    C: TransportConnector,
    S: MeasurementSink,
{
    /// 커넥터와 sink로 관리자를 생성합니다.
    pub fn new(settings: IngestSettings, connector: C, sink: S) -> Result<Self, IngestError> {
        settings.validate()?;
        Ok(Self {
            settings,
            connector: Arc::new(connector),
            sink: Arc::new(sink),
            state: ManagerState::Initialized,
            sessions: BTreeMap::new(),
        })
    }

    /// 현재 상태 이름을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            ManagerState::Initialized => "initialized",
            ManagerState::Running => "running",
            ManagerState::Stopped => "stopped",
        }
    }

    /// 수집 설정을 반환합니다.
    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// 디바이스를 활성화합니다.
    ///
    /// 등록이 유효하지 않으면 `IngestError::Configuration`을 반환하고 세션을 만들지 않습니다.
    /// 관리자가 실행 중이 아니면 `Idle` 상태로 등록만 해 두고 `start` 때 시작합니다.
    pub async fn activate(&mut self, registration: DeviceRegistration) -> Result<(), IngestError> {
        if let Some(slot) = self.sessions.get(&registration.id) {
            if !slot.retired {
                return Err(IngestError::configuration(
                    format!("devices.{}", registration.id),
                    "device is already active",
                ));
            }
        }

        let session = DeviceSession::new(registration.clone(), self.settings.max_payload_bytes)?;
        let id = registration.id.clone();
        let mut slot = SessionSlot::new(registration);
        if self.state == ManagerState::Running {
            self.spawn(&mut slot, session);
        }
        info!(device = %id, state = %slot.state.get(), "device activated");
        self.sessions.insert(id, slot);
        self.update_active_gauge();
        Ok(())
    }

    /// 디바이스를 비활성화합니다. 세션 태스크가 끝날 때까지 기다립니다.
    ///
    /// 활성화된 디바이스가 아니면 `false`를 반환합니다.
    pub async fn deactivate(&mut self, device_id: &str) -> bool {
        let Some(slot) = self.sessions.get_mut(device_id) else {
            return false;
        };
        if slot.retired {
            return false;
        }

        slot.retired = true;
        slot.shutdown().await;
        info!(device = %device_id, "device deactivated");
        self.update_active_gauge();
        true
    }

    /// 디바이스 등록을 교체합니다.
    ///
    /// 새 등록을 먼저 검증하고, 유효할 때만 기존 세션을 닫은 뒤 새 세션으로 바꿉니다.
    /// 필터 상태는 새 세션에서 처음부터 다시 쌓입니다.
    pub async fn reconfigure(&mut self, registration: DeviceRegistration) -> Result<(), IngestError> {
        let session = DeviceSession::new(registration.clone(), self.settings.max_payload_bytes)?;
        let id = registration.id.clone();

        if let Some(mut old) = self.sessions.remove(&id) {
            old.shutdown().await;
        }

        let mut slot = SessionSlot::new(registration);
        if self.state == ManagerState::Running {
            self.spawn(&mut slot, session);
        }
        info!(device = %id, "device reconfigured");
        self.sessions.insert(id, slot);
        self.update_active_gauge();
        Ok(())
    }

    /// 디바이스 세션 상태를 조회합니다. 등록된 적 없는 디바이스면 `None`.
    pub fn session_state(&self, device_id: &str) -> Option<SessionState> {
        self.sessions.get(device_id).map(|slot| slot.state.get())
    }

    /// 활성화된 디바이스 ID 목록을 정렬된 순서로 반환합니다.
    pub fn active_devices(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, slot)| !slot.retired)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn spawn(&self, slot: &mut SessionSlot, session: DeviceSession) {
        slot.cancel = CancellationToken::new();
        slot.state.set(SessionState::Idle);
        slot.task = Some(tokio::spawn(run_session(
            session,
            Arc::clone(&self.connector),
            Arc::clone(&self.sink),
            self.settings.clone(),
            slot.state.clone(),
            slot.cancel.clone(),
        )));
    }

    fn update_active_gauge(&self) {
        let running = self
            .sessions
            .values()
            .filter(|slot| slot.task.is_some())
            .count();
        metrics::gauge!(m::INGEST_ACTIVE_SESSIONS).set(running as f64);
    }
}

impl<C, S> Pipeline for IngestionManager<C, S>
where
    C: TransportConnector,
    S: MeasurementSink,
{
    async fn start(&mut self) -> Result<(), SenseflowError> {
        if self.state == ManagerState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!(devices = self.sessions.len(), "starting ingestion manager");

        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, slot)| !slot.retired && slot.task.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let Some(mut slot) = self.sessions.remove(&id) else {
                continue;
            };
            let session =
                DeviceSession::new(slot.registration.clone(), self.settings.max_payload_bytes)
                    .map_err(SenseflowError::from)?;
            self.spawn(&mut slot, session);
            self.sessions.insert(id, slot);
        }

        self.state = ManagerState::Running;
        self.update_active_gauge();
        info!("ingestion manager started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SenseflowError> {
        if self.state != ManagerState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping ingestion manager");

        for slot in self.sessions.values() {
            slot.cancel.cancel();
        }
        for slot in self.sessions.values_mut() {
            slot.shutdown().await;
        }

        self.state = ManagerState::Stopped;
        self.update_active_gauge();
        info!("ingestion manager stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ManagerState::Running => {
                let pending: Vec<&str> = self
                    .sessions
                    .iter()
                    .filter(|(_, slot)| !slot.retired && !slot.state.get().is_connected())
                    .map(|(id, _)| id.as_str())
                    .collect();
                if pending.is_empty() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded(format!("devices not connected: {}", pending.join(", ")))
                }
            }
            ManagerState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ManagerState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 수집 관리자 빌더
///
/// 관리자를 구성하고 측정값 레코드 채널을 생성합니다.
pub struct IngestionManagerBuilder<C> {
    connector: C,
    settings: IngestSettings,
    registrations: Vec<DeviceRegistration>,
    record_tx: Option<mpsc::Sender<Measurement>>,
}

impl<C: TransportConnector> IngestionManagerBuilder<C> {
    /// 전송 커넥터로 새 빌더를 생성합니다.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            settings: IngestSettings::default(),
            registrations: Vec::new(),
            record_tx: None,
        }
    }

    /// 수집 설정을 지정합니다.
    pub fn settings(mut self, settings: IngestSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 디바이스 등록을 추가합니다.
    pub fn device(mut self, registration: DeviceRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// 디바이스 등록 목록을 추가합니다.
    pub fn devices(mut self, registrations: impl IntoIterator<Item = DeviceRegistration>) -> Self {
        self.registrations.extend(registrations);
        self
    }

    /// core 설정의 `[ingest]`와 `[[devices]]`를 적용합니다.
    pub fn core_config(mut self, config: &SenseflowConfig) -> Result<Self, IngestError> {
        self.settings = IngestSettings::from_core(&config.ingest);
        for device in &config.devices {
            self.registrations
                .push(DeviceRegistration::from_core(device, &config.ingest)?);
        }
        Ok(self)
    }

    /// 외부 측정값 전송 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 `record_channel_capacity` 크기의 새 채널을 생성합니다.
    pub fn record_sender(mut self, tx: mpsc::Sender<Measurement>) -> Self {
        self.record_tx = Some(tx);
        self
    }

    /// 관리자를 빌드합니다.
    ///
    /// # Returns
    /// - `IngestionManager`: 관리자 인스턴스 (등록된 디바이스는 `Idle` 상태)
    /// - `Option<mpsc::Receiver<Measurement>>`: 측정값 수신 채널
    ///   (외부 record_sender를 설정한 경우 None)
    #[allow(clippy::type_complexity)]
    pub fn build(
        self,
    ) -> Result<
        (
            IngestionManager<C, mpsc::Sender<Measurement>>,
            Option<mpsc::Receiver<Measurement>>,
        ),
        IngestError,
    > {
        self.settings.validate()?;

        let (record_tx, record_rx) = match self.record_tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(self.settings.record_channel_capacity);
                (tx, Some(rx))
            }
        };

        let mut manager = IngestionManager::new(self.settings, self.connector, record_tx)?;
        for registration in self.registrations {
            if manager.sessions.contains_key(&registration.id) {
                return Err(IngestError::configuration(
                    format!("devices.{}", registration.id),
                    "duplicate device id",
                ));
            }
            DeviceSession::new(registration.clone(), manager.settings.max_payload_bytes)?;
            manager
                .sessions
                .insert(registration.id.clone(), SessionSlot::new(registration));
        }

        Ok((manager, record_rx))
    }
}
