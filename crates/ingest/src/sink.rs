//! 측정값 전달 대상(sink) 추상화
//!
//! 세션은 정규화된 [`Measurement`]를 [`MeasurementSink`]로 넘긴 뒤 더 이상 소유하지 않습니다.
//! 전달 실패는 세션이 로그와 카운터로 기록할 뿐 재시도하지 않습니다.

use std::future::Future;

use tokio::sync::mpsc;

use senseflow_core::types::Measurement;

use crate::error::IngestError;

/// 측정값 전달 대상
pub trait MeasurementSink: Send + Sync + 'static {
    /// 레코드 하나를 전달합니다.
    fn submit(
        &self,
        measurement: Measurement,
    ) -> impl Future<Output = Result<(), IngestError>> + Send;
}

impl MeasurementSink for mpsc::Sender<Measurement> {
    async fn submit(&self, measurement: Measurement) -> Result<(), IngestError> {
        self.send(measurement)
            .await
            .map_err(|e| IngestError::Channel(format!("measurement receiver dropped: {e}")))
    }
}
