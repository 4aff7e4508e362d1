//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `senseflow_`
//! - 모듈명: `ingest_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(senseflow_core::metrics::INGEST_PAYLOADS_RECEIVED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 디코더 형식 레이블 키 (json, csv, binary-mask, plain-debug)
pub const LABEL_DECODER: &str = "decoder";

/// 디바이스(box) ID 레이블 키
pub const LABEL_DEVICE: &str = "device";

/// 이상치 처리 방식 레이블 키 (replaced, flagged)
pub const LABEL_ACTION: &str = "action";

// ─── Ingest 메트릭 ─────────────────────────────────────────────────

/// Ingest: 수신된 페이로드 수 (counter, label: decoder)
pub const INGEST_PAYLOADS_RECEIVED_TOTAL: &str = "senseflow_ingest_payloads_received_total";

/// Ingest: 디코딩 결과가 없어 버려진 페이로드 수 (counter, label: decoder)
pub const INGEST_PAYLOADS_DISCARDED_TOTAL: &str = "senseflow_ingest_payloads_discarded_total";

/// Ingest: 바이너리 마스크 디코딩 실패로 원본 폴백된 수 (counter)
pub const INGEST_RAW_FALLBACKS_TOTAL: &str = "senseflow_ingest_raw_fallbacks_total";

/// Ingest: 수치로 변환할 수 없어 버려진 개별 값 수 (counter)
pub const INGEST_VALUES_REJECTED_TOTAL: &str = "senseflow_ingest_values_rejected_total";

/// Ingest: downstream으로 전달된 측정값 레코드 수 (counter)
pub const INGEST_RECORDS_EMITTED_TOTAL: &str = "senseflow_ingest_records_emitted_total";

/// Ingest: downstream 전달 실패 수 (counter)
pub const INGEST_SINK_FAILURES_TOTAL: &str = "senseflow_ingest_sink_failures_total";

/// Ingest: 탐지된 이상치 수 (counter, label: action)
pub const INGEST_OUTLIERS_DETECTED_TOTAL: &str = "senseflow_ingest_outliers_detected_total";

/// Ingest: 전송 계층 재연결 시도 수 (counter)
pub const INGEST_RECONNECTS_TOTAL: &str = "senseflow_ingest_reconnects_total";

/// Ingest: 활성 세션 수 (gauge)
pub const INGEST_ACTIVE_SESSIONS: &str = "senseflow_ingest_active_sessions";

/// Ingest: 페이로드 1건 처리 지연 시간 (histogram, 초)
pub const INGEST_PAYLOAD_DURATION_SECONDS: &str = "senseflow_ingest_payload_duration_seconds";

// ─── Daemon 메트릭 ─────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "senseflow_daemon_uptime_seconds";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "senseflow_daemon_build_info";

/// Daemon: 설정에 등록된 디바이스 수 (gauge)
pub const DAEMON_DEVICES_REGISTERED: &str = "senseflow_daemon_devices_registered";

/// 페이로드 처리 지연 히스토그램 버킷 (초)
pub const PAYLOAD_DURATION_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1,
];

/// 정의된 모든 메트릭 이름 목록
pub const ALL_METRIC_NAMES: &[&str] = &[
    INGEST_PAYLOADS_RECEIVED_TOTAL,
    INGEST_PAYLOADS_DISCARDED_TOTAL,
    INGEST_RAW_FALLBACKS_TOTAL,
    INGEST_VALUES_REJECTED_TOTAL,
    INGEST_RECORDS_EMITTED_TOTAL,
    INGEST_SINK_FAILURES_TOTAL,
    INGEST_OUTLIERS_DETECTED_TOTAL,
    INGEST_RECONNECTS_TOTAL,
    INGEST_ACTIVE_SESSIONS,
    INGEST_PAYLOAD_DURATION_SECONDS,
    DAEMON_UPTIME_SECONDS,
    DAEMON_BUILD_INFO,
    DAEMON_DEVICES_REGISTERED,
];

/// 모든 메트릭의 설명을 등록합니다.
///
/// recorder 설치 직후 한 번 호출합니다.
/// `metrics::describe_counter!()`, `describe_gauge!()`, `describe_histogram!()`을
/// 사용하며, recorder가 없으면 아무 일도 하지 않습니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Ingest
    describe_counter!(
        INGEST_PAYLOADS_RECEIVED_TOTAL,
        "Total payloads received from device transports"
    );
    describe_counter!(
        INGEST_PAYLOADS_DISCARDED_TOTAL,
        "Payloads that produced no readings and were discarded"
    );
    describe_counter!(
        INGEST_RAW_FALLBACKS_TOTAL,
        "Binary mask decodes that fell back to the raw payload"
    );
    describe_counter!(
        INGEST_VALUES_REJECTED_TOTAL,
        "Individual reading values rejected as non-numeric"
    );
    describe_counter!(
        INGEST_RECORDS_EMITTED_TOTAL,
        "Measurement records handed to the downstream sink"
    );
    describe_counter!(
        INGEST_SINK_FAILURES_TOTAL,
        "Measurement records the downstream sink refused"
    );
    describe_counter!(
        INGEST_OUTLIERS_DETECTED_TOTAL,
        "Values classified as outliers by the sliding window filter"
    );
    describe_counter!(
        INGEST_RECONNECTS_TOTAL,
        "Transport reconnect attempts across all sessions"
    );
    describe_gauge!(INGEST_ACTIVE_SESSIONS, "Currently active device sessions");
    describe_histogram!(
        INGEST_PAYLOAD_DURATION_SECONDS,
        "Time spent decoding and filtering one payload"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
    describe_gauge!(
        DAEMON_DEVICES_REGISTERED,
        "Devices registered in configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_start_with_senseflow_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("senseflow_"),
                "Metric '{}' does not start with 'senseflow_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<&str> = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_use_total_suffix() {
        let counters = [
            INGEST_PAYLOADS_RECEIVED_TOTAL,
            INGEST_PAYLOADS_DISCARDED_TOTAL,
            INGEST_RAW_FALLBACKS_TOTAL,
            INGEST_VALUES_REJECTED_TOTAL,
            INGEST_RECORDS_EMITTED_TOTAL,
            INGEST_SINK_FAILURES_TOTAL,
            INGEST_OUTLIERS_DETECTED_TOTAL,
            INGEST_RECONNECTS_TOTAL,
        ];
        for name in counters {
            assert!(name.ends_with("_total"), "counter '{}' lacks _total", name);
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        // recorder 없이 호출해도 패닉하지 않아야 함
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_DECODER, LABEL_DEVICE, LABEL_ACTION] {
            assert_eq!(label.to_lowercase(), label);
        }
    }

    #[test]
    fn payload_duration_buckets_are_sorted() {
        let buckets = PAYLOAD_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(buckets[i] > buckets[i - 1]);
        }
    }
}
