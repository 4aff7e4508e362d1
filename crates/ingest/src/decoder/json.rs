//! JSON 페이로드 디코더
//!
//! 페이로드를 `serde_json`으로 파싱한 뒤, 선택적 경로 식으로 노드를 골라
//! [`ReadingSet`]으로 정규화합니다.
//!
//! # 경로 식
//! `$`(루트), `.name`, `['name']`, `[index]`, `[*]`(와일드카드)의 부분집합을 지원합니다.
//! 선두 `$`는 생략할 수 있습니다. 여러 노드가 매칭되면 첫 번째 노드를 사용합니다.
//!
//! # 지원하는 노드 형태
//! - 객체: `{ "<sensorId>": value }` (value는 스칼라 또는 `[value, createdAt?, ...]`)
//! - 객체 배열: `[{ "sensor" | "sensor_id" | "sensorId": id, "value": v, "createdAt" | "timestamp": ts }]`
//!
//! 문자열/숫자 이외의 스칼라(bool, null)는 건너뜁니다.

use serde_json::Value;
use tracing::debug;

use super::{DecoderConfig, DecoderKind, PayloadDecoder, RawValue, Reading, ReadingSet};
use crate::error::IngestError;

/// 센서 ID 필드 후보 (객체 배열 형태)
const SENSOR_ID_KEYS: &[&str] = &["sensor", "sensor_id", "sensorId"];
/// 타임스탬프 필드 후보 (객체 배열 형태)
const TIMESTAMP_KEYS: &[&str] = &["createdAt", "timestamp"];

/// JSON 디코더 설정
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonConfig {
    /// 경로 식. 없으면 문서 전체를 사용합니다.
    pub path: Option<String>,
}

/// 경로 식의 한 단계
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// 객체 키
    Key(String),
    /// 배열 인덱스
    Index(usize),
    /// 배열 원소 또는 객체 값 전체
    Wildcard,
}

/// 파싱된 JSON 경로 식
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// 경로 식을 파싱합니다.
    pub fn parse(expr: &str) -> Result<Self, IngestError> {
        let invalid = |reason: String| IngestError::configuration("decoder.path", reason);

        let expr = expr.trim();
        let mut rest = expr.strip_prefix('$').unwrap_or(expr);
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
                let name = &after_dot[..end];
                if name.is_empty() {
                    return Err(invalid(format!("empty member name in '{expr}'")));
                }
                segments.push(if name == "*" {
                    Segment::Wildcard
                } else {
                    Segment::Key(name.to_owned())
                });
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let close = after_bracket
                    .find(']')
                    .ok_or_else(|| invalid(format!("unclosed '[' in '{expr}'")))?;
                let inner = after_bracket[..close].trim();
                segments.push(Self::parse_bracket(inner).ok_or_else(|| {
                    invalid(format!("invalid bracket selector '[{inner}]' in '{expr}'"))
                })?);
                rest = &after_bracket[close + 1..];
            } else if segments.is_empty() && !expr.starts_with('$') {
                // 선두 `$`와 `.`을 모두 생략한 형태 (예: "data.values")
                let end = rest.find(['.', '[']).unwrap_or(rest.len());
                segments.push(Segment::Key(rest[..end].to_owned()));
                rest = &rest[end..];
            } else {
                return Err(invalid(format!("unexpected character in '{expr}'")));
            }
        }

        Ok(Self { segments })
    }

    fn parse_bracket(inner: &str) -> Option<Segment> {
        if inner == "*" {
            return Some(Segment::Wildcard);
        }
        for quote in ['\'', '"'] {
            if let Some(name) = inner
                .strip_prefix(quote)
                .and_then(|s| s.strip_suffix(quote))
            {
                return Some(Segment::Key(name.to_owned()));
            }
        }
        inner.parse::<usize>().ok().map(Segment::Index)
    }

    /// 루트 경로(`$`)인지 확인합니다.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// 경로와 매칭되는 첫 번째 노드를 반환합니다.
    pub fn select_first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current: Vec<&'a Value> = vec![root];
        for segment in &self.segments {
            current = current
                .into_iter()
                .flat_map(|node| Self::step(node, segment))
                .collect();
            if current.is_empty() {
                return None;
            }
        }
        current.into_iter().next()
    }

    fn step<'a>(node: &'a Value, segment: &Segment) -> Vec<&'a Value> {
        match (segment, node) {
            (Segment::Key(key), Value::Object(map)) => map.get(key).into_iter().collect(),
            (Segment::Index(idx), Value::Array(arr)) => arr.get(*idx).into_iter().collect(),
            (Segment::Wildcard, Value::Array(arr)) => arr.iter().collect(),
            (Segment::Wildcard, Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        }
    }
}

/// JSON 페이로드 디코더
#[derive(Debug, Default)]
pub struct JsonDecoder;

impl JsonDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self
    }

    /// 설정을 적용하여 페이로드를 디코딩합니다.
    pub fn decode_with(&self, payload: &[u8], config: &JsonConfig) -> Option<ReadingSet> {
        let document: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "json payload parse failed");
                return None;
            }
        };

        let node = match config.path.as_deref() {
            None => &document,
            Some(expr) => {
                let path = match JsonPath::parse(expr) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "json path invalid");
                        return None;
                    }
                };
                path.select_first(&document)?
            }
        };

        let readings = normalize(node);
        (!readings.is_empty()).then_some(readings)
    }
}

impl PayloadDecoder for JsonDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Json
    }

    fn decode(&self, payload: &[u8], config: &DecoderConfig) -> Option<ReadingSet> {
        match config {
            DecoderConfig::Json(json) => self.decode_with(payload, json),
            other => {
                debug!(expected = "json", got = %other.kind(), "decoder config mismatch");
                None
            }
        }
    }
}

/// 선택된 노드를 판독값 맵으로 정규화합니다.
fn normalize(node: &Value) -> ReadingSet {
    let mut readings = ReadingSet::new();
    match node {
        Value::Object(map) => {
            for (sensor_id, value) in map {
                if let Some(reading) = reading_from_member(value) {
                    readings.insert(sensor_id.clone(), reading);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Some((sensor_id, reading)) = reading_from_record(item) {
                    readings.insert(sensor_id, reading);
                }
            }
        }
        _ => {}
    }
    readings
}

/// `"sensorId": value` 또는 `"sensorId": [value, createdAt?]` 형태
fn reading_from_member(value: &Value) -> Option<Reading> {
    match value {
        Value::Array(parts) => {
            let raw = scalar(parts.first()?)?;
            let timestamp = parts.get(1).and_then(timestamp_text);
            Some(Reading {
                value: raw,
                timestamp,
            })
        }
        other => scalar(other).map(|raw| Reading {
            value: raw,
            timestamp: None,
        }),
    }
}

/// `{ "sensor": id, "value": v, "createdAt": ts }` 형태
fn reading_from_record(item: &Value) -> Option<(String, Reading)> {
    let obj = item.as_object()?;
    let sensor_id = SENSOR_ID_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })?;
    let raw = scalar(obj.get("value")?)?;
    let timestamp = TIMESTAMP_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(timestamp_text);
    Some((
        sensor_id,
        Reading {
            value: raw,
            timestamp,
        },
    ))
}

fn scalar(value: &Value) -> Option<RawValue> {
    match value {
        Value::String(s) => Some(RawValue::Text(s.clone())),
        Value::Number(n) => n.as_f64().map(RawValue::Number),
        _ => None,
    }
}

fn timestamp_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
