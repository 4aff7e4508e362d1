//! 구분자 텍스트(CSV) 페이로드 디코더
//!
//! 페이로드를 CR/LF로 줄 단위로 나누고, 각 줄을 쉼표로 나눈 뒤 필드를 trim합니다.
//! 필드가 정확히 2개(`id,value`) 또는 3개(`id,value,timestamp`)이고 id가 비어있지 않은
//! 줄만 받아들이며, 나머지 줄은 조용히 건너뜁니다.
//! 같은 id가 여러 번 나오면 뒤의 줄이 앞의 줄을 덮어씁니다.

use tracing::debug;

use super::{DecoderConfig, DecoderKind, PayloadDecoder, Reading, ReadingSet};

/// 구분자 텍스트 디코더
#[derive(Debug, Default)]
pub struct CsvDecoder;

impl CsvDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self
    }

    /// 페이로드를 디코딩합니다.
    pub fn decode_text(&self, payload: &[u8]) -> Option<ReadingSet> {
        let text = String::from_utf8_lossy(payload);
        let mut readings = ReadingSet::new();

        for line in text.split(['\r', '\n']) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let (id, value, timestamp) = match fields.as_slice() {
                [id, value] => (*id, *value, None),
                [id, value, ts] => (*id, *value, Some(*ts)),
                _ => continue,
            };
            if id.is_empty() {
                continue;
            }

            let mut reading = Reading::text(value);
            if let Some(ts) = timestamp.filter(|t| !t.is_empty()) {
                reading = reading.with_timestamp(ts);
            }
            readings.insert(id.to_owned(), reading);
        }

        (!readings.is_empty()).then_some(readings)
    }
}

impl PayloadDecoder for CsvDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Csv
    }

    fn decode(&self, payload: &[u8], config: &DecoderConfig) -> Option<ReadingSet> {
        match config {
            DecoderConfig::Csv => self.decode_text(payload),
            other => {
                debug!(expected = "csv", got = %other.kind(), "decoder config mismatch");
                None
            }
        }
    }
}
