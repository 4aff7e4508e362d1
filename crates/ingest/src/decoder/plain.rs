//! plain-debug 페이로드 디코더
//!
//! 진단용 pass-through 디코더입니다. 각 줄을 `id=value`, `id:value`, `id value` 중
//! 처음 맞는 구분자로 나눕니다. 이 디코더의 레코드는 이상치 필터를 거치지 않습니다.

use tracing::debug;

use super::{DecoderConfig, DecoderKind, PayloadDecoder, Reading, ReadingSet};

/// plain-debug 디코더
#[derive(Debug, Default)]
pub struct PlainDebugDecoder;

impl PlainDebugDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self
    }

    /// 페이로드를 디코딩합니다.
    pub fn decode_lines(&self, payload: &[u8]) -> Option<ReadingSet> {
        let text = String::from_utf8_lossy(payload);
        debug!(payload = %text, "plain-debug payload");

        let mut readings = ReadingSet::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((id, value)) = split_pair(line) else {
                continue;
            };
            readings.insert(id.to_owned(), Reading::text(value));
        }

        (!readings.is_empty()).then_some(readings)
    }
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (id, value) = line
        .split_once('=')
        .or_else(|| line.split_once(':'))
        .or_else(|| line.split_once(char::is_whitespace))?;
    let (id, value) = (id.trim(), value.trim());
    (!id.is_empty() && !value.is_empty()).then_some((id, value))
}

impl PayloadDecoder for PlainDebugDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::PlainDebug
    }

    fn decode(&self, payload: &[u8], config: &DecoderConfig) -> Option<ReadingSet> {
        match config {
            DecoderConfig::PlainDebug => self.decode_lines(payload),
            other => {
                debug!(expected = "plain-debug", got = %other.kind(), "decoder config mismatch");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RawValue;

    #[test]
    fn accepts_all_separators() {
        let readings = PlainDebugDecoder::new()
            .decode_lines(b"a=1\nb:2\nc 3\n\n")
            .unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings["a"].value, RawValue::Text("1".to_owned()));
        assert_eq!(readings["b"].value, RawValue::Text("2".to_owned()));
        assert_eq!(readings["c"].value, RawValue::Text("3".to_owned()));
    }

    #[test]
    fn equals_takes_precedence_over_colon() {
        let readings = PlainDebugDecoder::new()
            .decode_lines(b"ts=10:30")
            .unwrap();
        assert_eq!(readings["ts"].value, RawValue::Text("10:30".to_owned()));
    }

    #[test]
    fn lines_without_pair_are_skipped() {
        assert!(PlainDebugDecoder::new().decode_lines(b"hello\n=5\nx=").is_none());
        assert!(PlainDebugDecoder::new().decode_lines(b"").is_none());
    }

    #[test]
    fn mismatched_config_yields_none() {
        assert!(
            PlainDebugDecoder::new()
                .decode(b"a=1", &DecoderConfig::Csv)
                .is_none()
        );
    }
}
