#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use senseflow_ingest::decoder::{DecoderConfig, JsonConfig, JsonDecoder};
use senseflow_ingest::PayloadDecoder;

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 경로 식 (None이면 루트)
    path: Option<String>,
    /// 페이로드 본문
    body: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let config = DecoderConfig::Json(JsonConfig { path: input.path });
    let _ = JsonDecoder::new().decode(&input.body, &config);
});
