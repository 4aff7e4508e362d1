#![no_main]

use libfuzzer_sys::fuzz_target;
use senseflow_ingest::decoder::{CsvDecoder, DecoderConfig, PlainDebugDecoder};
use senseflow_ingest::PayloadDecoder;

fuzz_target!(|data: &[u8]| {
    let _ = CsvDecoder::new().decode(data, &DecoderConfig::Csv);
    let _ = PlainDebugDecoder::new().decode(data, &DecoderConfig::PlainDebug);
});
