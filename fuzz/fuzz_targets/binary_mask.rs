#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use senseflow_ingest::codec::{decode_mask, mask_width, Converter, FieldDescriptor};
use senseflow_ingest::decoder::{BinaryMaskConfig, BinaryMaskDecoder};

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 필드 목록 (최대 16개로 제한)
    fields: Vec<FuzzField>,
    /// 프레임 바이트
    frame: Vec<u8>,
}

#[derive(Arbitrary, Debug)]
struct FuzzField {
    width: u8,
    converter: FuzzConverter,
}

#[derive(Arbitrary, Debug)]
enum FuzzConverter {
    Uint8,
    Uint16,
    Humidity,
}

fuzz_target!(|input: FuzzInput| {
    let fields: Vec<FieldDescriptor> = input
        .fields
        .iter()
        .take(16)
        .map(|f| {
            let converter = match f.converter {
                FuzzConverter::Uint8 => Converter::Uint8,
                FuzzConverter::Uint16 => Converter::Uint16,
                FuzzConverter::Humidity => Converter::Humidity,
            };
            FieldDescriptor {
                width_bytes: usize::from(f.width % 9),
                converter,
                label: None,
            }
        })
        .collect();

    // 성공하면 전체 폭만큼 정확히 소비해야 함
    if let Ok(values) = decode_mask(&input.frame, &fields) {
        assert_eq!(Some(values.consumed), mask_width(&fields));
    }

    let _ = BinaryMaskDecoder::new().decode_frame(&input.frame, &BinaryMaskConfig::sensebox_home());
});
