//! 바이너리 코덱 모듈
//!
//! - [`mask`]: 고정 폭 필드 마스크 디코더 (LoRa 프레임 등)

pub mod mask;

pub use mask::{Converter, FieldDescriptor, MAX_FIELD_WIDTH, MaskValues, decode_mask, mask_width};
