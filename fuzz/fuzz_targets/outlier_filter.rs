#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use senseflow_ingest::{OutlierFilter, OutlierSettings};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    window_size: u8,
    replace_on_detect: bool,
    values: Vec<f64>,
}

fuzz_target!(|input: FuzzInput| {
    let mut filter = OutlierFilter::new(OutlierSettings {
        window_size: usize::from(input.window_size),
        replace_on_detect: input.replace_on_detect,
    });
    let capacity = filter.settings().window_size;
    for value in input.values.into_iter().filter(|v| v.is_finite()) {
        let _ = filter.process(value);
        assert!(filter.len() <= capacity);
    }
});
