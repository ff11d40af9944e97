#![no_main]
use hfa_rs::codec::decompress;
use hfa_rs::PixelType;
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

#[derive(Debug, Arbitrary)]
struct Block {
    type_code: u8,
    pixels: u16,
    payload: Vec<u8>,
}

fuzz_target!(|block: Block| {
    let Some(pixel_type) = PixelType::from_code(i64::from(block.type_code % 16)) else {
        return;
    };
    let _ = decompress(&block.payload, pixel_type, usize::from(block.pixels));
});
