#![no_main]
use hfa_rs::{Access, Container};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes behind a valid tag must never panic the reader
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(d) => d,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.img");
    let mut bytes = b"EHFA_HEADER_TAG\0".to_vec();
    bytes.extend_from_slice(data);
    if std::fs::write(&path, &bytes).is_err() {
        return;
    }

    let mut img = match Container::open(&path, Access::ReadOnly) {
        Ok(img) => img,
        Err(_) => return,
    };
    let _ = img.dump_tree();
    for band in 0..img.band_count().min(4) {
        let _ = img.read_block(band, 0, 0);
        let _ = img.overview_count(band);
        let _ = img.color_table(band);
    }
    let _ = img.metadata(None);
    let _ = img.geo_transform();
    let _ = img.transform_stack();
});
