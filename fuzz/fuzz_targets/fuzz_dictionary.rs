#![no_main]
use hfa_rs::TypeDictionary;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let _ = TypeDictionary::parse(&text);
    let dict = TypeDictionary::from_file_text(&text);
    let _ = dict.text();
});
