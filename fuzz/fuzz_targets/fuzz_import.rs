#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes should never panic.
    let _ = nnrt_import::import_bytes(data);
});
