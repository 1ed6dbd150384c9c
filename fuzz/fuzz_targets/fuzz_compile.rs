#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use nnrt_backend_core::{BackendPreference, BackendRegistry};
use nnrt_backend_cpu::CpuBackend;

fuzz_target!(|data: &[u8]| {
    // Any payload that decodes into a valid model must also compile
    // without panicking; errors are fine.
    if let Ok(model) = nnrt_import::import_bytes(data) {
        let mut registry = BackendRegistry::new();
        registry.register_fallback(Arc::new(CpuBackend));
        let model = Arc::new(model);
        let _ = nnrt_compiler::compile(&model, &BackendPreference::default(), &registry);
    }
});
