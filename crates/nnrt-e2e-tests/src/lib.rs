//! Test-only crate; everything lives under `tests/`.
