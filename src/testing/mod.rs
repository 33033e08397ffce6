// src/testing/mod.rs
//! Scripted doubles for the upstream feed and the encoder, used by the unit
//! tests and the integration tests under `tests/`.
pub mod mocks;
