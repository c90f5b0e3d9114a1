//! Core library for the fmr_daq application.
//!
//! Plans ferromagnetic-resonance field sweeps, drives the magnet, cryostat,
//! lock-in and sources through capability traits, and logs every field
//! point to a per-frequency CSV file. The `fmr_daq` binary and the
//! integration tests are built on this crate.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod measurement;
