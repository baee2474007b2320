//! Shared primitive definitions for the emulator.

pub mod constants;
