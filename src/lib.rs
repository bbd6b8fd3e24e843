//! # Thermal Logger Library
//!
//! Acquire thermal matrix frames from a serial sensor on a daily schedule and
//! keep them durably until a remote collector has acknowledged them.
//!
//! This library provides the frame recovery, decoding, scheduling, storage and
//! upload stages; the binary wires them into two long-running tasks.

pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod retry;
pub mod sample;
pub mod schedule;
pub mod serial;
pub mod storage;
pub mod upload;
