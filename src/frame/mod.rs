//! # Thermal Frame Module
//!
//! Implementation of the thermal sensor's serial framing.
//!
//! This module handles:
//! - Frame marker search and resynchronization on a garbage-laden stream
//! - Little-endian length field parsing with oversize protection
//! - Payload shape detection (trailer / tagged variants)
//! - Decoding centi-degree values into range-checked samples

pub mod protocol;
pub mod cursor;
pub mod deframer;
pub mod decoder;
pub mod encoder;
