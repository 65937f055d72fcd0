//! Common utilities for polydbm
//!
//! This crate provides the value types shared by every polydbm layer.

pub mod codec;
pub mod params;
pub mod status;

pub use codec::{deserialize_float, deserialize_int, serialize_float, serialize_int};
pub use params::Params;
pub use status::{Result, ResultExt, Status, StatusCode};
