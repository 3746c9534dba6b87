//! Client-side link layer for BLE rangefinders.
//!
//! Register values travel as checksummed Radix64 text frames over a single
//! GATT characteristic pair. The crate frames and parses those messages,
//! correlates requests with their responses over an event-driven transport,
//! and runs the challenge/response handshake that authorizes a client.

pub mod domain;
pub mod error;
pub mod infrastructure;
