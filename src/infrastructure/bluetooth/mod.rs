//! Bluetooth Module
//!
//! Register access to a rangefinder over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │  (Public API: registers, pairing, connection lifecycle)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐  ┌────────────┐  ┌────────────┐
//! │ Correlator │  │ Connection │  │  Protocol  │
//! │            │  │            │  │            │
//! │ - pending  │  │ - UUIDs    │  │ - framing  │
//! │ - timeout  │  │ - state    │  │ - checksum │
//! │ - retry    │  │   machine  │  │ - Radix64  │
//! └─────┬──────┘  └────────────┘  └────────────┘
//!       │
//!       ▼
//! ┌────────────┐
//! │ Transport  │  platform adapter, or the loopback device
//! └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`radix64`] - 6-bit ASCII value codec and checksum
//! - [`protocol`] - Frame assembly and parsing, both directions
//! - [`transport`] - Capability the platform adapter implements
//! - [`correlator`] - Request/response matching, deadlines, busy retry
//! - [`connection`] - Characteristic layout and connection state machine
//! - [`session`] - Main coordinator
//! - [`loopback`] - Simulated rangefinder for demos and tests

pub mod connection;
pub mod correlator;
pub mod loopback;
pub mod protocol;
pub mod radix64;
pub mod session;
pub mod transport;

// Re-export main session for convenience
pub use session::{DeviceSession, SessionConfig};
