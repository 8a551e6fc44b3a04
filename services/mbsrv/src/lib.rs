//! Modbus TCP gateway service (mbsrv)
//!
//! Terminates Modbus TCP connections from field masters and exposes one
//! shared register memory (coils, discrete inputs, input registers, holding
//! registers) that an HTTP control plane can read and write concurrently.
//!
//! # Architecture
//!
//! ```text
//! master ─► server ─► protocol ─► handler ─┐
//!                                          ▼
//!                                   RegisterStore
//!                                          ▲
//! HTTP ──► api ──► facade ──► point_map ───┘
//! ```
//!
//! - **`store`**: per-table arenas behind `parking_lot::RwLock`
//! - **`point_map`**: immutable name → address map, value conversions
//! - **`protocol`**: MBAP framing and PDU buffers
//! - **`handler`**: request validation and execution
//! - **`server`**: accept loop, connections, per-client statistics
//! - **`lifecycle`**: start/stop/restart, watchdog, debug toggle
//! - **`facade`** / **`api`**: HTTP access

pub mod api;
pub mod config;
pub mod error;
pub mod facade;
pub mod handler;
pub mod lifecycle;
pub mod point_map;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::AppConfig;
pub use facade::Facade;
pub use lifecycle::{DriverManager, DriverState, DriverStatus};
pub use store::{RegisterStore, Table};
