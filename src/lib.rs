//! Distributed Compute Engine Library
//!
//! This library crate defines the core modules of a cluster of cooperating
//! compute nodes. It serves as the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`cluster`**: Node identity and addressing. Interns every peer ever seen
//!   into a shared `Node` handle with a dense local index, and defines the
//!   membership oracle the delivery protocol consults.
//! - **`rpc`**: The reliable task-delivery protocol. Issues remote calls that
//!   survive packet loss and duplication using an ACK / ACKACK / NACK handshake,
//!   per-destination task counters, and a rolling completion watermark.
//! - **`transport`**: Wire framing and transmission. Small messages are batched
//!   in priority order over one persistent stream per peer; large payloads go
//!   through a bounded socket pool; fire-and-forget traffic rides single UDP
//!   datagrams.
//! - **`config`**: Tunable timeouts, buffer sizes, and pool limits.

pub mod cluster;
pub mod config;
pub mod rpc;
pub mod transport;
