//! Transport Adapter Module
//!
//! Moves encoded protocol messages between peers over three paths:
//!
//! - **Batched small messages**: queued per destination in priority order and
//!   concatenated into one buffer per flush over a persistent stream
//!   connection (`sender`).
//! - **Bulk**: large payloads borrow a stream from a bounded per-destination
//!   socket pool (`pool`).
//! - **Datagram**: single best-effort UDP packets for traffic that tolerates
//!   loss.
//!
//! Every new stream opens with a tiny handshake announcing its kind and the
//! sender's listening port, so the receiver can demultiplex without a
//! separate control channel (`framing`, `listener`).

pub mod framing;
pub mod listener;
pub mod pool;
pub mod sender;
