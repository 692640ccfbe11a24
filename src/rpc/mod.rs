//! Reliable Task-Delivery Module
//!
//! Implements remote procedure calls that survive packet loss and
//! duplication on top of an unreliable transport.
//!
//! ## Protocol Overview
//! Every call gets a task id unique to its destination, drawn from that
//! node's monotonic counter. Delivery uses a three-phase handshake:
//! 1. **Request**: executed exactly once on the receiver; duplicates are
//!    resolved against the work ledger and the completion watermark.
//! 2. **Ack**: carries the result; resent at a constant interval until
//!    confirmed.
//! 3. **AckAck**: the final confirmation, after which the receiver rolls the
//!    task into its watermark and stops tracking it individually.
//! A **Nack** asks the caller to resend a request the receiver never managed
//! to compute.
//!
//! ## Submodules
//! - **`service`**: the engine object exposing `send` / `submit_and_await`.
//! - **`call`**: per-call state (`PendingCall`, `WorkItem`).
//! - **`scanner`**: the periodic retry pass across all nodes.
//! - **`registry`**: maps handler names to executable code.
//! - **`types`**: wire messages and outcome encoding.

pub mod call;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
