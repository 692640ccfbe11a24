//! Cluster Identity & Addressing Module
//!
//! Gives this process a handle for every peer it has ever seen and a stable
//! way to name itself.
//!
//! ## Core Mechanisms
//! - **Interning**: `NodeRegistry` maps each `NodeIdentity` to exactly one
//!   shared `Node` handle, so subsystems can compare peers by handle identity
//!   instead of structural equality on hot paths.
//! - **Dense Indexing**: every node gets a small monotonically increasing
//!   local index, letting serialized metadata carry a compact integer instead
//!   of a full address.
//! - **Membership Oracle**: the `ClusterMembership` trait is the narrow seam
//!   to whatever layer actually forms the cluster.

pub mod membership;
pub mod node;
pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;
