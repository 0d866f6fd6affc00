//! Stateful core of a CRI server fronting a single-file image runtime.
//!
//! A cluster node agent manages pods and containers through two services,
//! `RuntimeService` and `ImageService`, spoken over a local stream socket.
//! This crate is everything stateful behind that surface: the pod and
//! container lifecycle state machines and their coupling to namespaces,
//! cgroups, CNI networking, and the external launcher subprocess; the
//! content-addressed image store with durable metadata and reference
//! pinning; the translation of cluster configuration into OCI runtime
//! specs; and the truncated-ID index every lookup goes through.
//!
//! The wire layer (gRPC transport, protobuf mapping, socket plumbing) is a
//! separate concern: it converts each RPC into exactly one call on
//! [`runtime::Runtime`] and each [`error::Error`] variant into a status
//! code.

pub mod config;
pub mod container;
pub mod cri;
pub mod error;
pub mod image;
pub mod index;
pub mod launcher;
pub mod logging;
pub mod namespace;
pub mod network;
pub mod oci;
pub mod pod;
pub mod runtime;
pub mod streaming;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::Runtime;

/// Monotonic-enough wall-clock timestamp in nanoseconds, the unit the CRI
/// reports timestamps in.
pub(crate) fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}
