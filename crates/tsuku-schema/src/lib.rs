//! Shared types for tsuku: platforms, checksums, install receipts and the
//! load-test helper protocol.
//!
//! Everything here is plain data. Parsing of binaries and all filesystem
//! access lives in `tsuku-core`.

pub mod arch;
pub mod dltest;
pub mod hash;
pub mod receipt;

// Re-exports
pub use arch::*;
pub use hash::*;
pub use receipt::*;
