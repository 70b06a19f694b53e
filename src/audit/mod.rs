//! On-disk audit side-channel mirroring run store records.

pub mod mirror;

pub use mirror::AuditMirror;
