//! Audit Module
//!
//! Append-only record of merge protocol events

pub mod audit;

pub use audit::{AuditAction, AuditEntry, AuditLog, AUDIT_VERSION};
