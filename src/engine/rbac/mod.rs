//! RBAC Module
//!
//! Club roles, capabilities, and per-request authorization

pub mod policy;
pub mod enforcer;

pub use policy::{Capability, Role};
pub use enforcer::{AuthContext, AuthResult, Enforcer};
