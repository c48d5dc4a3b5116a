//! Core domain types and utilities for the gatehouse platform.
//!
//! This crate provides the shared strongly-typed identifiers used
//! throughout the gatehouse tenant-scoped identity system.

pub mod id;

pub use id::{InvitationId, TenantId, UserId};
