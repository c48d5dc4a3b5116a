//! Invitation lifecycle for the gatehouse platform.
//!
//! An invitation is the only path into a tenant for a new member. This
//! crate owns the invitation record and its state machine (create, resend,
//! cancel, and the one-shot accept transition), the membership provisioning
//! that accept triggers, and the storage traits the server backs with
//! Postgres.

pub mod error;
pub mod invitation;
pub mod service;
pub mod store;
pub mod token;

pub use error::InvitationError;
pub use invitation::{Invitation, InvitationStatus};
pub use service::{
    AcceptedMembership, FederatedIdentity, InvitationConfig, InvitationService, NewInvitation,
};
pub use store::{
    InvitationStore, MembershipLink, MemoryInvitationStore, MemoryUserDirectory, PlatformUser,
    StoreError, UserDirectory,
};
