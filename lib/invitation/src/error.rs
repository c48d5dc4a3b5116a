//! Error types for invitation operations.

use std::fmt;

/// Errors from the invitation state machine.
///
/// Each variant maps to a distinct recovery action for the invitee or the
/// inviter, so callers must not collapse them into a generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationError {
    /// No invitation matches the given id or token. Also returned for
    /// tokens superseded by a resend; the response deliberately does not
    /// distinguish "never existed" from "replaced".
    NotFound,
    /// The invitation's acceptance window has passed.
    Expired,
    /// The invitation was already accepted or cancelled; its token can
    /// never authorize another accept.
    AlreadyConsumed,
    /// The operation requires an effectively pending invitation.
    NotPending { status: String },
    /// A pending, non-expired invitation already exists for this email in
    /// this tenant.
    DuplicateActiveInvitation { email: String },
    /// This email already accepted an invitation into this tenant.
    AlreadyMember { email: String },
    /// The storage backend failed.
    Storage { details: String },
}

impl fmt::Display for InvitationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "invitation not found"),
            Self::Expired => write!(f, "invitation has expired"),
            Self::AlreadyConsumed => {
                write!(f, "invitation was already accepted or cancelled")
            }
            Self::NotPending { status } => {
                write!(f, "invitation is {status}, not pending")
            }
            Self::DuplicateActiveInvitation { email } => {
                write!(f, "a pending invitation already exists for {email}")
            }
            Self::AlreadyMember { email } => {
                write!(f, "{email} is already a member of this tenant")
            }
            Self::Storage { details } => {
                write!(f, "invitation storage failed: {details}")
            }
        }
    }
}

impl std::error::Error for InvitationError {}

impl From<crate::store::StoreError> for InvitationError {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::Backend { details } => Self::Storage { details },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_recovery_relevant_detail() {
        let err = InvitationError::NotPending {
            status: "cancelled".to_string(),
        };
        assert!(err.to_string().contains("cancelled"));

        let err = InvitationError::DuplicateActiveInvitation {
            email: "a@x.com".to_string(),
        };
        assert!(err.to_string().contains("a@x.com"));
    }
}
