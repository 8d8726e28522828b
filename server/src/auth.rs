//! Ticket validation seam.
//!
//! The platform SDK call that actually validates a session ticket lives
//! outside this process; handlers only ever see the [`AuthService`] trait.
//! The default implementation checks the ticket's shape so a garbage blob
//! cannot authenticate, and trusts the embedded id beyond that.

use async_trait::async_trait;

use crate::error::GcError;

/// Minimum plausible length of a platform session ticket.
const MIN_TICKET_LEN: usize = 20;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Validates a platform ticket and returns the authenticated id.
    async fn validate_ticket(&self, claimed_steam_id: u64, ticket: &[u8])
        -> Result<u64, GcError>;
}

/// Shape-level ticket validation. The real platform call slots in behind
/// [`AuthService`] without touching the handlers.
#[derive(Debug, Default)]
pub struct TicketAuthenticator;

#[async_trait]
impl AuthService for TicketAuthenticator {
    async fn validate_ticket(
        &self,
        claimed_steam_id: u64,
        ticket: &[u8],
    ) -> Result<u64, GcError> {
        if claimed_steam_id == 0 {
            return Err(GcError::AuthFailed("missing steam id".into()));
        }
        if ticket.len() < MIN_TICKET_LEN {
            return Err(GcError::AuthFailed(format!(
                "ticket too short ({} bytes)",
                ticket.len()
            )));
        }
        Ok(claimed_steam_id)
    }
}
