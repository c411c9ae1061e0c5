//! Operation Context
//!
//! Contains metadata about the current operation for scoping, audit and tracing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Identity owning every record an operation may touch.
///
/// Every `LedgerStore` call takes an `OwnerId`; the only way to obtain one
/// outside this module is from an `OperationContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context for an operation, used for owner scoping, auditing and tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Owner of the ledger (from the X-Request-User-Id header)
    owner: OwnerId,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Client IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
}

impl OperationContext {
    /// Create a context acting on behalf of `owner_id`
    pub fn for_owner(owner_id: Uuid) -> Self {
        Self {
            owner: OwnerId(owner_id),
            correlation_id: None,
            client_ip: None,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner.0
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Create context with client IP
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let owner = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let context = OperationContext::for_owner(owner).with_correlation_id(correlation_id);

        assert_eq!(context.owner_id(), owner);
        assert_eq!(context.owner().as_uuid(), owner);
        assert_eq!(context.correlation_id, Some(correlation_id));
    }

    #[test]
    fn test_ensure_correlation_id() {
        let mut context = OperationContext::for_owner(Uuid::new_v4());
        assert!(context.correlation_id.is_none());

        let id = context.ensure_correlation_id();
        assert_eq!(context.correlation_id, Some(id));

        // Calling again should return the same ID
        assert_eq!(context.ensure_correlation_id(), id);
    }
}
