//! Capability tokens and the authority that validates them.
//!
//! Every registered schema records an (owner, read, write) token triple.
//! Callers present an [`Access`] bundle; the [`TokenAuthority`] decides whether
//! the bundle satisfies the recorded token for the required role.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque capability identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityToken {
    /// Sentinel that is always allowed.
    Public,
    /// Sentinel that is never allowed.
    Blocked,
    /// Token minted by a [`TokenAuthority`].
    Issued(Uuid),
}

impl CapabilityToken {
    /// Whether this token is one of the process-wide sentinels.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::Public | Self::Blocked)
    }
}

impl Display for CapabilityToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => formatter.write_str("public"),
            Self::Blocked => formatter.write_str("blocked"),
            Self::Issued(id) => write!(formatter, "{id}"),
        }
    }
}

/// Role a caller needs to perform an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Lifecycle control (unregister, raw source replacement).
    Owner,
    /// Reading effective or default values.
    Read,
    /// Mutating values and persisting them.
    Write,
}

impl Role {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl Display for Role {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Authorization triple attached to a schema at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTriple {
    /// Owner token; satisfies every role.
    pub owner: CapabilityToken,
    /// Token required for reads.
    pub read: CapabilityToken,
    /// Token required for writes.
    pub write: CapabilityToken,
}

impl TokenTriple {
    /// Triple where every role is public.
    #[must_use]
    pub const fn public() -> Self {
        Self {
            owner: CapabilityToken::Public,
            read: CapabilityToken::Public,
            write: CapabilityToken::Public,
        }
    }

    /// Recorded token for a role.
    #[must_use]
    pub const fn for_role(&self, role: Role) -> CapabilityToken {
        match role {
            Role::Owner => self.owner,
            Role::Read => self.read,
            Role::Write => self.write,
        }
    }

    /// Caller credentials granting `role` through its role token.
    #[must_use]
    pub const fn access(&self, role: Role) -> Access {
        Access::role(self.for_role(role))
    }

    /// Caller credentials presenting the owner token.
    #[must_use]
    pub const fn owner_access(&self) -> Access {
        Access::owner(self.owner)
    }
}

/// Credentials a caller presents to the registry. Missing tokens are treated
/// as [`CapabilityToken::Public`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    /// Owner token, when the caller holds it.
    pub owner: Option<CapabilityToken>,
    /// Role-specific token (read or write).
    pub role: Option<CapabilityToken>,
}

impl Access {
    /// Credentials that only satisfy public roles.
    #[must_use]
    pub const fn public() -> Self {
        Self {
            owner: None,
            role: None,
        }
    }

    /// Credentials carrying the owner token.
    #[must_use]
    pub const fn owner(token: CapabilityToken) -> Self {
        Self {
            owner: Some(token),
            role: None,
        }
    }

    /// Credentials carrying a role token.
    #[must_use]
    pub const fn role(token: CapabilityToken) -> Self {
        Self {
            owner: None,
            role: Some(token),
        }
    }

    /// Credentials carrying both tokens.
    #[must_use]
    pub const fn with(owner: Option<CapabilityToken>, role: Option<CapabilityToken>) -> Self {
        Self { owner, role }
    }

    pub(crate) fn supplied_owner(&self) -> CapabilityToken {
        self.owner.unwrap_or(CapabilityToken::Public)
    }

    pub(crate) fn supplied_role(&self, role: Role) -> CapabilityToken {
        match role {
            Role::Owner => self.owner.or(self.role),
            Role::Read | Role::Write => self.role,
        }
        .unwrap_or(CapabilityToken::Public)
    }
}

/// Refusal returned by a [`TokenAuthority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capability check failed")]
pub struct AccessDenied {
    /// Machine-readable refusal reason.
    pub reason: &'static str,
}

/// Issues tokens and validates caller-presented tokens.
pub trait TokenAuthority: Send + Sync {
    /// Mint a fresh, unguessable token.
    fn create_token(&self) -> CapabilityToken;

    /// Fill in missing members of a triple with freshly minted tokens.
    fn create_token_triple(
        &self,
        owner: Option<CapabilityToken>,
        read: Option<CapabilityToken>,
        write: Option<CapabilityToken>,
    ) -> TokenTriple {
        TokenTriple {
            owner: owner.unwrap_or_else(|| self.create_token()),
            read: read.unwrap_or_else(|| self.create_token()),
            write: write.unwrap_or_else(|| self.create_token()),
        }
    }

    /// Validate supplied tokens against the recorded ones for a role.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] when the supplied tokens are insufficient.
    fn allow_access(
        &self,
        recorded_owner: CapabilityToken,
        recorded_role: CapabilityToken,
        supplied_owner: CapabilityToken,
        supplied_role: CapabilityToken,
    ) -> Result<(), AccessDenied>;
}

/// Default authority minting random UUID tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityAuthority;

impl TokenAuthority for CapabilityAuthority {
    fn create_token(&self) -> CapabilityToken {
        CapabilityToken::Issued(Uuid::new_v4())
    }

    fn allow_access(
        &self,
        recorded_owner: CapabilityToken,
        recorded_role: CapabilityToken,
        supplied_owner: CapabilityToken,
        supplied_role: CapabilityToken,
    ) -> Result<(), AccessDenied> {
        if supplied_owner != CapabilityToken::Blocked
            && recorded_owner != CapabilityToken::Blocked
            && supplied_owner == recorded_owner
        {
            return Ok(());
        }
        match (recorded_role, supplied_role) {
            (_, CapabilityToken::Blocked) => Err(AccessDenied {
                reason: "blocked token presented",
            }),
            (CapabilityToken::Blocked, _) => Err(AccessDenied {
                reason: "role is blocked",
            }),
            (CapabilityToken::Public, _) => Ok(()),
            (recorded, supplied) if recorded == supplied => Ok(()),
            _ => Err(AccessDenied {
                reason: "token mismatch",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued() -> CapabilityToken {
        CapabilityAuthority.create_token()
    }

    #[test]
    fn triple_fills_only_missing_members() {
        let read = issued();
        let triple = CapabilityAuthority.create_token_triple(None, Some(read), None);
        assert_eq!(triple.read, read);
        assert!(matches!(triple.owner, CapabilityToken::Issued(_)));
        assert_ne!(triple.owner, triple.write);
    }

    #[test]
    fn owner_token_satisfies_every_role() {
        let owner = issued();
        let read = issued();
        assert!(CapabilityAuthority
            .allow_access(owner, read, owner, CapabilityToken::Public)
            .is_ok());
    }

    #[test]
    fn blocked_never_grants() {
        let owner = issued();
        let err = CapabilityAuthority
            .allow_access(
                owner,
                CapabilityToken::Public,
                CapabilityToken::Blocked,
                CapabilityToken::Blocked,
            )
            .expect_err("blocked must fail");
        assert_eq!(err.reason, "blocked token presented");

        let err = CapabilityAuthority
            .allow_access(
                CapabilityToken::Blocked,
                CapabilityToken::Blocked,
                CapabilityToken::Blocked,
                CapabilityToken::Public,
            )
            .expect_err("blocked role must fail even for a blocked owner");
        assert_eq!(err.reason, "role is blocked");
    }

    #[test]
    fn public_role_admits_anonymous_callers() {
        let access = Access::public();
        assert!(CapabilityAuthority
            .allow_access(
                issued(),
                CapabilityToken::Public,
                access.supplied_owner(),
                access.supplied_role(Role::Read),
            )
            .is_ok());
    }

    #[test]
    fn mismatched_role_token_is_refused() {
        let read = issued();
        let other = issued();
        assert!(CapabilityAuthority
            .allow_access(issued(), read, CapabilityToken::Public, other)
            .is_err());
        assert!(CapabilityAuthority
            .allow_access(issued(), read, CapabilityToken::Public, read)
            .is_ok());
    }

    #[test]
    fn owner_role_accepts_owner_from_either_slot() {
        let owner = issued();
        assert_eq!(Access::role(owner).supplied_role(Role::Owner), owner);
        assert_eq!(Access::owner(owner).supplied_role(Role::Owner), owner);
        assert_eq!(
            Access::owner(owner).supplied_role(Role::Write),
            CapabilityToken::Public
        );
    }
}
