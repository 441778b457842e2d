//! The authorization gate consulted before a session opens.
//!
//! Authentication itself happens elsewhere; the gateway only sees the principal name the
//! handshake carried (if any) and asks an [`Authorizer`] whether that principal may open a
//! session on the endpoint.
use std::collections::{HashMap, HashSet};

/// Decides whether a principal may open a session.
pub trait Authorizer: Send + Sync {
    /// `principal` is `None` for anonymous peers.
    fn is_authorized(&self, principal: Option<&str>) -> bool;
}

/// Lets every peer in, anonymous ones included.
#[derive(Debug, Default, Copy, Clone)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _principal: Option<&str>) -> bool {
        true
    }
}

/// A read-only mapping from principal names to their roles.
#[derive(Debug, Default, Clone)]
pub struct PrincipalRoles {
    roles: HashMap<String, HashSet<String>>,
}

impl PrincipalRoles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `roles` to `principal`, in addition to any it already has.
    pub fn with_principal<I, R>(mut self, principal: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles
            .entry(principal.into())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    /// The roles granted to `principal`, if it is known.
    pub fn roles(&self, principal: &str) -> Option<&HashSet<String>> {
        self.roles.get(principal)
    }

    pub fn has_role(&self, principal: &str, role: &str) -> bool {
        self.roles
            .get(principal)
            .is_some_and(|roles| roles.contains(role))
    }
}

/// Admits only principals holding a given role; anonymous peers are refused.
#[derive(Debug, Clone)]
pub struct RequireRole {
    roles: PrincipalRoles,
    role: String,
}

impl RequireRole {
    pub fn new(roles: PrincipalRoles, role: impl Into<String>) -> Self {
        Self {
            roles,
            role: role.into(),
        }
    }
}

impl Authorizer for RequireRole {
    fn is_authorized(&self, principal: Option<&str>) -> bool {
        principal.is_some_and(|principal| self.roles.has_role(principal, &self.role))
    }
}
