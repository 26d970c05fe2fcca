//! Actor - identity of whoever is calling the engine
//!
//! Identity and role are resolved by an external authentication layer;
//! the engine trusts the triple but re-validates role membership and the
//! self-approval invariant on every transition.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An authenticated actor performing an action against the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable unique identifier (e.g., login name)
    pub id: String,

    /// Human-readable display name
    pub name: String,

    /// Role name as resolved by the authorization layer
    pub role: String,
}

impl Actor {
    /// Create an actor from resolved identity fields
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
        }
    }

    /// The internal system actor, used for background transitions
    /// (expiry sweeps) that are not attributable to a human operator.
    pub fn system() -> Self {
        Self::new("system", "System", "system")
    }

    /// True for the internal system actor
    pub fn is_system(&self) -> bool {
        self.id == "system"
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}
