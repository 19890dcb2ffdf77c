//! Hierarchy policy: who may administer which role

use serde::{Deserialize, Serialize};

use crate::directory::Principal;
use crate::registry::RoleId;

/// Authority level of a role. Lower means more authority; never zero.
pub type Level = u32;

/// Whether a role at `acting` may administer (edit or assign) a role at `target`.
///
/// Strict: equal levels never administer each other.
#[inline]
pub const fn can_administer(acting: Level, target: Level) -> bool {
    acting < target
}

/// Whoever is asking for a role edit or assignment.
///
/// The super-admin flag is resolved here so [`can_administer`] stays a plain
/// comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: Option<RoleId>,
    #[serde(default)]
    pub super_admin: bool,
}

impl Actor {
    /// An actor acting through the given role.
    pub fn role(role: impl Into<RoleId>) -> Self {
        Actor { role: Some(role.into()), super_admin: false }
    }

    pub fn super_admin() -> Self {
        Actor { role: None, super_admin: true }
    }
}

impl From<&Principal> for Actor {
    fn from(p: &Principal) -> Self {
        Actor { role: p.assigned_role.clone(), super_admin: p.super_admin }
    }
}
