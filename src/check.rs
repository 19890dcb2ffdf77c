//! Permission checks (read-only, snapshot only)

use crate::directory::Principal;

/// Whether `principal` may perform `capability`.
///
/// Super admins pass unconditionally. Everyone else is answered from their
/// snapshot alone: a missing snapshot, a missing key or a capability name the
/// vocabulary does not know all deny. Never errors.
#[inline]
pub fn has_capability(principal: &Principal, capability: impl AsRef<str>) -> bool {
    if principal.super_admin {
        return true;
    }
    principal
        .snapshot
        .as_ref()
        .and_then(|s| s.capabilities.get(capability.as_ref()))
        .copied()
        .unwrap_or(false)
}

/// Whether `principal` holds every capability in `required`.
pub fn has_all<C: AsRef<str>>(principal: &Principal, required: &[C]) -> bool {
    required.iter().all(|c| has_capability(principal, c))
}
