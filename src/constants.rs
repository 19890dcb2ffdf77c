//! Defaults and seeded role ids

use std::time::Duration;

// Seeded role ids (bootstrap always creates these)
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_DIRECTOR: &str = "director";
pub const ROLE_MANAGER: &str = "manager";
pub const ROLE_TEAM_LEAD: &str = "team_lead";
pub const ROLE_EMPLOYEE: &str = "employee";
pub const ROLE_GUEST: &str = "guest";

// Propagation
pub const DEFAULT_BATCH_SIZE: usize = 400;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_WORKERS: usize = 4;
// Idle workers sweep pending markers this often
pub const DEFAULT_RESUME_INTERVAL: Duration = Duration::from_secs(30);

// Assignment re-stamps at most this many times when edits keep landing
pub const MAX_ASSIGN_RESTAMPS: usize = 8;

// LMDB
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;
pub const MAX_DBS: u32 = 6;
