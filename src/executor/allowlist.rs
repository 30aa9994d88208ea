//! Static program allowlists, maintained by the execution layer.
//!
//! These lists are intentionally separate from the capability manifest. The
//! manifest says what the product offers; this file says what the executors
//! will ever spawn. Both must agree for a capability to load, so a corrupted
//! or malicious manifest cannot point an executor at a new binary. The
//! privileged helper compiles in its own third copy of the elevated list and
//! re-checks it on every request.

use std::path::Path;

use crate::catalog::PrivilegeTier;

/// Programs the user-tier executor may spawn as the invoking user.
pub const USER_ALLOWLIST: &[&str] = &[
    "/usr/bin/dscacheutil",
    "/usr/bin/du",
    "/usr/bin/find",
    "/usr/bin/killall",
    "/usr/bin/mdutil",
    "/bin/rm",
];

/// Programs the elevated tier may ask the privileged helper to run. The
/// helper holds its own compiled-in copy of this list and re-validates every
/// request against it.
pub const ELEVATED_ALLOWLIST: &[&str] = &[
    "/bin/rm",
    "/usr/bin/killall",
    "/usr/bin/mdutil",
    "/usr/sbin/purge",
    "/usr/bin/dscacheutil",
];

/// The single script runner the automation tier drives. Scripts themselves
/// are fixed per capability; the runner never receives caller text.
pub const AUTOMATION_ALLOWLIST: &[&str] = &["/usr/bin/osascript"];

pub fn is_allowed(tier: PrivilegeTier, program: &Path) -> bool {
    let list = match tier {
        PrivilegeTier::User => USER_ALLOWLIST,
        PrivilegeTier::Elevated => ELEVATED_ALLOWLIST,
        PrivilegeTier::Automation => AUTOMATION_ALLOWLIST,
    };
    program
        .to_str()
        .is_some_and(|p| list.contains(&p))
}
