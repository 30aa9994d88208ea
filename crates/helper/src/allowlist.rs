//! The helper's own command table.
//!
//! This list is compiled into the daemon and consulted on every request. It
//! is intentionally independent of the catalog shipped with the app: the
//! daemon never receives a program path over the socket, only a capability
//! id, and a client that has been tampered with cannot widen what runs here.
//! Argument vectors are fixed; the few operations that take a value receive
//! it through a validated positional slot.

/// One element of a fixed argument vector.
#[derive(Debug)]
pub enum Arg {
    Literal(&'static str),
    /// Filled from the request's positional values after validation. No
    /// current table entry takes one; the machinery stays so adding a
    /// parameterized operation is a table edit, not a protocol change.
    #[allow(dead_code)]
    Slot,
}

#[derive(Debug)]
pub struct HelperCommand {
    pub capability_id: &'static str,
    pub program: &'static str,
    pub args: &'static [Arg],
    /// Hard ceiling regardless of what the request asks for.
    pub max_timeout_secs: u64,
}

static COMMANDS: &[HelperCommand] = &[
    HelperCommand {
        capability_id: "quick.dns.responder",
        program: "/usr/bin/killall",
        args: &[Arg::Literal("-HUP"), Arg::Literal("mDNSResponder")],
        max_timeout_secs: 30,
    },
    HelperCommand {
        capability_id: "quick.memory.purge",
        program: "/usr/sbin/purge",
        args: &[],
        max_timeout_secs: 300,
    },
    HelperCommand {
        capability_id: "deep.spotlight.reindex",
        program: "/usr/bin/mdutil",
        args: &[Arg::Literal("-E"), Arg::Literal("/")],
        max_timeout_secs: 120,
    },
    HelperCommand {
        capability_id: "deep.system.temp",
        program: "/bin/rm",
        args: &[Arg::Literal("-rf"), Arg::Literal("/private/var/tmp/tuneup-staging")],
        max_timeout_secs: 600,
    },
];

pub fn lookup(capability_id: &str) -> Option<&'static HelperCommand> {
    COMMANDS.iter().find(|c| c.capability_id == capability_id)
}

/// Assemble the final argument vector from the fixed template and the
/// request's positional slot values. The value count must match exactly and
/// values must be plain printable text.
pub fn build_argv(command: &HelperCommand, values: &[String]) -> Result<Vec<String>, String> {
    let slot_count = command
        .args
        .iter()
        .filter(|a| matches!(a, Arg::Slot))
        .count();
    if values.len() != slot_count {
        return Err(format!(
            "expected {} argument value(s), got {}",
            slot_count,
            values.len()
        ));
    }
    for value in values {
        if value.is_empty() || value.len() > 1024 {
            return Err("argument value length out of range".into());
        }
        if value.chars().any(|c| c.is_control()) {
            return Err("argument value contains control characters".into());
        }
    }

    let mut next_value = values.iter();
    Ok(command
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Literal(lit) => (*lit).to_string(),
            Arg::Slot => next_value
                .next()
                .cloned()
                .unwrap_or_default(),
        })
        .collect())
}
