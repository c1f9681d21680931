//! VM name canonicalization (design §4.H).
//!
//! The canonical name is the only identifier used for hostname, cloud-init
//! and subdomain routing, so it must be DNS-safe and deterministic given the
//! same input.

const MAX_BASE_LEN: usize = 40;

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, collapse runs
/// of `-`, trim leading/trailing `-`, fall back to `"vm"` if empty, and cap
/// at `MAX_BASE_LEN` characters.
///
/// Idempotent: `sanitize(sanitize(s)) == sanitize(s)`.
pub fn sanitize(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut replaced = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            replaced.push(c);
        } else {
            replaced.push('-');
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut last_dash = false;
    for c in replaced.chars() {
        if c == '-' {
            if !last_dash {
                collapsed.push(c);
            }
            last_dash = true;
        } else {
            collapsed.push(c);
            last_dash = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    let base = if trimmed.is_empty() { "vm" } else { trimmed };
    base.chars().take(MAX_BASE_LEN).collect()
}

/// Append a random 4-hex-digit suffix to a sanitized base, e.g.
/// `"my-awesome-vm-a1b2"`. The suffix is generated by the caller's rng so
/// tests can supply deterministic values.
pub fn with_suffix(base: &str, suffix: u16) -> String {
    format!("{base}-{suffix:04x}")
}

/// Random 4-hex-digit suffix in `[0, 0xffff]`.
pub fn random_suffix() -> u16 {
    rand::random()
}
