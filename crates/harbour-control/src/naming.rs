//! Hostname and subdomain validation.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ControlError, ControlResult};

/// Minimum length for a site subdomain.
pub const MIN_SUBDOMAIN_LENGTH: usize = 3;

/// Maximum length for a DNS label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Maximum length for a full hostname.
pub const MAX_HOSTNAME_LENGTH: usize = 253;

/// A single lowercase DNS label.
static LABEL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").ok());

fn label_pattern() -> ControlResult<&'static Regex> {
    LABEL_PATTERN
        .as_ref()
        .ok_or_else(|| ControlError::internal("hostname validation unavailable"))
}

/// Validate a site subdomain.
///
/// A subdomain is one DNS label of 3 to 63 lowercase letters, digits or
/// hyphens, not starting or ending with a hyphen.
pub fn validate_subdomain(subdomain: &str) -> ControlResult<()> {
    if subdomain.len() < MIN_SUBDOMAIN_LENGTH {
        return Err(ControlError::validation(format!(
            "subdomain must be at least {MIN_SUBDOMAIN_LENGTH} characters"
        )));
    }

    if subdomain.len() > MAX_LABEL_LENGTH {
        return Err(ControlError::validation(format!(
            "subdomain exceeds maximum length of {MAX_LABEL_LENGTH} characters"
        )));
    }

    if !label_pattern()?.is_match(subdomain) {
        return Err(ControlError::validation(format!(
            "subdomain {subdomain:?} may only contain lowercase letters, digits and inner hyphens"
        )));
    }

    Ok(())
}

/// Validate a fully qualified hostname.
pub fn validate_hostname(hostname: &str) -> ControlResult<()> {
    if hostname.is_empty() {
        return Err(ControlError::validation("hostname cannot be empty"));
    }

    if hostname.len() > MAX_HOSTNAME_LENGTH {
        return Err(ControlError::validation(format!(
            "hostname exceeds maximum length of {MAX_HOSTNAME_LENGTH} characters"
        )));
    }

    let pattern = label_pattern()?;
    for label in hostname.split('.') {
        if label.len() > MAX_LABEL_LENGTH || !pattern.is_match(label) {
            return Err(ControlError::validation(format!(
                "invalid hostname: {hostname}"
            )));
        }
    }

    Ok(())
}
