//! High-level modem operations, grouped by AT command family.
pub mod network;
pub mod sms;

use crate::errors::{Error, Result};

/// Requires an `OK` at a line start somewhere in the response; anything
/// else (including `+CME ERROR:`/`+CMS ERROR:` responses) is a modem
/// failure carrying the verbatim text.
pub(crate) fn ensure_ok(response: &str) -> Result<()> {
    if response.lines().any(|l| l.starts_with("OK")) {
        Ok(())
    } else {
        Err(Error::Modem(response.to_string()))
    }
}

/// Whether the response ended on the `> ` continuation prompt.
pub(crate) fn has_prompt(response: &str) -> bool {
    response.lines().any(|l| l.starts_with("> "))
}

/// The payload of the plain info queries (`AT+CGMI` and friends): the
/// first non-empty line ahead of the `OK` trailer.
pub(crate) fn single_value(response: &str) -> Result<String> {
    ensure_ok(response)?;
    response
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("OK"))
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("expected a value line, got {:?}", response)))
}

/// Destination numbers: optional `+`, then 1..=20 digits. Checked before
/// any I/O happens.
pub(crate) fn validate_destination(number: &str) -> Result<()> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || digits.len() > 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "destination number {:?} must be an optional + followed by 1-20 digits",
            number
        )));
    }
    Ok(())
}
