//! Size strings and megabyte conversions.
//!
//! Parsing follows the usual human conventions: bare and SI suffixes
//! (`k`, `MB`, `G`) are powers of 1000, IEC suffixes (`KiB`, `Mi`, `GiB`) are
//! powers of 1024. Megabyte values used on the QEMU command line are always
//! mebibytes, rounded up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Bytes in one mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// A memory or disk size, either already in megabytes or still in its
/// human-readable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size {
    /// Size in mebibytes.
    Megabytes(u64),
    /// Unparsed size string such as `"10G"` or `"512MiB"`.
    Text(String),
}

impl Size {
    /// Resolves the size to mebibytes.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidSize`] if the text form cannot be parsed.
    pub fn to_mb(&self) -> Result<u64, CoreError> {
        match self {
            Self::Megabytes(mb) => Ok(*mb),
            Self::Text(text) => parse_mb(text),
        }
    }
}

impl From<u64> for Size {
    fn from(mb: u64) -> Self {
        Self::Megabytes(mb)
    }
}

impl From<&str> for Size {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Size {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Megabytes(mb) => f.write_str(&format_mb(*mb)),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Parses a size string into bytes.
///
/// # Errors
/// Returns [`CoreError::InvalidSize`] for empty input, a missing or
/// malformed number, an unknown unit, or a value that overflows `u64`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_bytes(input: &str) -> Result<u64, CoreError> {
    let invalid = |reason: &str| CoreError::InvalidSize {
        input: input.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    if number.is_empty() {
        return Err(invalid("missing number"));
    }
    let value: f64 = number.parse().map_err(|_| invalid("malformed number"))?;
    let multiplier = unit_multiplier(&unit.trim().to_ascii_lowercase())
        .ok_or_else(|| invalid("unknown unit"))?;

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid("too large"));
    }
    Ok(bytes as u64)
}

/// Parses a size string and rounds it up to whole mebibytes.
///
/// # Errors
/// Returns [`CoreError::InvalidSize`] if the string cannot be parsed.
pub fn parse_mb(input: &str) -> Result<u64, CoreError> {
    parse_bytes(input).map(bytes_to_mb)
}

#[allow(clippy::cast_precision_loss)]
fn unit_multiplier(unit: &str) -> Option<f64> {
    let m: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "ki" | "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mi" | "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gi" | "gib" => 1 << 30,
        "t" | "tb" => 1_000_000_000_000,
        "ti" | "tib" => 1 << 40,
        "p" | "pb" => 1_000_000_000_000_000,
        "pi" | "pib" => 1 << 50,
        _ => return None,
    };
    Some(m as f64)
}

/// Converts bytes to mebibytes, rounding up.
#[must_use]
pub const fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

/// Converts mebibytes to bytes, saturating at `u64::MAX`.
#[must_use]
pub const fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(MIB)
}

/// Formats mebibytes the way QEMU's `-m` flag expects them.
#[must_use]
pub fn format_mb(mb: u64) -> String {
    format!("{mb}M")
}

/// Formats a byte count with SI prefixes, e.g. `2.5 GB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const PREFIXES: [&str; 7] = ["", "k", "M", "G", "T", "P", "E"];

    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1000.0 && idx < PREFIXES.len() - 1 {
        value /= 1000.0;
        idx += 1;
    }
    let rendered = format!("{value:.2}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered} {}B", PREFIXES[idx])
}
