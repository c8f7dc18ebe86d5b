//! Human-readable disk size parsing.

use crate::error::ConfigError;

/// Smallest disk the guest image can boot from.
pub const MINIMUM_DISK_SIZE_MB: u64 = 2000;

const MB: u64 = 1000 * 1000;

/// Convert `<number>[<unit>]` to megabytes using decimal units.
///
/// Units are `b`, `k`, `m`, `g` and `t` (case-insensitive, an optional
/// trailing `b` is accepted, so `20gb` equals `20g`). A bare number is a
/// byte count. Fractions are allowed: `1.5g` is 1500 MB.
pub fn parse_disk_size_mb(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidDiskSize(input.to_string());

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number.parse().map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }

    let unit = unit.trim().to_ascii_lowercase();
    let multiplier: u64 = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => MB,
        "g" | "gb" => 1000 * MB,
        "t" | "tb" => 1000 * 1000 * MB,
        _ => return Err(invalid()),
    };

    let bytes = number * multiplier as f64;
    Ok((bytes / MB as f64) as u64)
}
