//! Human size parsing, normalized to MiB.

use crate::error::{Error, Result};

/// Parse a size such as `4096`, `512M`, `4G`, `2GiB` or `1T` into MiB.
///
/// A bare number is MiB. `K` values must add up to whole MiB.
pub fn parse_mib(what: &str, input: &str) -> Result<u64> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    if num.is_empty() {
        return Err(Error::invalid(what, format!("'{}' is not a size", input)));
    }
    let n: u64 = num
        .parse()
        .map_err(|_| Error::invalid(what, format!("'{}' is too large", input)))?;

    let unit = suffix.trim().to_ascii_uppercase();
    let unit = match unit.strip_suffix("IB").or_else(|| unit.strip_suffix('B')) {
        Some("") => {
            return Err(Error::invalid(
                what,
                format!("'{}' needs a unit prefix (K, M, G or T)", input),
            ))
        }
        Some(prefix) => prefix,
        None => unit.as_str(),
    };
    let mib = match unit {
        "" | "M" => Some(n),
        "K" => {
            if n % 1024 != 0 {
                return Err(Error::invalid(
                    what,
                    format!("'{}' is not a whole number of MiB", input),
                ));
            }
            Some(n / 1024)
        }
        "G" => n.checked_mul(1024),
        "T" => n.checked_mul(1024 * 1024),
        _ => {
            return Err(Error::invalid(
                what,
                format!("unknown size suffix in '{}' (use K, M, G or T)", input),
            ))
        }
    }
    .ok_or_else(|| Error::invalid(what, format!("'{}' is too large", input)))?;

    if mib == 0 {
        return Err(Error::invalid(what, "size must be greater than zero"));
    }
    Ok(mib)
}

/// Render MiB compactly (`4G`, `1536M`).
pub fn format_mib(mib: u64) -> String {
    if mib >= 1024 * 1024 && mib % (1024 * 1024) == 0 {
        format!("{}T", mib / (1024 * 1024))
    } else if mib >= 1024 && mib % 1024 == 0 {
        format!("{}G", mib / 1024)
    } else {
        format!("{}M", mib)
    }
}

/// Render a byte count with binary units, one decimal place.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
