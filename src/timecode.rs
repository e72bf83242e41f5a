//! H:MM:SS rendering of clip durations, as shown in play logs and digests.

use crate::error::TimecodeError;

/// Round `seconds` up to a whole second and render it as `H:MM:SS`.
///
/// Hours are unbounded, so 100 hours renders as `100:00:00`.
pub fn format_hms(seconds: f64) -> Result<String, TimecodeError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(TimecodeError::Negative);
    }
    let total = seconds.ceil() as u64;
    Ok(format!(
        "{}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    ))
}

/// Parse an `H:MM:SS` string back to a whole number of seconds.
pub fn parse_hms(text: &str) -> Result<u64, TimecodeError> {
    let malformed = || TimecodeError::Malformed(text.to_string());
    let trimmed = text.trim();
    if trimmed.starts_with('-') {
        return Err(TimecodeError::Negative);
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() != 3 || parts[1].len() != 2 || parts[2].len() != 2 {
        return Err(malformed());
    }
    let hours: u64 = parts[0].parse().map_err(|_| malformed())?;
    let minutes: u64 = parts[1].parse().map_err(|_| malformed())?;
    let secs: u64 = parts[2].parse().map_err(|_| malformed())?;
    if minutes >= 60 || secs >= 60 {
        return Err(malformed());
    }
    Ok(hours * 3600 + minutes * 60 + secs)
}
