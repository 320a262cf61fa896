//! Pre-decode memory guard.
//!
//! Decoding a large source can blow past the process budget before the
//! codec reports anything, so the engine estimates the requirement from the
//! header dimensions and refuses up front.

use crate::error::{AppError, Result};

/// Bytes-per-pixel estimate for a decoded frame plus working buffers.
const DECODE_BYTES_PER_PIXEL: u64 = 5;

/// Parse a `-1 | <n>[K|M|G]` memory limit string (factors of 1024).
/// None means unbounded.
pub fn parse_memory_limit(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-1" {
        return None;
    }
    let (digits, factor) = match trimmed.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some(b'M') | Some(b'm') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some(b'G') | Some(b'g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * factor)
}

/// Resident set size of this process, when the platform exposes it.
pub fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // statm reports pages; the kernel page size on every supported
        // target here is 4 KiB.
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Fail before decoding when the estimated requirement does not fit the
/// remaining budget. Skipped entirely when the limit is unbounded or the
/// current usage cannot be observed.
pub fn check_decode_budget(width: u32, height: u32, limit: Option<u64>) -> Result<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let Some(usage) = current_rss_bytes() else {
        return Ok(());
    };
    let required = width as u64 * height as u64 * DECODE_BYTES_PER_PIXEL;
    let available = limit.saturating_sub(usage);
    if required > available {
        return Err(AppError::InsufficientMemory {
            required,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_limits() {
        assert_eq!(parse_memory_limit("512"), Some(512));
        assert_eq!(parse_memory_limit("64K"), Some(64 * 1024));
        assert_eq!(parse_memory_limit("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2g"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn unbounded_and_garbage_limits() {
        assert_eq!(parse_memory_limit("-1"), None);
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("lots"), None);
    }

    #[test]
    fn unbounded_budget_always_passes() {
        assert!(check_decode_budget(100_000, 100_000, None).is_ok());
    }

    #[test]
    fn tiny_budget_rejects_large_frames() {
        // A 1-byte limit cannot fit any frame once usage is subtracted.
        if current_rss_bytes().is_some() {
            assert!(matches!(
                check_decode_budget(10_000, 10_000, Some(1)),
                Err(AppError::InsufficientMemory { .. })
            ));
        }
    }
}
