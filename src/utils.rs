//! # Utility Functions
//!
//! Small helpers shared by the benchmark modules and the reporting layer:
//! unique naming for OS-level resources, human-readable formatting, and
//! console table output.
//!
//! ## Usage Examples
//!
//! ```rust
//! use perf_suite::utils::*;
//!
//! assert_eq!(format_bytes(2621440), "2.50 MB");
//! assert_eq!(format_value(3.14159, "GOPS"), "3.14 GOPS");
//! ```

use uuid::Uuid;

/// Short unique suffix for named OS resources
///
/// POSIX shared memory and semaphore names are limited to a few dozen
/// characters on some platforms, so this returns only the first eight hex
/// digits of a v4 UUID. Collisions are further avoided by callers mixing in
/// the process id.
pub fn unique_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Name for a POSIX named resource, e.g. `/pf_shm_1234_a1b2c3d4`
pub fn posix_resource_name(kind: &str) -> String {
    format!("/pf_{}_{}_{}", kind, std::process::id() % 10_000, unique_suffix())
}

/// Format bytes in a human-readable way
///
/// Uses binary units (1024-based) with two decimals past the byte range.
///
/// ```rust
/// # use perf_suite::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = *next;
    }
    format!("{:.2} {}", value, unit)
}

/// Format a measured value with its unit
///
/// Very small values keep more precision so sub-microsecond latencies do
/// not collapse to `0.00`.
pub fn format_value(value: f64, unit: &str) -> String {
    let magnitude = value.abs();
    let formatted = if magnitude != 0.0 && magnitude < 0.01 {
        format!("{:.4}", value)
    } else {
        format!("{:.2}", value)
    };
    if unit.is_empty() {
        formatted
    } else {
        format!("{} {}", formatted, unit)
    }
}

/// Print a table row with fixed column widths
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", truncate(column, width), width = width);
    }
    println!();
}

/// Print a `+----+----+` separator matching `print_table_row`
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(width.saturating_sub(1)).collect();
    shortened.push('~');
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_suffix() {
        let a = unique_suffix();
        let b = unique_suffix();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_posix_resource_name_fits_name_max() {
        let name = posix_resource_name("prod");
        assert!(name.starts_with("/pf_prod_"));
        // macOS limits semaphore names to 31 characters
        assert!(name.len() <= 31);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(2621440), "2.50 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(12.346, "MB/s"), "12.35 MB/s");
        assert_eq!(format_value(0.001234, "ms"), "0.0012 ms");
        assert_eq!(format_value(0.0, "us"), "0.00 us");
        assert_eq!(format_value(5.0, ""), "5.00");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long module name", 8), "a very ~");
    }
}
