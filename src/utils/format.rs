//! Human-readable formatting for CLI progress lines.

use std::path::PathBuf;

/// Formats a byte count with one decimal: `512 B`, `1.5 KB`, `22.0 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} {}", UNITS[UNITS.len() - 1])
}

/// Reduces a peer-supplied file name to a single safe path component.
///
/// Directory parts are discarded, `.`/`..` never survive, and anything that
/// is not alphanumeric or one of `.-_ ` is stripped. Falls back to `file`.
pub fn sanitize_file_name(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .last()
        .unwrap_or("");

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_matches(|c| c == '.' || c == ' ');

    if safe.is_empty() {
        PathBuf::from("file")
    } else {
        PathBuf::from(safe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_each_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(150 * 1024), "150.0 KB");
        assert_eq!(format_bytes(22 * 1024 * 1024), "22.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), PathBuf::from("passwd"));
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), PathBuf::from("a.txt"));
    }

    #[test]
    fn sanitize_falls_back_to_file() {
        assert_eq!(sanitize_file_name(".."), PathBuf::from("file"));
        assert_eq!(sanitize_file_name("///"), PathBuf::from("file"));
        assert_eq!(sanitize_file_name("***"), PathBuf::from("file"));
    }

    #[test]
    fn sanitize_keeps_ordinary_names() {
        assert_eq!(
            sanitize_file_name("holiday photo-01.jpg"),
            PathBuf::from("holiday photo-01.jpg")
        );
        assert_eq!(sanitize_file_name(".bashrc"), PathBuf::from("bashrc"));
    }
}
