// src/output.rs

//! Rendering of daemon output for a terminal
//!
//! The daemon forwards the text its package engine prints together with
//! formatting hints. These helpers turn the hints into the escape
//! sequences a terminal emulator expects.

use crate::bus::{OutputLevel, OutputLine};

const RESET: &str = "\x1b[0m";
const DARK_GREEN: &str = "\x1b[32m";
const BROWN: &str = "\x1b[33m";
const DARK_RED: &str = "\x1b[31m";
const RED: &str = "\x1b[31;01m";
const BLUE: &str = "\x1b[34;01m";
/// Erase the whole current line
const CLEAR_LINE: &str = "\x1b[2K";

fn paint(color: &str, text: &str) -> String {
    format!("{}{}{}", color, text, RESET)
}

/// Format one `output` notification as terminal bytes
pub fn format_output(line: &OutputLine) -> String {
    if line.raw {
        return line.text.replace('\n', "\r\n");
    }

    let marker = match line.level {
        OutputLevel::Info => paint(DARK_GREEN, ">>"),
        OutputLevel::Warning => paint(BROWN, ">>"),
        OutputLevel::Error => paint(DARK_RED, ">>"),
    };

    let mut counter = String::new();
    if line.count_current != 0 || line.count_total != 0 {
        if line.percent {
            if line.count_total > 0 {
                let fraction = line.count_current as f64 / line.count_total as f64;
                counter = format!(" ({:.1}%) ", fraction * 100.0);
            }
        } else {
            counter = format!(
                " ({}/{}) ",
                paint(RED, &line.count_current.to_string()),
                paint(BLUE, &line.count_total.to_string())
            );
        }
    }

    let mut rendered = format!(
        "{}\r{} {}{}{}{}",
        CLEAR_LINE, marker, line.header, counter, line.text, line.footer
    );
    if !line.back {
        rendered.push_str("\r\n");
    }
    rendered
}

/// Progress bar update for a `transfer_output` notification
///
/// `total` is in kB; text is only produced for transfers above 1 kB.
pub fn format_transfer(
    average: u32,
    downloaded: u64,
    total: f64,
    rate: u64,
    eta: &str,
) -> (f64, Option<String>) {
    let fraction = f64::from(average.min(100)) / 100.0;
    let total = (total * 10.0).round() / 10.0;

    let text = (total > 1.0).then(|| {
        format!(
            "{:.1}/{} kB @ {}/sec, {}",
            downloaded as f64 / 1024.0,
            total,
            bytes_into_human(rate),
            eta
        )
    });
    (fraction, text)
}

/// Short human-readable size: `512b`, `1.5kB`, `2.3MB`
pub fn bytes_into_human(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{}b", bytes);
    }
    let kb = round1(bytes as f64 / 1024.0);
    if bytes < 1_023_999 {
        format!("{:.1}kB", kb)
    } else {
        format!("{:.1}MB", round1(kb / 1024.0))
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_into_human() {
        assert_eq!(bytes_into_human(0), "0b");
        assert_eq!(bytes_into_human(1023), "1023b");
        assert_eq!(bytes_into_human(1536), "1.5kB");
        assert_eq!(bytes_into_human(1_023_998), "1000.0kB");
        assert_eq!(bytes_into_human(5 * 1024 * 1024), "5.0MB");
    }

    #[test]
    fn test_format_output_line() {
        let line = OutputLine {
            text: "Installing foo".to_string(),
            header: "[main] ".to_string(),
            count_current: 2,
            count_total: 5,
            ..Default::default()
        };
        let rendered = format_output(&line);
        assert!(rendered.starts_with("\x1b[2K\r"));
        assert!(rendered.contains("[main] "));
        assert!(rendered.contains("\x1b[31;01m2\x1b[0m"));
        assert!(rendered.ends_with("Installing foo\r\n"));
    }

    #[test]
    fn test_format_output_percent_and_back() {
        let line = OutputLine {
            text: "fetching".to_string(),
            count_current: 1,
            count_total: 4,
            percent: true,
            back: true,
            level: OutputLevel::Warning,
            ..Default::default()
        };
        let rendered = format_output(&line);
        assert!(rendered.contains(" (25.0%) "));
        assert!(rendered.contains("\x1b[33m>>"));
        assert!(!rendered.ends_with("\r\n"));
    }

    #[test]
    fn test_format_output_raw() {
        let line = OutputLine {
            text: "a\nb".to_string(),
            raw: true,
            ..Default::default()
        };
        assert_eq!(format_output(&line), "a\r\nb");
    }

    #[test]
    fn test_format_transfer() {
        let (fraction, text) = format_transfer(50, 2048, 4.0, 1536, "3s");
        assert!((fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(text.unwrap(), "2.0/4 kB @ 1.5kB/sec, 3s");

        let (_, text) = format_transfer(10, 10, 0.5, 10, "1s");
        assert!(text.is_none());
    }
}
