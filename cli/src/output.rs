//! Output formatting utilities for CLI commands

use crate::report::Summary;
use colored::Colorize;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.6}", v)
    }
}

/// Colour a value by sign, for diffs.
fn signed(v: f64) -> String {
    let text = format_value(v);
    if v > 0.0 {
        format!("+{}", text).red().to_string()
    } else if v < 0.0 {
        text.green().to_string()
    } else {
        text.dimmed().to_string()
    }
}

/// Print one attribute's roll-up table.
pub fn print_summary(summary: &Summary, top: usize, as_diff: bool) {
    let fmt = |v: f64| if as_diff { signed(v) } else { format_value(v) };

    println!(
        "\n{} {} ({}/{})",
        "==".bold(),
        summary.attr.bold(),
        summary.per_entry,
        summary.rollup
    );
    if !summary.description.is_empty() {
        println!("   {}", summary.description.dimmed());
    }
    match summary.total {
        Some(total) => println!("   total: {}", fmt(total)),
        None => {
            println!("   {}", "no data".dimmed());
            return;
        }
    }

    println!("\n  {:>14}  {}", "FILE".bold(), "");
    for row in summary.files.iter().take(top) {
        println!("  {:>14}  {}", fmt(row.value), row.name);
    }
    println!("\n  {:>14}  {}", "FUNCTION".bold(), "");
    for row in summary.functions.iter().take(top) {
        println!("  {:>14}  {}", fmt(row.value), row.name.cyan());
    }
    if summary.functions.len() > top {
        println!(
            "  {}",
            format!("... {} more", summary.functions.len() - top).dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(3.0), "3");
        assert_eq!(format_value(-12.0), "-12");
        assert_eq!(format_value(0.5), "0.500000");
    }
}
