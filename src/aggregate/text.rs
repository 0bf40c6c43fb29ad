//! # Text Exposition
//!
//! Renders aggregated families in the Prometheus text format. Families
//! arrive name-sorted from the aggregator and samples arrive in their
//! deterministic merge order, so the output is stable scrape to scrape.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::MetricFamily;

/// Render families as a Prometheus text-format document.
pub fn render_text(families: &BTreeMap<String, MetricFamily>) -> String {
    // Lines run ~100 bytes; one guess saves most of the reallocation.
    let total_samples: usize = families.values().map(|f| f.samples.len()).sum();
    let mut out = String::with_capacity(128 * (total_samples + 2 * families.len()));

    for family in families.values() {
        let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.metric_type.as_str());

        for sample in &family.samples {
            out.push_str(&sample.name);

            if !sample.labels.is_empty() {
                out.push('{');
                for (i, (name, value)) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }

            let _ = writeln!(out, " {}", format_value(sample.value));
        }
    }

    out
}

/// Escape a label value per the exposition format: backslash, quote, and
/// newline.
fn escape_label_value(value: &str) -> String {
    if !value.contains(['\\', '"', '\n']) {
        return value.to_string();
    }

    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Prometheus renders whole floats without a trailing `.0` and spells out
/// the IEEE specials.
fn format_value(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{value}")
    }
}
