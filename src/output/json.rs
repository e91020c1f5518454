//! JSON output

use crate::stats::RoundReport;

pub fn output_json(report: &RoundReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}
