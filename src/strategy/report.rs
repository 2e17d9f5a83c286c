use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyError;

/// One entry of a KiCad DRC JSON report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrcItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
struct DrcReport {
    #[serde(default)]
    source: String,
    #[serde(default)]
    violations: Vec<DrcItem>,
    #[serde(default)]
    unconnected_items: Vec<DrcItem>,
    #[serde(default)]
    schematic_parity: Vec<DrcItem>,
}

/// Error and warning counts of one DRC run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrcSummary {
    pub source: String,
    pub errors: Vec<DrcItem>,
    pub warnings: usize,
}

impl DrcSummary {
    /// Parse a report. Items are collected from the violation, unconnected and
    /// schematic-parity sections; severities other than error/warning are ignored.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let report: DrcReport = serde_json::from_str(raw)?;
        let mut summary = DrcSummary {
            source: report.source,
            ..DrcSummary::default()
        };
        let items = report
            .violations
            .into_iter()
            .chain(report.unconnected_items)
            .chain(report.schematic_parity);
        for item in items {
            match item.severity.as_str() {
                "error" => summary.errors.push(item),
                "warning" => summary.warnings += 1,
                _ => {}
            }
        }
        Ok(summary)
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn errors_by_type(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.errors {
            *counts.entry(item.kind.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for DrcSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        if self.passed() {
            write!(f, "PASSED")?;
        } else {
            let n = self.error_count();
            write!(f, "FAILED, {} error{}", n, plural(n))?;
        }
        write!(f, " ({} warning{})", self.warnings, plural(self.warnings))
    }
}

/// Read and summarise a DRC JSON report file.
pub async fn summarize_report(path: &Path) -> Result<DrcSummary, StrategyError> {
    let raw = tokio::fs::read_to_string(path).await?;
    DrcSummary::from_json(&raw).map_err(|e| {
        StrategyError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {}", path.display(), e),
        ))
    })
}
