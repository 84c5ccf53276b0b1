//! Query parameter parsing shared by the views

use advisor_core::AdvisorError;
use serde::{Deserialize, Serialize};

/// Parse a boolean query flag; absent flags are `false`
pub fn parse_bool_param(name: &str, raw: Option<&str>) -> Result<bool, AdvisorError> {
    match raw {
        None | Some("") => Ok(false),
        Some(value) => parse_bool(value).ok_or_else(|| {
            AdvisorError::parsing(name, value, "expected a boolean value")
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Which rules the recommendation list returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactingFlag {
    /// Every external rule
    #[default]
    All,
    /// Only rules hitting at least one cluster
    OnlyImpacting,
    /// Only rules hitting no cluster
    ExcludingImpacting,
}

impl ImpactingFlag {
    /// Read the `impacting` query parameter
    pub fn from_query(raw: Option<&str>) -> Result<Self, AdvisorError> {
        match raw {
            None => Ok(ImpactingFlag::All),
            Some(value) => match parse_bool(value) {
                Some(true) => Ok(ImpactingFlag::OnlyImpacting),
                Some(false) => Ok(ImpactingFlag::ExcludingImpacting),
                None => Err(AdvisorError::parsing(
                    "impacting",
                    value,
                    "expected a boolean value",
                )),
            },
        }
    }
}

/// Options of the single report view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportOptions {
    /// Include rules hidden by overridable suppressions
    pub include_disabled: bool,
    /// Treat the cluster as managed
    pub managed: bool,
}
