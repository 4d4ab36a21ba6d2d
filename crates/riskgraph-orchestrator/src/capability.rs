//! Capability tags and analysis selection.
//!
//! Workers are addressed only by the capability they provide; there is no
//! worker type hierarchy.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A risk-analysis capability tag, e.g. `credit` or `market`.
///
/// Tags are trimmed and lowercased on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub const CREDIT: &'static str = "credit";
    pub const MARKET: &'static str = "market";
    pub const OPERATIONAL: &'static str = "operational";
    pub const LIQUIDITY: &'static str = "liquidity";
    pub const REGULATORY: &'static str = "regulatory";
    pub const SYSTEMIC: &'static str = "systemic";

    pub fn new(tag: impl AsRef<str>) -> Self {
        Capability(tag.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The six categories of the reference deployment.
    pub fn well_known() -> [Capability; 6] {
        [
            Capability::new(Self::CREDIT),
            Capability::new(Self::MARKET),
            Capability::new(Self::OPERATIONAL),
            Capability::new(Self::LIQUIDITY),
            Capability::new(Self::REGULATORY),
            Capability::new(Self::SYSTEMIC),
        ]
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability::new(s)
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability::new(s)
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which capabilities a request wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSelection {
    /// Every capability registered in the pool at acceptance time.
    All,
    Only(BTreeSet<Capability>),
}

impl Default for AnalysisSelection {
    fn default() -> Self {
        AnalysisSelection::All
    }
}

impl AnalysisSelection {
    pub fn only<I, C>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        AnalysisSelection::Only(capabilities.into_iter().map(Into::into).collect())
    }

    /// Maps a task-type name to the capabilities it needs.
    ///
    /// `<category>_risk` and `<category>_analysis` select one category,
    /// `comprehensive_risk` selects all six, `default_analysis` is credit.
    /// Unknown task types return `None`.
    pub fn for_task_type(task_type: &str) -> Option<Self> {
        let normalized = task_type.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "comprehensive_risk" | "comprehensive_analysis" => {
                Some(AnalysisSelection::only(Capability::well_known()))
            }
            "default_analysis" => Some(AnalysisSelection::only([Capability::CREDIT])),
            other => {
                let category = other
                    .strip_suffix("_risk")
                    .or_else(|| other.strip_suffix("_analysis"))?;
                Capability::well_known()
                    .into_iter()
                    .find(|c| c.as_str() == category)
                    .map(|c| AnalysisSelection::only([c]))
            }
        }
    }

    /// Resolves the selection against the registered capabilities.
    pub fn resolve(&self, registered: &BTreeSet<Capability>) -> BTreeSet<Capability> {
        match self {
            AnalysisSelection::All => registered.clone(),
            AnalysisSelection::Only(set) => set.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AnalysisSelection::Only(set) if set.is_empty())
    }
}
