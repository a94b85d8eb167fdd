//! Codec for the structured annotation header carried at the top of every
//! persisted seed program:
//!
//! ```text
//! //<ID> 12
//! //<Prompt> [free text or empty]
//! /*<Combination>: [ tag1, tag2 ] */
//! //<score> 0.40, nr_unique_branch: 4
//! //<Quality> {"density": 0.4, "unique_branches": {...}, "library_calls": [...], "critical_calls": [...], "visited": 1}
//! ```
//!
//! The body of the seed file (the program text) follows the `<Quality>` line.

use crate::seed::{CoverageId, QualityMetrics, Seed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("seed header is missing the {0} line")]
    MissingField(&'static str),
    #[error("malformed {field} line: {detail}")]
    Malformed {
        field: &'static str,
        detail: String,
    },
    #[error("invalid <Quality> JSON: {0}")]
    Quality(#[from] serde_json::Error),
}

/// The parsed annotation header of one seed file.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedHeader {
    pub id: u64,
    pub prompt: Option<String>,
    pub combination: Vec<String>,
    pub score: f64,
    pub nr_unique_branch: u64,
    pub quality: QualityMetrics,
}

/// Wire form of the `<Quality>` object. `visited` travels as 0/1 and
/// `unique_branches` as `{"count": n, "ids": [...]}` per the artifact
/// convention.
#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct QualityRepr {
    density: f64,
    unique_branches: UniqueBranchesRepr,
    library_calls: Vec<(String, u64)>,
    critical_calls: Vec<String>,
    visited: u8,
}

#[derive(Serialize, Deserialize, Default)]
struct UniqueBranchesRepr {
    count: u64,
    ids: Vec<u64>,
}

impl From<&QualityMetrics> for QualityRepr {
    fn from(metrics: &QualityMetrics) -> Self {
        Self {
            density: metrics.density,
            unique_branches: UniqueBranchesRepr {
                count: metrics.unique_branches,
                ids: metrics.new_ids.iter().map(|id| id.0).collect(),
            },
            library_calls: metrics
                .library_calls
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
            critical_calls: metrics.critical_calls.iter().cloned().collect(),
            visited: u8::from(metrics.visited),
        }
    }
}

impl From<QualityRepr> for QualityMetrics {
    fn from(repr: QualityRepr) -> Self {
        Self {
            density: repr.density,
            unique_branches: repr.unique_branches.count,
            new_ids: repr
                .unique_branches
                .ids
                .into_iter()
                .map(CoverageId)
                .collect::<BTreeSet<_>>(),
            library_calls: repr.library_calls.into_iter().collect::<BTreeMap<_, _>>(),
            critical_calls: repr.critical_calls.into_iter().collect(),
            visited: repr.visited != 0,
        }
    }
}

impl SeedHeader {
    pub fn from_seed(seed: &Seed, metrics: &QualityMetrics) -> Self {
        Self {
            id: seed.id,
            prompt: seed.prompt.clone(),
            combination: seed.combination.clone(),
            // The score reported for a seed is its density.
            score: metrics.density,
            nr_unique_branch: metrics.unique_branches,
            quality: metrics.clone(),
        }
    }

    /// Renders the five header lines, trailing newline included.
    pub fn render(&self) -> String {
        let quality_json = serde_json::to_string(&QualityRepr::from(&self.quality))
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "//<ID> {}\n//<Prompt> [{}]\n/*<Combination>: [ {} ] */\n//<score> {:.2}, nr_unique_branch: {}\n//<Quality> {}\n",
            self.id,
            self.prompt.as_deref().unwrap_or(""),
            self.combination.join(", "),
            self.score,
            self.nr_unique_branch,
            quality_json,
        )
    }

    /// Parses a header from the top of a seed file, returning the header and
    /// the remaining body (the program text).
    pub fn parse(text: &str) -> Result<(Self, &str), HeaderError> {
        let mut id = None;
        let mut prompt = None;
        let mut combination = Vec::new();
        let mut score = None;
        let mut nr_unique_branch = None;
        let mut quality = None;
        let mut body_offset = 0;
        let mut cursor = 0;

        // Offsets come from the inclusive split so CRLF endings count too.
        for raw_line in text.split_inclusive('\n') {
            let line_end = cursor + raw_line.len();
            let trimmed = raw_line.trim();

            if let Some(rest) = trimmed.strip_prefix("//<ID>") {
                id = Some(rest.trim().parse::<u64>().map_err(|e| {
                    HeaderError::Malformed {
                        field: "<ID>",
                        detail: e.to_string(),
                    }
                })?);
            } else if let Some(rest) = trimmed.strip_prefix("//<Prompt>") {
                let inner = bracketed(rest).ok_or(HeaderError::Malformed {
                    field: "<Prompt>",
                    detail: "expected [..]".to_string(),
                })?;
                prompt = (!inner.is_empty()).then(|| inner.to_string());
            } else if let Some(rest) = trimmed.strip_prefix("/*<Combination>:") {
                let inner = bracketed(rest).ok_or(HeaderError::Malformed {
                    field: "<Combination>",
                    detail: "expected [..]".to_string(),
                })?;
                combination = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect();
            } else if let Some(rest) = trimmed.strip_prefix("//<score>") {
                let (score_part, branch_part) =
                    rest.split_once(',').ok_or(HeaderError::Malformed {
                        field: "<score>",
                        detail: "expected `<float>, nr_unique_branch: <integer>`".to_string(),
                    })?;
                score = Some(score_part.trim().parse::<f64>().map_err(|e| {
                    HeaderError::Malformed {
                        field: "<score>",
                        detail: e.to_string(),
                    }
                })?);
                let branch_value = branch_part
                    .trim()
                    .strip_prefix("nr_unique_branch:")
                    .ok_or(HeaderError::Malformed {
                        field: "<score>",
                        detail: "missing nr_unique_branch".to_string(),
                    })?;
                nr_unique_branch = Some(branch_value.trim().parse::<u64>().map_err(|e| {
                    HeaderError::Malformed {
                        field: "<score>",
                        detail: e.to_string(),
                    }
                })?);
            } else if let Some(rest) = trimmed.strip_prefix("//<Quality>") {
                let repr: QualityRepr = serde_json::from_str(rest.trim())?;
                quality = Some(QualityMetrics::from(repr));
                // Everything after this line is program text.
                body_offset = line_end;
                break;
            } else if !trimmed.is_empty() {
                // First non-header line ends the header region.
                break;
            }
            cursor = line_end;
        }

        let header = Self {
            id: id.ok_or(HeaderError::MissingField("<ID>"))?,
            prompt,
            combination,
            score: score.ok_or(HeaderError::MissingField("<score>"))?,
            nr_unique_branch: nr_unique_branch.ok_or(HeaderError::MissingField("<score>"))?,
            quality: quality.ok_or(HeaderError::MissingField("<Quality>"))?,
        };
        Ok((header, &text[body_offset..]))
    }

    /// True if the text plausibly starts with an annotation header.
    pub fn present_in(text: &str) -> bool {
        text.trim_start().starts_with("//<ID>")
    }
}

fn bracketed(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| text[start + 1..end].trim())
}
