use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Opaque identifier for one control-flow edge inside the instrumented target.
///
/// Produced only by the execution runner; the tracker never interprets its
/// internal meaning beyond equality and ordering.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct CoverageId(pub u64);

impl std::fmt::Display for CoverageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a seed's call sequence. The core only counts names; it never
/// models what the call does inside the target library.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub name: String,
}

impl CallDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One candidate API-call-sequence program plus its provenance metadata.
///
/// A seed is owned by the corpus store once accepted and is immutable after
/// acceptance, except for metadata recompute during minimization.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Seed {
    /// Monotonic identifier, mirrors the `<ID>` field of the artifact header.
    pub id: u64,
    /// Ordered call descriptors derived from the program text.
    pub sequence: Vec<CallDescriptor>,
    /// The replayable program text, opaque to the tracker.
    pub program: String,
    /// Optional grouping tags, mirrors `<Combination>`.
    pub combination: Vec<String>,
    /// Optional free-text origin marker, mirrors `<Prompt>`.
    pub prompt: Option<String>,
    /// Pinned seeds bypass the unique-coverage acceptance gate and survive
    /// minimization (regression seeds).
    pub pinned: bool,
}

impl Seed {
    /// Builds a seed from raw program text, deriving the call sequence with a
    /// lexical scan for `identifier(` call sites.
    pub fn from_program_text(id: u64, program: impl Into<String>) -> Self {
        let program = program.into();
        let sequence = extract_call_names(&program)
            .into_iter()
            .map(CallDescriptor::new)
            .collect();
        Self {
            id,
            sequence,
            program,
            combination: Vec::new(),
            prompt: None,
            pinned: false,
        }
    }

    pub fn with_combination(mut self, tags: Vec<String>) -> Self {
        self.combination = tags;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.sequence.len()
    }

    /// Per-call-name histogram over the sequence.
    pub fn call_histogram(&self) -> BTreeMap<String, u64> {
        let mut histogram = BTreeMap::new();
        for call in &self.sequence {
            *histogram.entry(call.name.clone()).or_insert(0) += 1;
        }
        histogram
    }
}

/// Quality annotation computed by the scorer and stored alongside its seed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QualityMetrics {
    /// Newly discovered ids / sequence length, 0.0 for empty sequences.
    pub density: f64,
    /// Count of coverage ids this seed introduced to the branch universe.
    pub unique_branches: u64,
    /// The ids behind `unique_branches`, kept so the header and the
    /// minimizer can replay the discovery.
    pub new_ids: BTreeSet<CoverageId>,
    /// Per-call-name histogram over the seed's sequence.
    pub library_calls: BTreeMap<String, u64>,
    /// Call names matching the configured critical allow-list.
    pub critical_calls: BTreeSet<String>,
    /// True iff the seed discovered coverage or was explicitly re-run.
    pub visited: bool,
}

// Identifiers that look like calls but are control flow or operators.
const NON_CALL_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "return", "sizeof", "alignof", "typeid", "decltype",
    "static_assert", "catch", "do", "else", "new", "delete", "defined", "case", "throw",
];

fn is_non_call_keyword(word: &str) -> bool {
    NON_CALL_KEYWORDS.contains(&word)
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Lexically extracts call-site names (`identifier(`) from program text,
/// skipping comments and string/char literals. The result is a best-effort
/// replica of the program's call order; names are never interpreted.
pub fn extract_call_names(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            byte if is_ident_start(byte) => {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                let word = &text[start..i];
                let mut next = i;
                while next < bytes.len() && (bytes[next] == b' ' || bytes[next] == b'\t') {
                    next += 1;
                }
                if next < bytes.len() && bytes[next] == b'(' && !is_non_call_keyword(word) {
                    calls.push(word.to_string());
                }
            }
            _ => i += 1,
        }
    }
    calls
}
