//! Synonym-table query expansion.
//!
//! A [`SynonymTable`] maps a phrase (one or more tokens) to related terms,
//! each carrying a confidence weight. [`QueryExpander::expand`] scans the
//! raw question for every phrase in the table, collects the related terms
//! whose weight clears the configured floor, and returns them ordered by
//! weight (then by where their phrase first appeared in the question).
//!
//! Expansion is pure: the same text against the same table always yields
//! the same [`Query`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::embedding::tokenize;
use crate::models::{Metadata, Query};

/// A related term and its confidence weight in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expansion {
    pub term: String,
    pub weight: f64,
}

impl Expansion {
    pub fn new(term: impl Into<String>, weight: f64) -> Self {
        Self {
            term: term.into(),
            weight,
        }
    }
}

/// Phrase → related terms. Keys are stored as normalised token sequences.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    entries: BTreeMap<String, (Vec<String>, Vec<Expansion>)>,
}

const MEDICAL_SYNONYMS: &[(&str, &[&str])] = &[
    ("diabetes", &["diabetes mellitus", "hyperglycemia", "blood sugar disorder"]),
    ("hypertension", &["high blood pressure", "elevated BP", "arterial hypertension"]),
    ("myocardial infarction", &["heart attack", "MI", "cardiac arrest"]),
    ("cerebrovascular accident", &["stroke", "CVA", "brain attack"]),
    ("pneumonia", &["lung infection", "pulmonary infection", "chest infection"]),
    ("asthma", &["bronchial asthma", "reactive airway", "breathing difficulty"]),
    ("depression", &["major depression", "depressive disorder", "mood disorder"]),
    ("anxiety", &["anxiety disorder", "nervousness", "worry", "panic"]),
    ("arthritis", &["joint inflammation", "joint pain", "rheumatoid arthritis"]),
    ("migraine", &["severe headache", "vascular headache", "migraine headache"]),
    ("pain", &["ache", "discomfort", "soreness", "tenderness"]),
    ("fever", &["pyrexia", "elevated temperature", "hyperthermia"]),
    ("fatigue", &["tiredness", "exhaustion", "weakness", "lethargy"]),
    ("nausea", &["queasiness", "stomach upset", "morning sickness"]),
    ("dizziness", &["vertigo", "lightheadedness", "spinning sensation"]),
];

const INTENT_TERMS: &[(&[&str], &[&str])] = &[
    (
        &["symptoms", "symptom", "signs"],
        &["signs", "manifestations", "presentations", "indicators"],
    ),
    (
        &["treatment", "treat", "therapy"],
        &["therapy", "management", "intervention", "care"],
    ),
    (
        &["diagnosis", "diagnose", "test"],
        &["detection", "identification", "screening", "evaluation"],
    ),
];

/// Synonym weights decay with position: the first listed synonym is the
/// closest match.
const SYNONYM_WEIGHTS: &[f64] = &[0.9, 0.8, 0.7, 0.6];
const INTENT_WEIGHTS: &[f64] = &[0.6, 0.55, 0.5, 0.45];

fn positional(weights: &[f64], i: usize) -> f64 {
    weights.get(i).copied().unwrap_or(0.4)
}

impl SynonymTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in medical synonym and intent table.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for (phrase, terms) in MEDICAL_SYNONYMS {
            let expansions = terms
                .iter()
                .enumerate()
                .map(|(i, t)| Expansion::new(*t, positional(SYNONYM_WEIGHTS, i)))
                .collect();
            table.insert(phrase, expansions);
        }
        for (triggers, terms) in INTENT_TERMS {
            let expansions: Vec<Expansion> = terms
                .iter()
                .enumerate()
                .map(|(i, t)| Expansion::new(*t, positional(INTENT_WEIGHTS, i)))
                .collect();
            for trigger in *triggers {
                table.insert(trigger, expansions.clone());
            }
        }
        table
    }

    /// Add or replace the expansions for `phrase`. Phrases with no tokens
    /// are ignored.
    pub fn insert(&mut self, phrase: &str, expansions: Vec<Expansion>) {
        let tokens = tokenize(phrase);
        if tokens.is_empty() {
            return;
        }
        self.entries.insert(tokens.join(" "), (tokens, expansions));
    }

    /// Overlay `other` on top of this table; its phrases win.
    pub fn merge(&mut self, other: SynonymTable) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deterministic, side-effect-free query expander.
#[derive(Debug, Clone)]
pub struct QueryExpander {
    table: SynonymTable,
    confidence_floor: f64,
    max_expansions: usize,
}

struct Candidate {
    term: String,
    weight: f64,
    position: usize,
    order: usize,
}

impl QueryExpander {
    pub const DEFAULT_MAX_EXPANSIONS: usize = 5;

    pub fn new(table: SynonymTable, confidence_floor: f64) -> Self {
        Self {
            table,
            confidence_floor,
            max_expansions: Self::DEFAULT_MAX_EXPANSIONS,
        }
    }

    pub fn with_max_expansions(mut self, max_expansions: usize) -> Self {
        self.max_expansions = max_expansions;
        self
    }

    pub fn confidence_floor(&self) -> f64 {
        self.confidence_floor
    }

    pub fn expand(&self, raw_text: &str) -> Query {
        self.expand_with_filters(raw_text, Metadata::new())
    }

    pub fn expand_with_filters(&self, raw_text: &str, filters: Metadata) -> Query {
        let tokens = tokenize(raw_text);
        let mut best: HashMap<String, Candidate> = HashMap::new();
        let mut order = 0usize;

        for (phrase, expansions) in self.table.entries.values() {
            let Some(position) = find_phrase(&tokens, phrase) else {
                continue;
            };
            for exp in expansions {
                order += 1;
                if exp.weight < self.confidence_floor {
                    continue;
                }
                let exp_tokens = tokenize(&exp.term);
                if exp_tokens.is_empty() || find_phrase(&tokens, &exp_tokens).is_some() {
                    continue;
                }
                let key = exp_tokens.join(" ");
                let candidate = Candidate {
                    term: exp.term.clone(),
                    weight: exp.weight,
                    position,
                    order,
                };
                match best.get(&key) {
                    Some(existing) if !outranks(&candidate, existing) => {}
                    _ => {
                        best.insert(key, candidate);
                    }
                }
            }
        }

        let mut kept: Vec<Candidate> = best.into_values().collect();
        kept.sort_by(|a, b| {
            if outranks(a, b) {
                std::cmp::Ordering::Less
            } else if outranks(b, a) {
                std::cmp::Ordering::Greater
            } else {
                a.term.cmp(&b.term)
            }
        });
        kept.truncate(self.max_expansions);

        Query {
            raw_text: raw_text.to_string(),
            expanded_terms: kept.into_iter().map(|c| c.term).collect(),
            filters,
        }
    }
}

fn outranks(a: &Candidate, b: &Candidate) -> bool {
    if a.weight != b.weight {
        return a.weight > b.weight;
    }
    if a.position != b.position {
        return a.position < b.position;
    }
    a.order < b.order
}

/// Index of the first occurrence of `phrase` as a contiguous token run.
fn find_phrase(tokens: &[String], phrase: &[String]) -> Option<usize> {
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return None;
    }
    tokens.windows(phrase.len()).position(|w| w == phrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander(floor: f64) -> QueryExpander {
        QueryExpander::new(SynonymTable::with_defaults(), floor)
    }

    #[test]
    fn test_expands_known_term() {
        let q = expander(0.5).expand("What causes fever?");
        assert_eq!(q.raw_text, "What causes fever?");
        assert_eq!(
            q.expanded_terms,
            vec!["pyrexia", "elevated temperature", "hyperthermia"]
        );
    }

    #[test]
    fn test_floor_drops_weak_terms() {
        let q = expander(0.85).expand("fever");
        assert_eq!(q.expanded_terms, vec!["pyrexia"]);
        let q = expander(0.95).expand("fever");
        assert!(q.expanded_terms.is_empty());
    }

    #[test]
    fn test_multi_token_phrase() {
        let q = expander(0.5).expand("risk after a myocardial infarction");
        assert_eq!(q.expanded_terms[0], "heart attack");
        let q = expander(0.5).expand("myocardial damage");
        assert!(q.expanded_terms.is_empty());
    }

    #[test]
    fn test_terms_already_in_query_are_skipped() {
        // "joint pain" is a synonym of arthritis and already present
        let q = expander(0.5).expand("arthritis joint pain");
        assert!(!q.expanded_terms.iter().any(|t| t == "joint pain"));
        assert!(q.expanded_terms.iter().any(|t| t == "joint inflammation"));
    }

    #[test]
    fn test_ordering_weight_then_position() {
        let q = expander(0.5).expand("fever and nausea");
        assert_eq!(&q.expanded_terms[..2], &["pyrexia", "queasiness"]);
    }

    #[test]
    fn test_max_expansions() {
        let q = expander(0.0)
            .with_max_expansions(2)
            .expand("diabetes hypertension fever");
        assert_eq!(q.expanded_terms.len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let e = expander(0.4);
        let a = e.expand("symptoms of diabetes and anxiety treatment");
        let b = e.expand("symptoms of diabetes and anxiety treatment");
        assert_eq!(a, b);
    }

    #[test]
    fn test_user_table_overrides_default() {
        let mut table = SynonymTable::with_defaults();
        let mut custom = SynonymTable::new();
        custom.insert("Fever", vec![Expansion::new("febrile", 0.95)]);
        table.merge(custom);
        let q = QueryExpander::new(table, 0.5).expand("fever");
        assert_eq!(q.expanded_terms, vec!["febrile"]);
    }

    #[test]
    fn test_filters_pass_through() {
        let mut filters = Metadata::new();
        filters.insert("source".into(), "guidelines".into());
        let q = expander(0.5).expand_with_filters("pain", filters.clone());
        assert_eq!(q.filters, filters);
    }

    #[test]
    fn test_no_tokens_no_expansion() {
        let q = expander(0.0).expand("?!");
        assert!(q.expanded_terms.is_empty());
    }
}
