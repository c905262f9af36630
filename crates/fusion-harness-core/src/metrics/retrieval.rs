//! Retrieval-quality metrics over `(query, retrieved, relevant)` judgments.
//!
//! Standard binary-relevance definitions; `k` truncates the retrieved list.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One logged retrieval with its ground-truth relevant documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceJudgment {
    pub query: String,
    /// Document refs in rank order.
    pub retrieved: Vec<String>,
    pub relevant: BTreeSet<String>,
}

/// Mean retrieval quality over a set of judgments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuality {
    pub queries: usize,
    pub k: usize,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub mrr: f64,
    pub ndcg_at_k: f64,
}

fn hits_at_k(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> usize {
    retrieved
        .iter()
        .take(k)
        .filter(|d| relevant.contains(*d))
        .count()
}

pub fn precision_at_k(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits_at_k(retrieved, relevant, k) as f64 / k as f64
}

pub fn recall_at_k(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits_at_k(retrieved, relevant, k) as f64 / relevant.len() as f64
}

/// `1 / rank` of the first relevant document within the top `k`, else 0.
pub fn reciprocal_rank(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> f64 {
    retrieved
        .iter()
        .take(k)
        .position(|d| relevant.contains(d))
        .map(|i| 1.0 / (i as f64 + 1.0))
        .unwrap_or(0.0)
}

pub fn ndcg_at_k(retrieved: &[String], relevant: &BTreeSet<String>, k: usize) -> f64 {
    let discount = |i: usize| 1.0 / (i as f64 + 2.0).log2();
    let dcg: f64 = retrieved
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, d)| relevant.contains(*d))
        .map(|(i, _)| discount(i))
        .sum();
    let ideal: f64 = (0..relevant.len().min(k)).map(discount).sum();
    if ideal <= 0.0 {
        return 0.0;
    }
    dcg / ideal
}

/// Mean of each metric across `judgments`.
pub fn evaluate(judgments: &[RelevanceJudgment], k: usize) -> RetrievalQuality {
    let n = judgments.len();
    let mut q = RetrievalQuality {
        queries: n,
        k,
        precision_at_k: 0.0,
        recall_at_k: 0.0,
        mrr: 0.0,
        ndcg_at_k: 0.0,
    };
    if n == 0 {
        return q;
    }
    for j in judgments {
        q.precision_at_k += precision_at_k(&j.retrieved, &j.relevant, k);
        q.recall_at_k += recall_at_k(&j.retrieved, &j.relevant, k);
        q.mrr += reciprocal_rank(&j.retrieved, &j.relevant, k);
        q.ndcg_at_k += ndcg_at_k(&j.retrieved, &j.relevant, k);
    }
    let n = n as f64;
    q.precision_at_k /= n;
    q.recall_at_k /= n;
    q.mrr /= n;
    q.ndcg_at_k /= n;
    q
}
