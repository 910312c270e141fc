//! The free, rule-based tier. Generates candidate pairs in
//! O(n·k) by bucketing evidence rather than comparing every pair, then tags
//! each surviving pair with the union of rules that fired.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use tracing::{instrument, warn};

use crate::config::{PrefilterConfig, ThresholdsConfig};
use crate::types::{CandidatePair, Evidence, PreFilterRule};

/// Built-in stop words for the title n-gram rule, used when no
/// `stop_word_list_path` is configured.
const DEFAULT_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "in", "on", "for", "and", "or", "is", "it", "with", "this",
    "that", "at", "by", "from", "as", "be", "are",
];

/// A `#123`-style issue reference found in free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueRef {
    pub number: u64,
    /// At least one occurrence followed a fix/close/resolve keyword.
    pub closing: bool,
}

/// Scan free text for `#123` and `owner/repo#123` issue references.
///
/// Works token-by-token with one word of lookbehind: a reference is marked
/// `closing` when the word before it is a fix/close/resolve form. Each
/// number is reported once, in order of first appearance.
pub fn issue_refs_in_text(text: &str) -> Vec<IssueRef> {
    const CLOSING_WORDS: &[&str] = &[
        "close", "closes", "closed", "fix", "fixes", "fixed", "resolve", "resolves", "resolved",
    ];

    let mut refs: Vec<IssueRef> = Vec::new();
    let mut after_closing_word = false;
    for raw in text.split_whitespace() {
        if let Some(number) = issue_number_token(raw) {
            match refs.iter_mut().find(|r| r.number == number) {
                Some(existing) => existing.closing |= after_closing_word,
                None => refs.push(IssueRef {
                    number,
                    closing: after_closing_word,
                }),
            }
        }
        after_closing_word = CLOSING_WORDS.contains(&bare_word(raw).as_str());
    }
    refs
}

/// `"#123"`, `"(#123),"`, or `"owner/repo#123"` → `123`.
fn issue_number_token(raw: &str) -> Option<u64> {
    let token = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '#' && c != '/');
    let (_, digits) = token.rsplit_once('#')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn bare_word(raw: &str) -> String {
    raw.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_ascii_lowercase()
}

#[instrument(skip_all, name = "prefilter_generate")]
pub fn generate_candidates(
    evidence: &[Evidence],
    prefilter: &PrefilterConfig,
    thresholds: &ThresholdsConfig,
) -> Vec<CandidatePair> {
    let by_author = bucket_by_author(evidence);

    let mut pairs: HashMap<(String, String), CandidatePair> = HashMap::new();

    // Rules 1 and 3 only ever match within the same author's bucket, so we
    // bucket first and compare within-bucket rather than scanning all n^2 pairs.
    let per_author_pairs: Vec<Vec<(usize, usize)>> = by_author
        .par_iter()
        .map(|(_, indices)| {
            let mut local = Vec::new();
            for i in 0..indices.len() {
                for j in (i + 1)..indices.len() {
                    local.push((indices[i], indices[j]));
                }
            }
            local
        })
        .collect();

    for local in per_author_pairs {
        for (i, j) in local {
            let a = &evidence[i];
            let b = &evidence[j];
            let delta = time_delta_secs(a, b);
            let same_author_window = prefilter.same_author_window_hours * 3600;
            let mut rules = Vec::new();
            if a.source != b.source && delta <= same_author_window {
                rules.push(PreFilterRule::SameAuthorDifferentSource);
            }
            // Rapid iterations: same kind counts even within one source.
            if a.kind == b.kind && delta <= same_author_window / 4 {
                rules.push(PreFilterRule::TemporalProximitySameAuthor);
            }
            if !rules.is_empty() {
                upsert(&mut pairs, a, b, rules, None, delta, None);
            }
        }
    }

    // Rule 2: explicit reference. Scans every pair but short-circuits cheaply
    // via a pre-extracted key set, so it stays near-linear in practice.
    apply_explicit_reference(evidence, &mut pairs);

    // Rule 4: branch/ticket token match.
    apply_branch_ticket_match(evidence, &mut pairs);

    // Rule 5: title n-gram overlap.
    apply_ngram_overlap(evidence, prefilter, thresholds, &mut pairs);

    let mut out: Vec<CandidatePair> = pairs.into_values().collect();
    out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    out
}

fn bucket_by_author(evidence: &[Evidence]) -> HashMap<String, Vec<usize>> {
    let mut map: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, e) in evidence.iter().enumerate() {
        map.entry(e.author.to_lowercase()).or_default().push(idx);
    }
    map
}

fn time_delta_secs(a: &Evidence, b: &Evidence) -> i64 {
    (a.timestamp - b.timestamp).num_seconds().abs()
}

fn upsert(
    pairs: &mut HashMap<(String, String), CandidatePair>,
    a: &Evidence,
    b: &Evidence,
    rules: Vec<PreFilterRule>,
    matched_key: Option<String>,
    time_delta_secs: i64,
    ngram_overlap: Option<f64>,
) {
    let key = sort_key(&a.id.0, &b.id.0);
    let entry = pairs.entry(key).or_insert_with(|| CandidatePair {
        a: a.id.clone(),
        b: b.id.clone(),
        rules: Vec::new(),
        matched_key: None,
        time_delta_secs,
        ngram_overlap: None,
    });
    for rule in rules {
        if !entry.rules.contains(&rule) {
            entry.rules.push(rule);
        }
    }
    if matched_key.is_some() {
        entry.matched_key = matched_key;
    }
    if ngram_overlap.is_some() {
        entry.ngram_overlap = ngram_overlap;
    }
}

fn sort_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Rule 2. An item's text containing another item's external key — issue
/// number, Jira-style ticket key, or commit prefix (>= 7 hex chars) — is a
/// strong explicit link.
fn apply_explicit_reference(evidence: &[Evidence], pairs: &mut HashMap<(String, String), CandidatePair>) {
    let mut by_issue_number: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut by_ticket_key: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_commit_prefix: HashMap<String, Vec<usize>> = HashMap::new();

    for (idx, e) in evidence.iter().enumerate() {
        if let Some(n) = e.attributes.get("number").and_then(attr_as_u64) {
            by_issue_number.entry(n).or_default().push(idx);
        }
        // A ticket whose id is itself an issue key (e.g. "AUTH-123") is
        // addressable by that key from any other item's text.
        if e.kind == crate::types::EvidenceKind::Ticket {
            if let Some(key) = ticket_key_in_text(&e.id.0) {
                by_ticket_key.entry(key).or_default().push(idx);
            }
        }
        if e.kind == crate::types::EvidenceKind::Commit && e.id.0.len() >= 7 {
            by_commit_prefix
                .entry(e.id.0[..7].to_lowercase())
                .or_default()
                .push(idx);
        }
    }

    for (idx, e) in evidence.iter().enumerate() {
        let text = format!("{} {}", e.title, e.body);
        for issue_ref in issue_refs_in_text(&text) {
            if let Some(targets) = by_issue_number.get(&issue_ref.number) {
                for &target_idx in targets {
                    if target_idx == idx {
                        continue;
                    }
                    let (a, b) = (&evidence[idx], &evidence[target_idx]);
                    let delta = time_delta_secs(a, b);
                    upsert(
                        pairs,
                        a,
                        b,
                        vec![PreFilterRule::ExplicitReference],
                        Some(issue_ref.number.to_string()),
                        delta,
                        None,
                    );
                }
            }
        }
        for key in ticket_keys_in_text(&text) {
            if let Some(targets) = by_ticket_key.get(&key) {
                for &target_idx in targets {
                    if target_idx == idx {
                        continue;
                    }
                    let (a, b) = (&evidence[idx], &evidence[target_idx]);
                    let delta = time_delta_secs(a, b);
                    upsert(
                        pairs,
                        a,
                        b,
                        vec![PreFilterRule::ExplicitReference],
                        Some(key.clone()),
                        delta,
                        None,
                    );
                }
            }
        }
        for (prefix, targets) in &by_commit_prefix {
            if text.to_lowercase().contains(prefix.as_str()) {
                for &target_idx in targets {
                    if target_idx == idx {
                        continue;
                    }
                    let (a, b) = (&evidence[idx], &evidence[target_idx]);
                    let delta = time_delta_secs(a, b);
                    upsert(
                        pairs,
                        a,
                        b,
                        vec![PreFilterRule::ExplicitReference],
                        Some(prefix.clone()),
                        delta,
                        None,
                    );
                }
            }
        }
    }
}

fn attr_as_u64(v: &crate::types::AttributeValue) -> Option<u64> {
    use crate::types::AttributeValue::Scalar;
    match v {
        Scalar(crate::types::ScalarValue::Int(n)) => Some(*n as u64),
        _ => None,
    }
}

/// Rule 4. A branch name or ref token (e.g. `feature/AUTH-123-login`) equal
/// to an issue key present in another item.
fn apply_branch_ticket_match(evidence: &[Evidence], pairs: &mut HashMap<(String, String), CandidatePair>) {
    let mut by_ticket_key: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, e) in evidence.iter().enumerate() {
        if let Some(key) = ticket_key_in_text(&e.title) {
            by_ticket_key.entry(key).or_default().push(idx);
        }
    }

    for (idx, e) in evidence.iter().enumerate() {
        let Some(branch_ref) = e.attributes.get("branch").and_then(attr_as_str) else {
            continue;
        };
        let Some(key) = ticket_key_in_text(&branch_ref) else {
            continue;
        };
        if let Some(targets) = by_ticket_key.get(&key) {
            for &target_idx in targets {
                if target_idx == idx {
                    continue;
                }
                let (a, b) = (&evidence[idx], &evidence[target_idx]);
                let delta = time_delta_secs(a, b);
                upsert(
                    pairs,
                    a,
                    b,
                    vec![PreFilterRule::BranchTicketMatch],
                    Some(key.clone()),
                    delta,
                    None,
                );
            }
        }
    }
}

fn attr_as_str(v: &crate::types::AttributeValue) -> Option<String> {
    use crate::types::AttributeValue::Scalar;
    match v {
        Scalar(crate::types::ScalarValue::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Recognizes the first `PREFIX-123` style ticket key (Jira-like),
/// case-insensitive.
fn ticket_key_in_text(text: &str) -> Option<String> {
    ticket_keys_in_text(text).into_iter().next()
}

/// All `PREFIX-123` style ticket keys in `text`, deduplicated, in order of
/// first appearance.
fn ticket_keys_in_text(text: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    let bytes = upper.as_bytes();
    let mut keys = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_uppercase() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_uppercase() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'-' && i > start {
                let dash = i;
                i += 1;
                let num_start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i > num_start {
                    let key = upper[start..i].to_string();
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                } else {
                    i = dash + 1;
                }
            }
        } else {
            i += 1;
        }
    }
    keys
}

/// Rule 5. Jaccard overlap of lowercased, stop-word-stripped 3-grams of
/// title tokens.
fn apply_ngram_overlap(
    evidence: &[Evidence],
    prefilter: &PrefilterConfig,
    thresholds: &ThresholdsConfig,
    pairs: &mut HashMap<(String, String), CandidatePair>,
) {
    let stop_words = load_stop_words(prefilter);
    let ngrams: Vec<HashSet<Vec<String>>> = evidence
        .iter()
        .map(|e| title_trigrams(&e.title, &stop_words))
        .collect();

    let mut by_token: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, grams) in ngrams.iter().enumerate() {
        for gram in grams {
            if let Some(first) = gram.first() {
                by_token.entry(first.clone()).or_default().push(idx);
            }
        }
    }

    let mut candidates: HashSet<(usize, usize)> = HashSet::new();
    for indices in by_token.values() {
        for i in 0..indices.len() {
            for j in (i + 1)..indices.len() {
                let (lo, hi) = (indices[i].min(indices[j]), indices[i].max(indices[j]));
                candidates.insert((lo, hi));
            }
        }
    }

    for (i, j) in candidates {
        if ngrams[i].is_empty() || ngrams[j].is_empty() {
            continue;
        }
        let overlap = jaccard(&ngrams[i], &ngrams[j]);
        if overlap >= thresholds.ngram_overlap {
            let (a, b) = (&evidence[i], &evidence[j]);
            let delta = time_delta_secs(a, b);
            upsert(pairs, a, b, vec![PreFilterRule::TitleNgramOverlap], None, delta, Some(overlap));
        }
    }
}

/// The stop-word set for rule 5: the file named by `stop_word_list_path`
/// (one word per line, `#` comments allowed), or the built-in list when no
/// path is configured or the file can't be read.
fn load_stop_words(prefilter: &PrefilterConfig) -> HashSet<String> {
    if let Some(path) = &prefilter.stop_word_list_path {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                return text
                    .lines()
                    .map(|line| line.trim().to_lowercase())
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .collect();
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to read stop-word list, using built-ins");
            }
        }
    }
    DEFAULT_STOP_WORDS.iter().map(|w| (*w).to_string()).collect()
}

fn title_trigrams(title: &str, stop_words: &HashSet<String>) -> HashSet<Vec<String>> {
    let tokens: Vec<String> = title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !stop_words.contains(*w))
        .map(str::to_string)
        .collect();
    if tokens.len() < 3 {
        return HashSet::new();
    }
    tokens.windows(3).map(<[String]>::to_vec).collect()
}

fn jaccard(a: &HashSet<Vec<String>>, b: &HashSet<Vec<String>>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
