//! Story grouper: turns accepted relationships into work stories via
//! union-find connected components, splitting any component that grows
//! past the configured member cap.

use std::collections::HashMap;

use petgraph::unionfind::UnionFind;

use crate::config::ThresholdsConfig;
use crate::types::{Evidence, EvidenceId, Relationship, WorkStory};

#[derive(Debug, Clone)]
struct Edge {
    a: usize,
    b: usize,
    confidence: f64,
}

/// Group accepted relationships into stories. `evidence_by_id` must contain
/// every evidence id referenced by `relationships`.
pub fn group_into_stories(
    relationships: &[Relationship],
    evidence_by_id: &HashMap<String, &Evidence>,
    thresholds: &ThresholdsConfig,
) -> Vec<WorkStory> {
    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut members: Vec<String> = Vec::new();
    let mut index_for = |id: &EvidenceId, index_of: &mut HashMap<String, usize>, members: &mut Vec<String>| {
        *index_of.entry(id.0.clone()).or_insert_with(|| {
            members.push(id.0.clone());
            members.len() - 1
        })
    };

    let accepted: Vec<&Relationship> = relationships
        .iter()
        .filter(|r| r.confidence >= thresholds.group_confidence)
        .collect();

    let edges: Vec<Edge> = accepted
        .iter()
        .map(|r| {
            let a = index_for(&r.a, &mut index_of, &mut members);
            let b = index_for(&r.b, &mut index_of, &mut members);
            Edge {
                a,
                b,
                confidence: r.confidence,
            }
        })
        .collect();

    if members.is_empty() {
        return Vec::new();
    }

    let components = connected_components(members.len(), &edges);

    let mut stories = Vec::new();
    for component in components {
        if component.len() < 2 {
            continue;
        }
        for sub in split_oversized(&component, &edges, thresholds.max_story_members) {
            if sub.len() < 2 {
                continue;
            }
            if let Some(story) = build_story(&sub, &members, &edges, evidence_by_id) {
                stories.push(story);
            }
        }
    }
    // Component discovery iterates hash maps; sort by story id so output
    // order is stable across processes.
    stories.sort_by(|a, b| a.id.cmp(&b.id));
    stories
}

fn connected_components(n: usize, edges: &[Edge]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(n);
    for e in edges {
        uf.union(e.a, e.b);
    }
    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        groups.entry(uf.find(i)).or_default().push(i);
    }
    groups.into_values().collect()
}

/// Split `component` if it exceeds `max_members`, by repeatedly dropping the
/// lowest-confidence edge within it until every resulting sub-component is
/// small enough. Ties on confidence broken by lexicographic endpoint order.
fn split_oversized(component: &[usize], all_edges: &[Edge], max_members: usize) -> Vec<Vec<usize>> {
    if component.len() <= max_members {
        return vec![component.to_vec()];
    }

    let component_set: std::collections::HashSet<usize> = component.iter().copied().collect();
    let mut active: Vec<Edge> = all_edges
        .iter()
        .filter(|e| component_set.contains(&e.a) && component_set.contains(&e.b))
        .cloned()
        .collect();

    loop {
        active.sort_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| (a.a, a.b).cmp(&(b.a, b.b)))
        });

        let groups = connected_components_within(component, &active);
        if groups.iter().all(|g| g.len() <= max_members) {
            return groups;
        }
        if active.is_empty() {
            // No edges left but still oversized: every node is its own group.
            return component.iter().map(|&n| vec![n]).collect();
        }
        active.remove(0);
    }
}

fn connected_components_within(nodes: &[usize], edges: &[Edge]) -> Vec<Vec<usize>> {
    let local_index: HashMap<usize, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let mut uf = UnionFind::new(nodes.len());
    for e in edges {
        if let (Some(&ia), Some(&ib)) = (local_index.get(&e.a), local_index.get(&e.b)) {
            uf.union(ia, ib);
        }
    }
    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for (local, &global) in nodes.iter().enumerate() {
        groups.entry(uf.find(local)).or_default().push(global);
    }
    groups.into_values().collect()
}

fn build_story(
    component: &[usize],
    members: &[String],
    all_edges: &[Edge],
    evidence_by_id: &HashMap<String, &Evidence>,
) -> Option<WorkStory> {
    let ids: Vec<&String> = component.iter().map(|&i| &members[i]).collect();
    let evidence: Vec<&Evidence> = ids.iter().filter_map(|id| evidence_by_id.get(id.as_str()).copied()).collect();
    if evidence.is_empty() {
        return None;
    }

    let fingerprints: Vec<u64> = evidence.iter().map(|e| e.fingerprint()).collect();
    let id = WorkStory::derive_id(&fingerprints);

    let t_min = evidence.iter().map(|e| e.timestamp).min()?;
    let t_max = evidence.iter().map(|e| e.timestamp).max()?;

    let mut per_source_counts: std::collections::BTreeMap<String, u32> = std::collections::BTreeMap::new();
    for e in &evidence {
        *per_source_counts.entry(e.source.0.clone()).or_insert(0) += 1;
    }

    let component_set: std::collections::HashSet<usize> = component.iter().copied().collect();
    let mut degree: HashMap<usize, u32> = HashMap::new();
    let mut best_ticket: Option<(f64, usize)> = None;
    for e in all_edges {
        if !component_set.contains(&e.a) || !component_set.contains(&e.b) {
            continue;
        }
        *degree.entry(e.a).or_insert(0) += 1;
        *degree.entry(e.b).or_insert(0) += 1;
        for &node in &[e.a, e.b] {
            let is_ticket = evidence_by_id
                .get(members[node].as_str())
                .is_some_and(|item| item.kind == crate::types::EvidenceKind::Ticket);
            let beats_current = best_ticket.is_none_or(|(conf, _)| e.confidence > conf);
            if is_ticket && beats_current {
                best_ticket = Some((e.confidence, node));
            }
        }
    }

    let title = if let Some((_, node)) = best_ticket {
        evidence_by_id
            .get(members[node].as_str())
            .map(|e| e.title.clone())
            .unwrap_or_default()
    } else {
        let mut by_degree: Vec<(&&Evidence, u32)> = evidence
            .iter()
            .map(|e| (e, degree.get(&index_of_id(members, &e.id.0)).copied().unwrap_or(0)))
            .collect();
        by_degree.sort_by(|a, b| b.1.cmp(&a.1));
        by_degree
            .into_iter()
            .take(3)
            .max_by_key(|(e, _)| e.title.chars().count())
            .map(|(e, _)| e.title.clone())
            .unwrap_or_default()
    };

    Some(WorkStory {
        id,
        members: ids.into_iter().map(|s| EvidenceId(s.clone())).collect(),
        t_min,
        t_max,
        title,
        per_source_counts,
        insights: serde_json::Value::Null,
    })
}

fn index_of_id(members: &[String], id: &str) -> usize {
    members.iter().position(|m| m == id).unwrap_or(0)
}
