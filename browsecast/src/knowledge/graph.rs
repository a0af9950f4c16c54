//! In-memory graph index
//!
//! Rebuildable view over a knowledge slice: navigation adjacency, group
//! membership, and priority-sorted recovery lists, with BFS shortest path.
//! The index is a cache, not a source of truth; it is rebuilt from the
//! document store on demand and never persisted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::{KnowledgeSlice, RecoveryEdge, Screen};

/// One hop along a navigation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub transition_id: String,
    pub to_screen_id: String,
}

/// Outgoing edge from a screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub transition_id: String,
    pub to_screen_id: String,
    pub reliability: f64,
}

/// In-memory adjacency over one knowledge id.
pub struct GraphIndex {
    knowledge_id: String,
    adjacency: HashMap<String, Vec<Neighbor>>,
    screens: HashMap<String, Screen>,
    groups_by_screen: HashMap<String, Vec<String>>,
    recovery_by_group: HashMap<String, Vec<RecoveryEdge>>,
}

impl GraphIndex {
    /// Build the index from a slice.
    pub fn build(slice: &KnowledgeSlice) -> Self {
        let mut adjacency: HashMap<String, Vec<Neighbor>> = HashMap::new();
        for transition in &slice.transitions {
            adjacency
                .entry(transition.from_screen_id.clone())
                .or_default()
                .push(Neighbor {
                    transition_id: transition.transition_id.clone(),
                    to_screen_id: transition.to_screen_id.clone(),
                    reliability: transition.reliability,
                });
        }
        // Deterministic neighbor order: by transition id.
        for neighbors in adjacency.values_mut() {
            neighbors.sort_by(|a, b| a.transition_id.cmp(&b.transition_id));
        }

        let screens: HashMap<String, Screen> = slice
            .screens
            .iter()
            .map(|s| (s.screen_id.clone(), s.clone()))
            .collect();

        let mut groups_by_screen: HashMap<String, Vec<String>> = HashMap::new();
        let mut recovery_by_group = HashMap::new();
        for group in &slice.groups {
            for screen_id in &group.screen_ids {
                groups_by_screen
                    .entry(screen_id.clone())
                    .or_default()
                    .push(group.group_id.clone());
            }
            recovery_by_group.insert(group.group_id.clone(), group.sorted_recovery_edges());
        }

        Self {
            knowledge_id: slice.knowledge_id.clone(),
            adjacency,
            screens,
            groups_by_screen,
            recovery_by_group,
        }
    }

    /// The knowledge id this index was built from
    pub fn knowledge_id(&self) -> &str {
        &self.knowledge_id
    }

    /// Number of screens in the index
    pub fn screen_count(&self) -> usize {
        self.screens.len()
    }

    /// Outgoing neighbors of a screen.
    pub fn neighbors(&self, screen_id: &str) -> &[Neighbor] {
        self.adjacency.get(screen_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// BFS shortest path between two screens, as transition hops.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<PathHop>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut parent: HashMap<&str, (&str, &Neighbor)> = HashMap::new();

        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            for neighbor in self.neighbors(current) {
                let next = neighbor.to_screen_id.as_str();
                if visited.contains(next) {
                    continue;
                }
                visited.insert(next);
                parent.insert(next, (current, neighbor));
                if next == to {
                    // Reconstruct the hop list backwards.
                    let mut hops = Vec::new();
                    let mut cursor = to;
                    while cursor != from {
                        let (prev, edge) = parent[cursor];
                        hops.push(PathHop {
                            transition_id: edge.transition_id.clone(),
                            to_screen_id: edge.to_screen_id.clone(),
                        });
                        cursor = prev;
                    }
                    hops.reverse();
                    return Some(hops);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Recovery edges for a known screen: the union of its groups' edges,
    /// safest (lowest priority) first.
    pub fn recovery_for(&self, screen_id: &str) -> Vec<RecoveryEdge> {
        let mut edges: Vec<RecoveryEdge> = self
            .groups_by_screen
            .get(screen_id)
            .into_iter()
            .flatten()
            .filter_map(|group_id| self.recovery_by_group.get(group_id))
            .flatten()
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }

    /// Recovery edges when no screen match was found: every group's edges,
    /// safest first.
    pub fn recovery_when_lost(&self) -> Vec<RecoveryEdge> {
        let mut edges: Vec<RecoveryEdge> =
            self.recovery_by_group.values().flatten().cloned().collect();
        edges.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.screen_id.cmp(&b.screen_id)));
        edges.dedup_by(|a, b| a.screen_id == b.screen_id && a.priority == b.priority);
        edges
    }

    /// Screens whose name or URL patterns contain the query (case-insensitive),
    /// ordered by screen id for determinism.
    pub fn search_screens(&self, query: &str) -> Vec<&Screen> {
        let needle = query.to_lowercase();
        let mut hits: Vec<&Screen> = self
            .screens
            .values()
            .filter(|s| {
                s.name.to_lowercase().contains(&needle)
                    || s.url_patterns.iter().any(|p| p.to_lowercase().contains(&needle))
            })
            .collect();
        hits.sort_by(|a, b| a.screen_id.cmp(&b.screen_id));
        hits
    }

    /// Resolve the screen whose state signature best matches observed tokens.
    /// Candidates rejected by their negative indicators are excluded; ties
    /// break by ascending screen id.
    pub fn match_state(&self, observed: &[String]) -> Option<&Screen> {
        let mut best: Option<(&Screen, f64)> = None;
        let mut ids: Vec<&String> = self.screens.keys().collect();
        ids.sort();
        for id in ids {
            let screen = &self.screens[id];
            if let Some(score) = screen.state_signature.score(observed) {
                if score <= 0.0 {
                    continue;
                }
                match best {
                    Some((_, s)) if s >= score => {}
                    _ => best = Some((screen, score)),
                }
            }
        }
        best.map(|(s, _)| s)
    }

    /// A screen by id
    pub fn screen(&self, screen_id: &str) -> Option<&Screen> {
        self.screens.get(screen_id)
    }
}

// =============================================================================
// TESTS
// =============================================================================
