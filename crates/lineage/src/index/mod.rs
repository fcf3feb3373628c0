//! Character trie over normalized spawn prefixes.
//!
//! Nodes live in a flat arena and refer to each other by index. A
//! [`PrefixIndexBuilder`] accepts inserts; [`PrefixIndexBuilder::build`]
//! freezes it into a [`PrefixIndex`] that only answers lookups, so the
//! resolution phase can share it across threads without locking.

use std::collections::HashMap;

use serde::Serialize;

type NodeId = usize;
type OwnerId = usize;

const ROOT: NodeId = 0;

/// One recorded spawn prefix and the task that recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefixIndexEntry {
    pub normalized_text: String,
    pub owner_task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Approximate,
}

/// Deepest node along a query path that has owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMatch<'a> {
    /// Every task that recorded the matched text, in insertion order.
    pub owners: Vec<&'a str>,
    /// Matched length in chars.
    pub matched_len: usize,
    pub method: MatchMethod,
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    // Sorted by char for binary search.
    edges: Vec<(char, NodeId)>,
    owners: Vec<OwnerId>,
}

impl TrieNode {
    fn child(&self, ch: char) -> Option<NodeId> {
        self.edges
            .binary_search_by_key(&ch, |(edge, _)| *edge)
            .ok()
            .map(|position| self.edges[position].1)
    }
}

#[derive(Debug, Clone)]
pub struct PrefixIndexBuilder {
    nodes: Vec<TrieNode>,
    owners: Vec<String>,
    owner_ids: HashMap<String, OwnerId>,
    entry_count: usize,
}

impl Default for PrefixIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixIndexBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            owners: Vec::new(),
            owner_ids: HashMap::new(),
            entry_count: 0,
        }
    }

    /// Records that `owner` spawned a subtask with `normalized_text`.
    ///
    /// Returns `false` when the pair was already present or the text is
    /// empty. Distinct owners of the same text are all kept.
    pub fn insert(&mut self, normalized_text: &str, owner: &str) -> bool {
        if normalized_text.is_empty() {
            return false;
        }

        let mut node = ROOT;
        for ch in normalized_text.chars() {
            node = match self.nodes[node].child(ch) {
                Some(next) => next,
                None => self.add_child(node, ch),
            };
        }

        let owner_id = self.intern_owner(owner);
        let owners = &mut self.nodes[node].owners;
        if owners.contains(&owner_id) {
            return false;
        }
        owners.push(owner_id);
        self.entry_count += 1;
        true
    }

    pub fn extend<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = PrefixIndexEntry>,
    {
        entries
            .into_iter()
            .filter(|entry| self.insert(&entry.normalized_text, &entry.owner_task_id))
            .count()
    }

    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[must_use]
    pub fn build(self) -> PrefixIndex {
        PrefixIndex {
            nodes: self.nodes,
            owners: self.owners,
            entry_count: self.entry_count,
        }
    }

    fn add_child(&mut self, parent: NodeId, ch: char) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(TrieNode::default());
        let edges = &mut self.nodes[parent].edges;
        let position = edges.partition_point(|(edge, _)| *edge < ch);
        edges.insert(position, (ch, id));
        id
    }

    fn intern_owner(&mut self, owner: &str) -> OwnerId {
        if let Some(id) = self.owner_ids.get(owner) {
            return *id;
        }
        let id = self.owners.len();
        self.owners.push(owner.to_string());
        self.owner_ids.insert(owner.to_string(), id);
        id
    }
}

/// Read-only prefix index for one rebuild generation.
#[derive(Debug, Clone)]
pub struct PrefixIndex {
    nodes: Vec<TrieNode>,
    owners: Vec<String>,
    entry_count: usize,
}

impl PrefixIndex {
    /// Bulk construction in one pass.
    #[must_use]
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = PrefixIndexEntry>,
    {
        let mut builder = PrefixIndexBuilder::new();
        builder.extend(entries);
        builder.build()
    }

    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Owners whose recorded prefix equals `normalized_text`.
    #[must_use]
    pub fn lookup_exact(&self, normalized_text: &str) -> Vec<&str> {
        if normalized_text.is_empty() {
            return Vec::new();
        }
        let mut node = ROOT;
        for ch in normalized_text.chars() {
            match self.nodes[node].child(ch) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }
        self.owner_names(node)
    }

    /// Longest recorded prefix that is itself a prefix of `normalized_text`.
    ///
    /// `method` is `Exact` only when the whole query matched.
    #[must_use]
    pub fn lookup_best(&self, normalized_text: &str) -> Option<BestMatch<'_>> {
        self.lookup_best_where(normalized_text, |_| true)
    }

    /// [`Self::lookup_best`] restricted to owners accepted by `keep`. Nodes
    /// whose owners are all rejected are skipped, so a shorter prefix with an
    /// acceptable owner can still match.
    #[must_use]
    pub fn lookup_best_where<F>(&self, normalized_text: &str, keep: F) -> Option<BestMatch<'_>>
    where
        F: Fn(&str) -> bool,
    {
        let query_len = normalized_text.chars().count();
        let mut node = ROOT;
        let mut deepest: Option<(Vec<&str>, usize)> = None;

        for (depth, ch) in normalized_text.chars().enumerate() {
            let Some(next) = self.nodes[node].child(ch) else {
                break;
            };
            node = next;
            if self.nodes[node].owners.is_empty() {
                continue;
            }
            let owners: Vec<&str> = self
                .owner_names(node)
                .into_iter()
                .filter(|owner| keep(*owner))
                .collect();
            if !owners.is_empty() {
                deepest = Some((owners, depth + 1));
            }
        }

        let (owners, matched_len) = deepest?;
        Some(BestMatch {
            owners,
            matched_len,
            method: if matched_len == query_len {
                MatchMethod::Exact
            } else {
                MatchMethod::Approximate
            },
        })
    }

    fn owner_names(&self, node: NodeId) -> Vec<&str> {
        self.nodes[node]
            .owners
            .iter()
            .filter_map(|id| self.owners.get(*id).map(String::as_str))
            .collect()
    }
}
