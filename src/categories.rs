use crate::fields::parse_category_path;
use crate::models::{Category, CategoryEdge};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

/// Run-wide category cache and pending hierarchy edges.
///
/// Names are first-write-wins: a repeated id keeps the name it was first
/// seen with. Edges are buffered until the main pass is over.
#[derive(Default)]
pub struct CategoryResolver {
    names: FxHashMap<String, String>,
    fresh: Vec<Category>,
    edge_set: FxHashSet<(String, String)>,
    edges: Vec<CategoryEdge>,
    self_edges_rejected: u64,
}

impl CategoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached id, creating the category on first sight.
    pub fn intern_or_create(&mut self, id: &str, name: &str) -> String {
        if let Some(existing) = self.names.get(id) {
            if existing != name {
                debug!(id, kept = %existing, ignored = name, "Category name differs, keeping first");
            }
            return id.to_string();
        }
        self.names.insert(id.to_string(), name.to_string());
        self.fresh.push(Category {
            id: id.to_string(),
            name: name.to_string(),
        });
        id.to_string()
    }

    /// Interns every segment of a `|name[id]|...` line, returning ids root first.
    pub fn resolve_path(&mut self, line: &str) -> Vec<String> {
        parse_category_path(line)
            .into_iter()
            .map(|seg| self.intern_or_create(seg.id, seg.name))
            .collect()
    }

    /// Buffers `child -> parent`. Self-edges are rejected and return false.
    pub fn record_edge(&mut self, child_id: &str, parent_id: &str) -> bool {
        if child_id == parent_id {
            self.self_edges_rejected += 1;
            warn!(category = child_id, "Rejected self-referencing category edge");
            return false;
        }
        let key = (child_id.to_string(), parent_id.to_string());
        if self.edge_set.contains(&key) {
            return false;
        }
        self.edges.push(CategoryEdge {
            child_id: key.0.clone(),
            parent_id: key.1.clone(),
        });
        self.edge_set.insert(key);
        true
    }

    /// Categories interned since the last call, in first-seen order.
    pub fn drain_new(&mut self) -> Vec<Category> {
        std::mem::take(&mut self.fresh)
    }

    pub fn name(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn pending_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn self_edges_rejected(&self) -> u64 {
        self.self_edges_rejected
    }

    pub fn into_edges(self) -> Vec<CategoryEdge> {
        self.edges
    }
}
