//! The hierarchical log-source tree.
//!
//! Generalizes the teacher's `logger::Logger` global-registry pattern (a
//! single `AtomicPtr<Logger>` guarding a process-wide instance) into an
//! arena of tree nodes: `SourceId` is an index into an append-only `Vec`
//! rather than a pointer, so a `Source`'s identity survives the tree
//! growing new nodes during configuration (§9's "arena+index ownership
//! instead of a GC-managed node graph" design note).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::level::LogLevel;

/// Opaque, process-wide-unique identifier for a tree node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// How a node's effective level constrains its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationMode {
  /// Descendants compute their effective level independently.
  None,
  /// Descendants hard-adopt this node's level, overriding their own.
  Set,
  /// Descendants may not be looser (more verbose) than this node.
  Restrict,
  /// Descendants may not be stricter (less verbose) than this node.
  Loose,
}

struct NodeTopology {
  name: String,
  parent: Option<SourceId>,
  children: BTreeMap<String, SourceId>,
  propagation: PropagationMode,
}

/// A single tree node. Level/affinity fields are atomics so that reads
/// from the hot logging path never take a lock; topology fields (name,
/// parent, children, propagation mode) only change during configuration
/// and are guarded by an `RwLock` that's never touched once the tree is
/// stable (§4.2: "after initialization the topology is stable and
/// lookups are lock-free").
pub struct SourceNode {
  id: SourceId,
  topology: RwLock<NodeTopology>,
  own_level: AtomicU8,
  effective_level: AtomicU8,
  /// Bitmap over target ids; `0` means "all enabled targets" (§4.2).
  affinity: AtomicU64,
}

impl SourceNode {
  pub fn id(&self) -> SourceId {
    self.id
  }

  pub fn name(&self) -> String {
    self.topology.read().name.clone()
  }

  pub fn parent(&self) -> Option<SourceId> {
    self.topology.read().parent
  }

  pub fn qualified_name(&self, tree: &SourceTree) -> String {
    let mut parts = vec![self.name()];
    let mut cursor = self.parent();
    while let Some(id) = cursor {
      let node = tree.get(id).expect("parent id always resolves");
      let name = node.name();
      cursor = node.parent();
      if !name.is_empty() {
        parts.push(name);
      }
    }
    parts.reverse();
    parts.join(".")
  }

  #[inline]
  pub fn effective_level(&self) -> LogLevel {
    LogLevel::from_u8(self.effective_level.load(Ordering::Acquire))
  }

  #[inline]
  pub fn own_level(&self) -> LogLevel {
    LogLevel::from_u8(self.own_level.load(Ordering::Acquire))
  }

  #[inline]
  pub fn affinity(&self) -> u64 {
    self.affinity.load(Ordering::Relaxed)
  }

  pub fn set_affinity(&self, mask: u64) {
    self.affinity.store(mask, Ordering::Relaxed);
  }

  /// Whether target `id` is selected by this node's affinity mask
  /// (`0` selects every target).
  #[inline]
  pub fn targets(&self, target_id: u32) -> bool {
    let mask = self.affinity();
    mask == 0 || (mask & (1u64 << (target_id & 63))) != 0
  }
}

/// The tree of named log sources, rooted at an unnamed node with the
/// lowest id (§3 invariant).
pub struct SourceTree {
  nodes: RwLock<Vec<std::sync::Arc<SourceNode>>>,
  next_id: AtomicU64,
  root: SourceId,
}

impl SourceTree {
  pub fn new() -> Self {
    let root_node = std::sync::Arc::new(SourceNode {
      id: SourceId(0),
      topology: RwLock::new(NodeTopology {
        name: String::new(),
        parent: None,
        children: BTreeMap::new(),
        propagation: PropagationMode::None,
      }),
      own_level: AtomicU8::new(LogLevel::Info as u8),
      effective_level: AtomicU8::new(LogLevel::Info as u8),
      affinity: AtomicU64::new(0),
    });
    Self {
      nodes: RwLock::new(vec![root_node]),
      next_id: AtomicU64::new(1),
      root: SourceId(0),
    }
  }

  pub fn root(&self) -> SourceId {
    self.root
  }

  pub fn get(&self, id: SourceId) -> Option<std::sync::Arc<SourceNode>> {
    self.nodes.read().get(id.0 as usize).cloned()
  }

  /// Look up a qualified dotted name (`"app.db.pool"`). The empty string
  /// resolves to the root.
  pub fn lookup(&self, qualified_name: &str) -> Option<SourceId> {
    if qualified_name.is_empty() {
      return Some(self.root);
    }
    let nodes = self.nodes.read();
    let mut current = self.root;
    for part in qualified_name.split('.') {
      let topo = nodes[current.0 as usize].topology.read();
      let next = *topo.children.get(part)?;
      drop(topo);
      current = next;
    }
    Some(current)
  }

  /// Define (or find) the node at `qualified_name`. When
  /// `define_missing_path` is false, any missing intermediate segment is
  /// an error (§4.2).
  pub fn define(
    &self,
    qualified_name: &str,
    define_missing_path: bool,
  ) -> Result<SourceId, String> {
    if qualified_name.is_empty() {
      return Ok(self.root);
    }
    let mut current = self.root;
    let segments: Vec<&str> = qualified_name.split('.').collect();
    for (i, part) in segments.iter().enumerate() {
      let existing = {
        let nodes = self.nodes.read();
        let topology = nodes[current.0 as usize].topology.read();
        topology.children.get(*part).copied()
      };
      current = match existing {
        Some(id) => id,
        None => {
          let is_last = i == segments.len() - 1;
          if !is_last && !define_missing_path {
            return Err(format!(
              "missing intermediate source {:?} in path {:?}",
              part, qualified_name
            ));
          }
          self.create_child(current, part)
        },
      };
    }
    Ok(current)
  }

  fn create_child(&self, parent: SourceId, name: &str) -> SourceId {
    let id = SourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let parent_level = self.get(parent).map(|n| n.own_level()).unwrap_or(LogLevel::Info);
    let node = std::sync::Arc::new(SourceNode {
      id,
      topology: RwLock::new(NodeTopology {
        name: name.to_string(),
        parent: Some(parent),
        children: BTreeMap::new(),
        propagation: PropagationMode::None,
      }),
      own_level: AtomicU8::new(parent_level as u8),
      effective_level: AtomicU8::new(parent_level as u8),
      affinity: AtomicU64::new(0),
    });
    {
      let mut nodes = self.nodes.write();
      nodes.push(std::sync::Arc::clone(&node));
    }
    if let Some(parent_node) = self.get(parent) {
      parent_node.topology.write().children.insert(name.to_string(), id);
    }
    self.republish(id);
    id
  }

  pub fn set_propagation(&self, id: SourceId, mode: PropagationMode) {
    if let Some(node) = self.get(id) {
      node.topology.write().propagation = mode;
      self.republish_descendants(id);
    }
  }

  /// Set a source's own level and republish the effective level to
  /// itself and, if its propagation mode is non-`None`, to every
  /// descendant (§3 invariant).
  pub fn set_level(&self, id: SourceId, level: LogLevel) {
    let Some(node) = self.get(id) else { return };
    node.own_level.store(level as u8, Ordering::Release);
    self.republish(id);
    let propagates = !matches!(node.topology.read().propagation, PropagationMode::None);
    if propagates {
      self.republish_descendants(id);
    }
  }

  fn republish(&self, id: SourceId) {
    let effective = self.compute_effective_level(id);
    if let Some(node) = self.get(id) {
      node.effective_level.store(effective as u8, Ordering::Release);
    }
  }

  fn republish_descendants(&self, id: SourceId) {
    let children: Vec<SourceId> = match self.get(id) {
      Some(node) => node.topology.read().children.values().copied().collect(),
      None => return,
    };
    for child in children {
      self.republish(child);
      self.republish_descendants(child);
    }
  }

  /// Effective level for `id`: the node's own level, adjusted in
  /// root-to-parent order by each ancestor's propagation mode (§4.2).
  fn compute_effective_level(&self, id: SourceId) -> LogLevel {
    let Some(node) = self.get(id) else { return LogLevel::Info };
    let mut chain = Vec::new();
    let mut cursor = node.parent();
    while let Some(parent_id) = cursor {
      if let Some(parent) = self.get(parent_id) {
        chain.push(parent_id);
        cursor = parent.parent();
      } else {
        break;
      }
    }
    chain.reverse();

    let mut effective = node.own_level();
    for ancestor_id in chain {
      let Some(ancestor) = self.get(ancestor_id) else { continue };
      let mode = {
        let topo = ancestor.topology.read();
        match topo.propagation {
          PropagationMode::None => None,
          PropagationMode::Set => Some(0),
          PropagationMode::Restrict => Some(1),
          PropagationMode::Loose => Some(2),
        }
      };
      match mode {
        None => {},
        Some(0) => effective = ancestor.own_level(),
        Some(1) => effective = effective.strictest(ancestor.own_level()),
        Some(2) => effective = effective.loosest(ancestor.own_level()),
        _ => unreachable!(),
      }
    }
    effective
  }
}

impl Default for SourceTree {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn root_exists_with_lowest_id() {
    let tree = SourceTree::new();
    assert_eq!(tree.root(), SourceId(0));
    assert_eq!(tree.get(tree.root()).unwrap().name(), "");
  }

  #[test]
  fn define_creates_missing_path() {
    let tree = SourceTree::new();
    let id = tree.define("app.db.pool", true).unwrap();
    assert_eq!(tree.lookup("app.db.pool"), Some(id));
    assert_eq!(tree.get(id).unwrap().qualified_name(&tree), "app.db.pool");
  }

  #[test]
  fn define_without_missing_path_fails() {
    let tree = SourceTree::new();
    assert!(tree.define("app.db.pool", false).is_err());
  }

  #[test]
  fn set_propagation_hard_overrides_descendants() {
    let tree = SourceTree::new();
    let app = tree.define("app", true).unwrap();
    let pool = tree.define("app.db.pool", true).unwrap();
    tree.set_level(pool, LogLevel::Diag);
    tree.set_propagation(app, PropagationMode::Set);
    tree.set_level(app, LogLevel::Error);
    assert_eq!(tree.get(pool).unwrap().effective_level(), LogLevel::Error);
  }

  #[test]
  fn restrict_clamps_looser_descendants() {
    let tree = SourceTree::new();
    let app = tree.define("app", true).unwrap();
    let child = tree.define("app.noisy", true).unwrap();
    tree.set_propagation(app, PropagationMode::Restrict);
    tree.set_level(app, LogLevel::Warn);
    tree.set_level(child, LogLevel::Diag);
    assert_eq!(tree.get(child).unwrap().effective_level(), LogLevel::Warn);
  }

  #[test]
  fn loose_raises_stricter_descendants() {
    let tree = SourceTree::new();
    let app = tree.define("app", true).unwrap();
    let child = tree.define("app.quiet", true).unwrap();
    tree.set_propagation(app, PropagationMode::Loose);
    tree.set_level(app, LogLevel::Diag);
    tree.set_level(child, LogLevel::Error);
    assert_eq!(tree.get(child).unwrap().effective_level(), LogLevel::Diag);
  }

  #[test]
  fn affinity_zero_selects_all_targets() {
    let tree = SourceTree::new();
    let node = tree.get(tree.root()).unwrap();
    assert!(node.targets(7));
    node.set_affinity(0b10);
    assert!(!node.targets(0));
    assert!(node.targets(1));
  }
}
