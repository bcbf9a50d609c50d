//! Object path tree
//!
//! Maps object paths to registered handlers. Each node keeps its children
//! sorted by segment name, so lookups binary-search one level at a time.
//!
//! ```text
//!   /                      (root, may hold a handler)
//!   ├── org
//!   │   └── example        EXPORT_CHILD_OBJECTS: claims /org/example/**
//!   └── svc
//!       ├── obj            plain handler
//!       └── tree           VIRTUAL_OBJECT | SUB_PATH: claims /svc/tree/**
//! ```
//!
//! A node is active while it has a handler or children; inactive nodes are
//! pruned when handlers go away.

use busline_wire::names::is_valid_object_path;
use tracing::debug;

use crate::export::{ObjectId, ObjectRef, RegisterOptions};

/// How much to remove when unregistering a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterMode {
    /// Only the handler at the path
    Node,
    /// The handler and everything registered beneath it
    Tree,
}

struct ObjectTreeNode {
    name: String,
    handler: Option<ObjectRef>,
    flags: RegisterOptions,
    children: Vec<ObjectTreeNode>,
}

impl ObjectTreeNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handler: None,
            flags: RegisterOptions::empty(),
            children: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.handler.is_some() || !self.children.is_empty()
    }

    fn claims_subtree(&self) -> bool {
        self.flags.contains(RegisterOptions::EXPORT_CHILD_OBJECTS)
            || self.is_virtual_subtree()
    }

    fn is_virtual_subtree(&self) -> bool {
        self.flags
            .contains(RegisterOptions::VIRTUAL_OBJECT | RegisterOptions::SUB_PATH)
    }

    fn child(&self, name: &str) -> Option<&ObjectTreeNode> {
        self.children
            .binary_search_by(|c| c.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.children[index])
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            handler: self.handler.clone(),
            flags: self.flags,
            children: self
                .children
                .iter()
                .filter(|c| c.is_active())
                .map(|c| c.name.clone())
                .collect(),
        }
    }
}

/// Copy of a node taken under the connection's read lock
#[derive(Debug, Clone)]
pub(crate) struct NodeSnapshot {
    pub(crate) handler: Option<ObjectRef>,
    pub(crate) flags: RegisterOptions,
    /// Names of active child nodes
    pub(crate) children: Vec<String>,
}

pub(crate) struct ObjectTree {
    root: ObjectTreeNode,
}

/// Path segments below the root; `/` has none
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl ObjectTree {
    pub(crate) fn new() -> Self {
        Self {
            root: ObjectTreeNode::new("/"),
        }
    }

    /// Bind `handler` at `path`. Nodes created on the way stay in place
    /// even when registration fails.
    pub(crate) fn register(&mut self, path: &str, handler: ObjectRef, flags: RegisterOptions) -> bool {
        if !is_valid_object_path(path) {
            return false;
        }
        let mut node = &mut self.root;
        for segment in segments(path) {
            if node.handler.is_some() && node.is_virtual_subtree() {
                debug!(
                    "cannot register object at {}: a virtual object handles all sub-paths",
                    path
                );
                return false;
            }
            let index = match node
                .children
                .binary_search_by(|c| c.name.as_str().cmp(segment))
            {
                Ok(index) => {
                    if node.children[index]
                        .flags
                        .contains(RegisterOptions::EXPORT_CHILD_OBJECTS)
                    {
                        debug!(
                            "cannot register object at {}: {} exports its own child objects",
                            path, segment
                        );
                        return false;
                    }
                    index
                }
                Err(index) => {
                    node.children.insert(index, ObjectTreeNode::new(segment));
                    index
                }
            };
            node = &mut node.children[index];
        }

        if node.handler.is_some() {
            return false;
        }
        let claims_children = if flags.contains(RegisterOptions::VIRTUAL_OBJECT) {
            flags.contains(RegisterOptions::SUB_PATH)
        } else {
            flags.contains(RegisterOptions::EXPORT_CHILD_OBJECTS)
        };
        if claims_children && !node.children.is_empty() {
            return false;
        }
        node.handler = Some(handler);
        node.flags = flags;
        true
    }

    /// Resolve `path` to the node answering for it and the length of the
    /// path prefix that node covers.
    ///
    /// The walk stops early at nodes claiming their whole subtree; the
    /// rest of the path is then left for the handler to resolve.
    pub(crate) fn find(&self, path: &str) -> Option<(NodeSnapshot, usize)> {
        if path == "/" && self.root.handler.is_some() {
            return Some((self.root.snapshot(), 1));
        }
        let length = path.len();
        let mut start = usize::from(path.starts_with('/'));
        let mut node = Some(&self.root);

        while start < length {
            let Some(current) = node else {
                break;
            };
            if current.claims_subtree() {
                break;
            }
            let end = path[start..].find('/').map_or(length, |i| start + i);
            node = current.child(&path[start..end]);
            start = end + 1;
        }

        let used = start.min(length);
        node.filter(|n| n.is_active()).map(|n| (n.snapshot(), used))
    }

    /// Handler bound exactly at `path`, or the virtual object answering
    /// for every path beneath it
    pub(crate) fn object_registered_at(&self, path: &str) -> Option<ObjectRef> {
        if !is_valid_object_path(path) {
            return None;
        }
        let mut node = &self.root;
        for segment in segments(path) {
            if node.is_virtual_subtree() {
                return node.handler.clone();
            }
            node = node.child(segment)?;
        }
        node.handler.clone()
    }

    pub(crate) fn unregister(&mut self, path: &str, mode: UnregisterMode) {
        if !is_valid_object_path(path) {
            return;
        }
        Self::unregister_at(&mut self.root, &segments(path), mode);
    }

    fn unregister_at(node: &mut ObjectTreeNode, path: &[&str], mode: UnregisterMode) {
        let Some((first, rest)) = path.split_first() else {
            node.handler = None;
            node.flags = RegisterOptions::empty();
            if mode == UnregisterMode::Tree {
                // children are dropped without notice, even if reachable
                // through another registration
                node.children.clear();
            }
            return;
        };
        let Ok(index) = node
            .children
            .binary_search_by(|c| c.name.as_str().cmp(first))
        else {
            return;
        };
        Self::unregister_at(&mut node.children[index], rest, mode);
        if !node.children[index].is_active() {
            node.children.remove(index);
        }
    }

    /// Clear every binding of the object `id` and prune what became empty.
    /// Returns true if anything was bound to it.
    pub(crate) fn destroy_handler(&mut self, id: ObjectId) -> bool {
        Self::destroy_in(&mut self.root, id)
    }

    fn destroy_in(node: &mut ObjectTreeNode, id: ObjectId) -> bool {
        let mut found = false;
        node.children.retain_mut(|child| {
            found |= Self::destroy_in(child, id);
            child.is_active()
        });
        if node.handler.as_ref().map(ObjectRef::id) == Some(id) {
            node.handler = None;
            node.flags = RegisterOptions::empty();
            found = true;
        }
        found
    }

    /// Paths where a signal of `category` emitted by `id` is exported.
    /// `category` is a signal export flag or `EXPORT_ADAPTORS`.
    pub(crate) fn emit_paths(&self, id: ObjectId, category: RegisterOptions) -> Vec<String> {
        let mut paths = Vec::new();
        Self::collect_emit_paths(&self.root, id, category, String::new(), &mut paths);
        paths
    }

    fn collect_emit_paths(
        node: &ObjectTreeNode,
        id: ObjectId,
        category: RegisterOptions,
        path: String,
        out: &mut Vec<String>,
    ) {
        for child in node.children.iter().filter(|c| c.is_active()) {
            Self::collect_emit_paths(child, id, category, format!("{}/{}", path, child.name), out);
        }
        if node.handler.as_ref().map(ObjectRef::id) != Some(id) {
            return;
        }
        if !node.flags.intersects(category) {
            return;
        }
        out.push(if path.is_empty() { "/".to_string() } else { path });
    }
}
