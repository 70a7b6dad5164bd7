//! Ownership tree of live listener handles.

use std::collections::BTreeMap;

use tokio::task::JoinHandle;

use crate::remote::ListenerRegistration;

/// One live listener: the store-side registration plus the task draining
/// its events.
#[derive(Debug)]
pub struct SubscriptionHandle {
    registration: ListenerRegistration,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(registration: ListenerRegistration, task: JoinHandle<()>) -> Self {
        Self { registration, task }
    }

    pub fn cancel(self) {
        self.registration.remove();
        self.task.abort();
    }
}

#[derive(Debug, Default)]
struct Node {
    handles: Vec<SubscriptionHandle>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn cancel(self) -> usize {
        let mut cancelled = self.handles.len();
        for handle in self.handles {
            handle.cancel();
        }
        for (_, child) in self.children {
            cancelled += child.cancel();
        }
        cancelled
    }

    fn count(&self) -> usize {
        self.handles.len() + self.children.values().map(Node::count).sum::<usize>()
    }
}

/// Listener handles keyed by the id path of the entity that owns them,
/// e.g. `[trip]` for a trip's dashboards/cards/expenses listeners and
/// `[trip, dashboard]` for that dashboard's groups listener.
#[derive(Debug, Default)]
pub struct SubscriptionTree {
    roots: BTreeMap<String, Node>,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, path: &[&str]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.get(*first)?;
        for id in rest {
            node = node.children.get(*id)?;
        }
        Some(node)
    }

    fn node_mut_or_insert(&mut self, path: &[&str]) -> Option<&mut Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.entry(first.to_string()).or_default();
        for id in rest {
            node = node.children.entry(id.to_string()).or_default();
        }
        Some(node)
    }

    pub fn contains(&self, path: &[&str]) -> bool {
        self.node(path).is_some()
    }

    /// Creates the node at `path`. Returns `false` when it already existed,
    /// which lets callers claim a subtree before subscribing.
    pub fn reserve(&mut self, path: &[&str]) -> bool {
        if self.contains(path) {
            return false;
        }
        self.node_mut_or_insert(path).is_some()
    }

    /// Hangs `handle` under `path`, creating intermediate nodes.
    pub fn attach(&mut self, path: &[&str], handle: SubscriptionHandle) {
        match self.node_mut_or_insert(path) {
            Some(node) => node.handles.push(handle),
            None => handle.cancel(),
        }
    }

    /// Ids of the direct children of `path`.
    pub fn child_ids(&self, path: &[&str]) -> Vec<String> {
        if path.is_empty() {
            return self.roots.keys().cloned().collect();
        }
        self.node(path)
            .map(|node| node.children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancels every listener at and below `path` and removes the node.
    /// Returns how many listeners were cancelled.
    pub fn unsubscribe_subtree(&mut self, path: &[&str]) -> usize {
        let Some((last, parents)) = path.split_last() else {
            return 0;
        };
        let removed = if parents.is_empty() {
            self.roots.remove(*last)
        } else {
            let mut node = match self.roots.get_mut(parents[0]) {
                Some(node) => node,
                None => return 0,
            };
            for id in &parents[1..] {
                node = match node.children.get_mut(*id) {
                    Some(child) => child,
                    None => return 0,
                };
            }
            node.children.remove(*last)
        };
        removed.map(Node::cancel).unwrap_or_default()
    }

    pub fn unsubscribe_all(&mut self) -> usize {
        std::mem::take(&mut self.roots)
            .into_values()
            .map(Node::cancel)
            .sum()
    }

    /// Number of live listeners at and below `path`, or in the whole tree
    /// when `path` is empty.
    pub fn listener_count(&self, path: &[&str]) -> usize {
        if path.is_empty() {
            return self.roots.values().map(Node::count).sum();
        }
        self.node(path).map(Node::count).unwrap_or_default()
    }
}
