// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed resource events and reverse-dependency fanout.
//!
//! The [`EventStream`] is the pipeline's single notification artery: local
//! mutations and remote notifications alike are [`post`]ed here, the
//! daemon drains the queue each loop iteration to broadcast NOTIFY
//! messages, and in-process consumers subscribe to a live mirror.
//! [`post_depends`] walks the reverse edges of the [`DependencyGraph`] so
//! one edit notifies everything built on top of it, cycle-safe.
//!
//! [`post`]: EventStream::post
//! [`post_depends`]: EventStream::post_depends

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A resource came into existence (first import).
    Create,
    /// A resource's source changed.
    Modify,
    /// Something the resource depends on changed.
    Depends,
    /// A resource was removed.
    Delete,
}

/// One resource notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEvent {
    /// What happened.
    pub kind: EventKind,
    /// The affected resource.
    pub uuid: Uuid,
    /// Packed platform scope; `0` for all platforms.
    pub platform: u64,
    /// Monotonic trigger token; every event cascaded from one trigger
    /// carries the same token.
    pub token: u64,
}

/// A `(uuid, platform)` node in the dependency graph.
pub type DependencyNode = (Uuid, u64);

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed dependency edges between `(uuid, platform)` nodes, with the
/// reverse index maintained alongside for change fanout.
///
/// The graph is rebuilt opportunistically: whenever a source is imported,
/// read, or compiled its current `dependencies` metadata replaces the
/// node's outgoing edges.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: HashMap<DependencyNode, HashSet<DependencyNode>>,
    reverse: HashMap<DependencyNode, HashSet<DependencyNode>>,
}

impl DependencyGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `node`.
    pub fn set_dependencies<I>(&mut self, node: DependencyNode, deps: I)
    where
        I: IntoIterator<Item = DependencyNode>,
    {
        if let Some(old) = self.forward.remove(&node) {
            for dep in old {
                if let Some(back) = self.reverse.get_mut(&dep) {
                    back.remove(&node);
                }
            }
        }
        let deps: HashSet<DependencyNode> = deps.into_iter().collect();
        for dep in &deps {
            self.reverse.entry(*dep).or_default().insert(node);
        }
        if !deps.is_empty() {
            self.forward.insert(node, deps);
        }
    }

    /// Direct dependencies of `node`.
    #[must_use]
    pub fn dependencies(&self, node: DependencyNode) -> Vec<DependencyNode> {
        self.forward
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `(uuid, platform)`.
    ///
    /// The any-platform acts as a wildcard on both sides: an event at
    /// platform `0` reaches dependents registered at any platform of the
    /// UUID, and dependents registered against platform `0` hear about
    /// specialized changes.
    #[must_use]
    pub fn dependents(&self, uuid: Uuid, platform: u64) -> Vec<DependencyNode> {
        let mut out: HashSet<DependencyNode> = HashSet::new();
        if platform == rp_platform::PLATFORM_ANY {
            for (node, back) in &self.reverse {
                if node.0 == uuid {
                    out.extend(back.iter().copied());
                }
            }
        } else {
            for key in [(uuid, platform), (uuid, rp_platform::PLATFORM_ANY)] {
                if let Some(back) = self.reverse.get(&key) {
                    out.extend(back.iter().copied());
                }
            }
        }
        out.into_iter().collect()
    }

    /// Drop every node of `uuid` (all platforms), forward and reverse.
    pub fn remove_resource(&mut self, uuid: Uuid) {
        let nodes: Vec<DependencyNode> = self
            .forward
            .keys()
            .chain(self.reverse.keys())
            .filter(|node| node.0 == uuid)
            .copied()
            .collect();
        for node in nodes {
            self.set_dependencies(node, std::iter::empty());
            self.reverse.remove(&node);
        }
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// Queue plus live mirror of resource events.
///
/// Posting is synchronous and lock-cheap. The daemon drains the queue in
/// its main loop; async consumers subscribe to the broadcast mirror,
/// where a lagging receiver loses oldest events first (tokens make the
/// loss detectable).
#[derive(Debug)]
pub struct EventStream {
    queue: Mutex<VecDeque<ResourceEvent>>,
    mirror: broadcast::Sender<ResourceEvent>,
    tokens: rp_core::TokenSource,
}

impl EventStream {
    /// A stream with the given mirror capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (mirror, _) = broadcast::channel(capacity.max(1));
        Self {
            queue: Mutex::new(VecDeque::new()),
            mirror,
            tokens: rp_core::TokenSource::new(),
        }
    }

    /// Allocate a fresh trigger token.
    pub fn next_token(&self) -> u64 {
        self.tokens.next()
    }

    /// Enqueue one event and mirror it to subscribers.
    pub fn post(&self, kind: EventKind, uuid: Uuid, platform: u64, token: u64) {
        let event = ResourceEvent {
            kind,
            uuid,
            platform,
            token,
        };
        trace!(?kind, %uuid, platform, token, "resource event");
        self.queue
            .lock()
            .expect("event queue poisoned")
            .push_back(event);
        // No subscribers is fine; the pump still drains the queue.
        let _ = self.mirror.send(event);
    }

    /// Post DEPENDS to every transitive dependent of `(uuid, platform)`.
    ///
    /// Each dependent receives one DEPENDS event carrying `token`; the
    /// visited set keyed on `(uuid, platform)` guards against cycles
    /// reachable through user data.
    pub fn post_depends(&self, graph: &DependencyGraph, uuid: Uuid, platform: u64, token: u64) {
        let mut visited: HashSet<DependencyNode> = HashSet::new();
        visited.insert((uuid, platform));
        self.post_depends_inner(graph, uuid, platform, token, &mut visited);
    }

    fn post_depends_inner(
        &self,
        graph: &DependencyGraph,
        uuid: Uuid,
        platform: u64,
        token: u64,
        visited: &mut HashSet<DependencyNode>,
    ) {
        for (dep_uuid, dep_platform) in graph.dependents(uuid, platform) {
            if !visited.insert((dep_uuid, dep_platform)) {
                continue;
            }
            self.post(EventKind::Depends, dep_uuid, dep_platform, token);
            self.post_depends_inner(graph, dep_uuid, dep_platform, token, visited);
        }
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<ResourceEvent> {
        self.queue
            .lock()
            .expect("event queue poisoned")
            .drain(..)
            .collect()
    }

    /// Subscribe to the live mirror.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.mirror.subscribe()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn post_and_drain_preserve_order() {
        let stream = EventStream::default();
        let token = stream.next_token();
        stream.post(EventKind::Create, uuid(1), 0, token);
        stream.post(EventKind::Modify, uuid(1), 0, stream.next_token());

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Create);
        assert_eq!(events[1].kind, EventKind::Modify);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn mirror_sees_posts() {
        let stream = EventStream::default();
        let mut rx = stream.subscribe();
        stream.post(EventKind::Delete, uuid(9), 3, 7);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.platform, 3);
    }

    #[test]
    fn dependents_fan_out_recursively() {
        // a <- b <- c : editing a notifies b then c.
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(2), 0), [(uuid(1), 0)]);
        graph.set_dependencies((uuid(3), 0), [(uuid(2), 0)]);

        let stream = EventStream::default();
        stream.post_depends(&graph, uuid(1), 0, 42);

        let mut notified: Vec<_> = stream.drain().iter().map(|e| e.uuid).collect();
        notified.sort();
        assert_eq!(notified, vec![uuid(2), uuid(3)]);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn dependency_cycles_terminate() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(1), 0), [(uuid(2), 0)]);
        graph.set_dependencies((uuid(2), 0), [(uuid(1), 0)]);

        let stream = EventStream::default();
        stream.post_depends(&graph, uuid(1), 0, 5);

        let events = stream.drain();
        // Each node is notified at most once.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uuid, uuid(2));
        assert!(events.iter().all(|e| e.token == 5));
    }

    #[test]
    fn any_platform_acts_as_wildcard() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(2), 0), [(uuid(1), 4)]);

        // A file-level modify (platform 0) reaches the specialized edge.
        let stream = EventStream::default();
        stream.post_depends(&graph, uuid(1), 0, 1);
        assert_eq!(stream.drain().len(), 1);

        // And a specialized modify reaches any-platform registrations.
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(3), 0), [(uuid(1), 0)]);
        stream.post_depends(&graph, uuid(1), 4, 2);
        assert_eq!(stream.drain().len(), 1);
    }

    #[test]
    fn set_dependencies_replaces_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(2), 0), [(uuid(1), 0)]);
        graph.set_dependencies((uuid(2), 0), [(uuid(3), 0)]);

        assert!(graph.dependents(uuid(1), 0).is_empty());
        assert_eq!(graph.dependents(uuid(3), 0), vec![(uuid(2), 0)]);
        assert_eq!(graph.dependencies((uuid(2), 0)), vec![(uuid(3), 0)]);
    }

    #[test]
    fn remove_resource_drops_all_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies((uuid(2), 0), [(uuid(1), 0)]);
        graph.set_dependencies((uuid(1), 0), [(uuid(3), 0)]);
        graph.remove_resource(uuid(1));

        assert!(graph.dependencies((uuid(1), 0)).is_empty());
        assert!(graph.dependents(uuid(3), 0).is_empty());
        // The dangling edge from 2 to the removed resource is gone too.
        assert!(graph.dependents(uuid(1), 0).is_empty());
    }
}
