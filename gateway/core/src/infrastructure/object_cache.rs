// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Object Resolution Cache
//!
//! Per-export map from object id to live [`ObjectRef`], plus the
//! `(parent, name) -> child` links discovered by lookups. The resolver's
//! soft path is served entirely from here.
//!
//! The object map is bounded. Once it grows past its limit the least
//! recently used objects that nothing outside the cache still references
//! are evicted together with their name links. An evicted object is simply
//! looked up by id again on its next use.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Identity-to-live-object mapping and name links

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::domain::backend::ObjectRef;
use crate::domain::file_handle::ObjectId;

/// Outcome of filling an entry location from the cache.
#[derive(Debug, Clone)]
pub enum EntryFill {
    /// Parent and child are both known. `fresh` is false once the link has
    /// outlived the entry timeout.
    Resolved {
        parent: ObjectRef,
        child: ObjectRef,
        fresh: bool,
    },
    /// Parent is live but the child name has not been confirmed.
    NeedsLookup { parent: ObjectRef },
    /// The parent itself is not cached.
    ParentUnresolved,
}

#[derive(Debug, Clone)]
struct EntryLink {
    child: ObjectId,
    linked_at: Instant,
}

/// Default bound on cached objects per export
pub const DEFAULT_MAX_OBJECTS: usize = 65_536;

struct CachedObject {
    object: ObjectRef,
    last_used: AtomicU64,
}

impl CachedObject {
    /// Evictable once the cache holds the only reference
    fn is_idle(&self) -> bool {
        self.object.ref_count() == 1
    }
}

#[derive(Default)]
struct CacheState {
    objects: HashMap<ObjectId, CachedObject>,
    entries: HashMap<(ObjectId, String), EntryLink>,
}

impl CacheState {
    fn insert(&mut self, object: &ObjectRef, tick: u64) {
        self.objects
            .entry(object.id())
            .and_modify(|cached| cached.last_used.store(tick, Ordering::Relaxed))
            .or_insert_with(|| CachedObject {
                object: object.clone(),
                last_used: AtomicU64::new(tick),
            });
    }

    /// Evict idle objects, oldest first, until `target` remain
    fn evict_down_to(&mut self, target: usize) -> usize {
        let excess = self.objects.len().saturating_sub(target);
        if excess == 0 {
            return 0;
        }
        let mut idle: Vec<(u64, ObjectId)> = self
            .objects
            .iter()
            .filter(|(_, cached)| cached.is_idle())
            .map(|(id, cached)| (cached.last_used.load(Ordering::Relaxed), *id))
            .collect();
        idle.sort_unstable();
        idle.truncate(excess);

        for (_, id) in &idle {
            self.objects.remove(id);
        }
        let objects = &self.objects;
        self.entries.retain(|(parent, _), link| {
            objects.contains_key(parent) && objects.contains_key(&link.child)
        });
        idle.len()
    }
}

pub struct ObjectCache {
    entry_timeout: Duration,
    max_objects: usize,
    clock: AtomicU64,
    state: RwLock<CacheState>,
}

impl ObjectCache {
    pub fn new(entry_timeout: Duration) -> Self {
        Self::with_capacity(entry_timeout, DEFAULT_MAX_OBJECTS)
    }

    pub fn with_capacity(entry_timeout: Duration, max_objects: usize) -> Self {
        Self {
            entry_timeout,
            max_objects: max_objects.max(1),
            clock: AtomicU64::new(0),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn entry_timeout(&self) -> Duration {
        self.entry_timeout
    }

    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Soft lookup by id
    pub fn find(&self, id: ObjectId) -> Option<ObjectRef> {
        let state = self.state.read();
        let cached = state.objects.get(&id)?;
        cached.last_used.store(self.tick(), Ordering::Relaxed);
        Some(cached.object.clone())
    }

    /// Make `object` reachable by id
    pub fn link_object(&self, object: &ObjectRef) {
        let mut state = self.state.write();
        state.insert(object, self.tick());
        self.trim(&mut state);
    }

    /// Record `parent/name -> child`. `.` and `..` are never cached.
    pub fn link_entry(&self, parent: &ObjectRef, name: &str, child: &ObjectRef) {
        let mut state = self.state.write();
        let tick = self.tick();
        state.insert(parent, tick);
        state.insert(child, tick);
        if !is_dot_name(name) {
            state.entries.insert(
                (parent.id(), name.to_string()),
                EntryLink {
                    child: child.id(),
                    linked_at: Instant::now(),
                },
            );
        }
        self.trim(&mut state);
    }

    /// Evict an eighth of the capacity at once so inserts stay amortised
    fn trim(&self, state: &mut CacheState) {
        if state.objects.len() <= self.max_objects {
            return;
        }
        let target = self.max_objects - self.max_objects / 8;
        let evicted = state.evict_down_to(target);
        debug!(
            "Evicted {} idle objects, {} remain cached",
            evicted,
            state.objects.len()
        );
    }

    /// Drop the `parent/name` link, returning the child it pointed at
    pub fn unlink_entry(&self, parent: ObjectId, name: &str) -> Option<ObjectId> {
        self.state
            .write()
            .entries
            .remove(&(parent, name.to_string()))
            .map(|link| link.child)
    }

    /// Forget an object and every link from or to it
    pub fn forget(&self, id: ObjectId) {
        let mut state = self.state.write();
        state.objects.remove(&id);
        state
            .entries
            .retain(|(parent, _), link| *parent != id && link.child != id);
    }

    /// Try to satisfy an entry resolution from cached state alone
    pub fn fill_entry(&self, parent: ObjectId, name: &str) -> EntryFill {
        let state = self.state.read();
        let Some(parent_entry) = state.objects.get(&parent) else {
            return EntryFill::ParentUnresolved;
        };
        let tick = self.tick();
        parent_entry.last_used.store(tick, Ordering::Relaxed);
        let parent_ref = parent_entry.object.clone();

        let link = state.entries.get(&(parent, name.to_string()));
        match link.and_then(|l| state.objects.get(&l.child).map(|c| (l, c))) {
            Some((link, child)) => {
                child.last_used.store(tick, Ordering::Relaxed);
                EntryFill::Resolved {
                    parent: parent_ref,
                    child: child.object.clone(),
                    fresh: link.linked_at.elapsed() < self.entry_timeout,
                }
            }
            None => EntryFill::NeedsLookup { parent: parent_ref },
        }
    }

    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().entries.len()
    }
}

fn is_dot_name(name: &str) -> bool {
    name == "." || name == ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::FileType;

    fn dir() -> ObjectRef {
        ObjectRef::new(ObjectId::new(), FileType::Directory)
    }

    fn file() -> ObjectRef {
        ObjectRef::new(ObjectId::new(), FileType::Regular)
    }

    #[test]
    fn test_fill_entry_outcomes() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        let parent = dir();
        let child = file();

        assert!(matches!(
            cache.fill_entry(parent.id(), "a"),
            EntryFill::ParentUnresolved
        ));

        cache.link_object(&parent);
        assert!(matches!(
            cache.fill_entry(parent.id(), "a"),
            EntryFill::NeedsLookup { .. }
        ));

        cache.link_entry(&parent, "a", &child);
        match cache.fill_entry(parent.id(), "a") {
            EntryFill::Resolved { child: c, fresh, .. } => {
                assert_eq!(c, child);
                assert!(fresh);
            }
            other => panic!("unexpected fill: {:?}", other),
        }
    }

    #[test]
    fn test_expired_link_is_not_fresh() {
        let cache = ObjectCache::new(Duration::ZERO);
        let parent = dir();
        cache.link_entry(&parent, "a", &file());
        assert!(matches!(
            cache.fill_entry(parent.id(), "a"),
            EntryFill::Resolved { fresh: false, .. }
        ));
    }

    #[test]
    fn test_unlink_and_forget() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        let parent = dir();
        let child = file();
        cache.link_entry(&parent, "a", &child);
        cache.link_entry(&parent, "b", &child);

        assert_eq!(cache.unlink_entry(parent.id(), "a"), Some(child.id()));
        assert_eq!(cache.entry_count(), 1);

        cache.forget(child.id());
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.find(child.id()).is_none());
        assert!(cache.find(parent.id()).is_some());
    }

    #[test]
    fn test_forget_directory_drops_links_below_it() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        let root = dir();
        let sub = dir();
        cache.link_entry(&root, "sub", &sub);
        cache.link_entry(&sub, "a", &file());

        cache.forget(sub.id());
        assert_eq!(cache.entry_count(), 0);
        assert!(matches!(
            cache.fill_entry(sub.id(), "a"),
            EntryFill::ParentUnresolved
        ));
    }

    #[test]
    fn test_capacity_evicts_idle_objects_oldest_first() {
        let cache = ObjectCache::with_capacity(Duration::from_secs(60), 16);
        let root = dir();
        let pinned = file();
        cache.link_entry(&root, "pinned", &pinned);

        for i in 0..200 {
            cache.link_entry(&root, &format!("f{}", i), &file());
            assert!(cache.object_count() <= 16);
        }
        // Held outside the cache, so never evicted
        assert!(cache.find(root.id()).is_some());
        assert!(cache.find(pinned.id()).is_some());
        assert!(matches!(
            cache.fill_entry(root.id(), "pinned"),
            EntryFill::Resolved { .. }
        ));
        assert!(matches!(
            cache.fill_entry(root.id(), "f0"),
            EntryFill::NeedsLookup { .. }
        ));
        assert!(cache.entry_count() < 16);
    }

    #[test]
    fn test_capacity_waits_for_referenced_objects() {
        let cache = ObjectCache::with_capacity(Duration::from_secs(60), 4);
        let held: Vec<ObjectRef> = (0..8).map(|_| file()).collect();
        for object in &held {
            cache.link_object(object);
        }
        assert_eq!(cache.object_count(), 8);

        drop(held);
        cache.link_object(&file());
        assert!(cache.object_count() <= 4);
    }

    #[test]
    fn test_dot_names_not_linked() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        let parent = dir();
        cache.link_entry(&parent, "..", &dir());
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.object_count(), 2);
    }
}
