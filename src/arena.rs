//! Context arena
//!
//! All contexts of an engine live in one arena, indexed by integer id.
//! Parent, child, and root links are ids rather than references, so the tree
//! has no reference cycles and teardown is a map removal. The arena owns the
//! id counter; ids are unique per engine, not process-wide.

use crate::signal::CancelToken;
use std::collections::HashMap;

pub type CtxId = u64;

/// Per-context state. `most_recent_desc_time` is meaningful on root slots
/// only: it tracks the furthest logical time any descendant of that root has
/// reached, and never decreases.
pub(crate) struct CtxSlot {
    pub parent: Option<CtxId>,
    pub root: CtxId,
    pub children: Vec<CtxId>,
    pub time: f64,
    pub start_time: f64,
    pub bpm: f64,
    pub cancel: CancelToken,
    /// Live wait ids, kept so cancellation can reach suspended waits.
    pub pending_waits: Vec<u64>,
    pub debug_name: Option<String>,
    pub most_recent_desc_time: f64,
    /// Set when the driving task has settled; the slot is released once it is
    /// also childless.
    pub settled: bool,
}

pub(crate) struct ContextArena {
    slots: HashMap<CtxId, CtxSlot>,
    next_id: CtxId,
}

impl ContextArena {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> CtxId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create a root context slot. Its root link points at itself.
    pub fn alloc_root(&mut self, bpm: f64, debug_name: Option<String>) -> (CtxId, CancelToken) {
        let id = self.alloc_id();
        let cancel = CancelToken::new();
        self.slots.insert(
            id,
            CtxSlot {
                parent: None,
                root: id,
                children: Vec::new(),
                time: 0.0,
                start_time: 0.0,
                bpm,
                cancel: cancel.clone(),
                pending_waits: Vec::new(),
                debug_name,
                most_recent_desc_time: 0.0,
                settled: false,
            },
        );
        (id, cancel)
    }

    /// Create a child slot under `parent`, inheriting bpm and root link, and
    /// register it in the parent's child list.
    pub fn alloc_child(
        &mut self,
        parent: CtxId,
        start_time: f64,
        debug_name: Option<String>,
    ) -> Option<(CtxId, CancelToken)> {
        let (root, bpm) = {
            let p = self.slots.get(&parent)?;
            (p.root, p.bpm)
        };
        let id = self.alloc_id();
        let cancel = CancelToken::new();
        self.slots.insert(
            id,
            CtxSlot {
                parent: Some(parent),
                root,
                children: Vec::new(),
                time: start_time,
                start_time,
                bpm,
                cancel: cancel.clone(),
                pending_waits: Vec::new(),
                debug_name,
                most_recent_desc_time: 0.0,
                settled: false,
            },
        );
        if let Some(p) = self.slots.get_mut(&parent) {
            p.children.push(id);
        }
        Some((id, cancel))
    }

    pub fn get(&self, id: CtxId) -> Option<&CtxSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: CtxId) -> Option<&mut CtxSlot> {
        self.slots.get_mut(&id)
    }

    /// Furthest logical time any context under `id`'s root has reached.
    pub fn most_recent_desc_time(&self, id: CtxId) -> f64 {
        self.get(id)
            .and_then(|s| self.get(s.root))
            .map(|r| r.most_recent_desc_time)
            .unwrap_or(0.0)
    }

    /// Monotonic max: raises the root's bookkeeping value, never lowers it.
    pub fn raise_most_recent_desc_time(&mut self, id: CtxId, t: f64) {
        let root = match self.get(id) {
            Some(s) => s.root,
            None => return,
        };
        if let Some(r) = self.slots.get_mut(&root) {
            r.most_recent_desc_time = r.most_recent_desc_time.max(t);
        }
    }

    /// Ids of `id` and every descendant, preorder. Used for cancellation.
    pub fn collect_subtree(&self, id: CtxId) -> Vec<CtxId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(slot) = self.get(cur) {
                out.push(cur);
                stack.extend(slot.children.iter().copied());
            }
        }
        out
    }

    /// Mark `id`'s driving task settled and release the slot if it has no
    /// live children. Release cascades upward through settled, now-childless
    /// ancestors so long-running trees with many transient branches don't
    /// accumulate dead slots.
    pub fn mark_settled(&mut self, id: CtxId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.settled = true;
        }
        self.try_release(id);
    }

    fn try_release(&mut self, id: CtxId) {
        let releasable = matches!(self.slots.get(&id), Some(s) if s.settled && s.children.is_empty());
        if !releasable {
            return;
        }
        let parent = self.slots.remove(&id).and_then(|s| s.parent);
        if let Some(p) = parent {
            if let Some(pslot) = self.slots.get_mut(&p) {
                pslot.children.retain(|c| *c != id);
            }
            self.try_release(p);
        }
    }

    /// Number of live slots (diagnostics).
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_bpm_and_root() {
        let mut arena = ContextArena::new();
        let (root, _) = arena.alloc_root(132.0, None);
        let (child, _) = arena.alloc_child(root, 1.5, None).unwrap();
        let (grand, _) = arena.alloc_child(child, 2.0, None).unwrap();

        let c = arena.get(child).unwrap();
        assert_eq!(c.root, root);
        assert_eq!(c.parent, Some(root));
        assert!((c.bpm - 132.0).abs() < 1e-12);
        assert!((c.time - 1.5).abs() < 1e-12);
        assert!((c.start_time - 1.5).abs() < 1e-12);

        assert_eq!(arena.get(grand).unwrap().root, root);
        assert_eq!(arena.get(root).unwrap().children, vec![child]);
    }

    #[test]
    fn test_most_recent_desc_time_monotonic() {
        let mut arena = ContextArena::new();
        let (root, _) = arena.alloc_root(60.0, None);
        let (child, _) = arena.alloc_child(root, 0.0, None).unwrap();

        arena.raise_most_recent_desc_time(child, 3.0);
        assert!((arena.most_recent_desc_time(child) - 3.0).abs() < 1e-12);
        // Lower values never win.
        arena.raise_most_recent_desc_time(root, 1.0);
        assert!((arena.most_recent_desc_time(root) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_collect_subtree_skips_other_branches() {
        let mut arena = ContextArena::new();
        let (root, _) = arena.alloc_root(60.0, None);
        let (a, _) = arena.alloc_child(root, 0.0, None).unwrap();
        let (a1, _) = arena.alloc_child(a, 0.0, None).unwrap();
        let (b, _) = arena.alloc_child(root, 0.0, None).unwrap();

        let mut sub = arena.collect_subtree(a);
        sub.sort_unstable();
        assert_eq!(sub, vec![a, a1]);
        assert!(!arena.collect_subtree(a).contains(&b));
    }

    #[test]
    fn test_release_cascades_through_settled_parents() {
        let mut arena = ContextArena::new();
        let (root, _) = arena.alloc_root(60.0, None);
        let (child, _) = arena.alloc_child(root, 0.0, None).unwrap();
        let (grand, _) = arena.alloc_child(child, 0.0, None).unwrap();
        assert_eq!(arena.len(), 3);

        // Child settles first but is kept alive by its running grandchild.
        arena.mark_settled(child);
        assert_eq!(arena.len(), 3);

        // Grandchild settles: both are released, root stays.
        arena.mark_settled(grand);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(root).unwrap().children.is_empty());
        assert!(arena.get(child).is_none());
    }
}
