//! Scope tree.
//!
//! Scopes live in an arena owned by the `Runtime`. Each scope has a parent
//! pointer and an ordered list of children; lookups walk the parent chain
//! and stop at isolate boundaries.

use std::rc::Rc;

use serde::Serialize;

use crate::controller::ControllerId;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::value::{Value, ValueMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(pub u32);

pub type WatchFn = Rc<dyn Fn(&mut Runtime, ScopeId) -> Result<Value>>;
/// Receives the new value and the previous one (`None` on the first call).
pub type WatchListener = Rc<dyn Fn(&mut Runtime, &Value, Option<&Value>) -> Result<()>>;
pub type DestroyHook = Box<dyn FnOnce(&mut Runtime)>;

#[derive(Clone)]
pub enum WatchSource {
    Expression(String),
    Native(WatchFn),
}

pub(crate) struct Watcher {
    pub(crate) id: u64,
    pub(crate) source: WatchSource,
    pub(crate) listener: Option<WatchListener>,
    pub(crate) last: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHandle {
    pub scope: ScopeId,
    pub id: u64,
}

pub(crate) struct Scope {
    pub(crate) parent: Option<ScopeId>,
    pub(crate) children: Vec<ScopeId>,
    pub(crate) isolate: bool,
    pub(crate) vars: ValueMap,
    pub(crate) watchers: Vec<Watcher>,
    pub(crate) check_hooks: Vec<ControllerId>,
    pub(crate) destroy_hooks: Vec<DestroyHook>,
    pub(crate) destroyed: bool,
}

impl Scope {
    fn new(parent: Option<ScopeId>, isolate: bool) -> Self {
        Self {
            parent,
            children: Vec::new(),
            isolate,
            vars: ValueMap::new(),
            watchers: Vec::new(),
            check_hooks: Vec::new(),
            destroy_hooks: Vec::new(),
            destroyed: false,
        }
    }
}

pub struct ScopeArena {
    scopes: Vec<Scope>,
    next_watch_id: u64,
}

impl Default for ScopeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeArena {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(None, false)],
            next_watch_id: 0,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub(crate) fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub(crate) fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    pub fn new_child(&mut self, parent: ScopeId, isolate: bool) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(Some(parent), isolate));
        self.scope_mut(parent).children.push(id);
        tracing::trace!(?id, ?parent, isolate, "scope created");
        id
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.scope(id).parent
    }

    pub fn children(&self, id: ScopeId) -> &[ScopeId] {
        &self.scope(id).children
    }

    pub fn is_isolate(&self, id: ScopeId) -> bool {
        self.scope(id).isolate
    }

    pub fn is_destroyed(&self, id: ScopeId) -> bool {
        self.scope(id).destroyed
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Number of scopes that have not been destroyed.
    pub fn live_count(&self) -> usize {
        self.scopes.iter().filter(|s| !s.destroyed).count()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // VARIABLES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Scope in the lookup chain of `id` that owns `name`.
    pub fn owner_of(&self, id: ScopeId, name: &str) -> Option<ScopeId> {
        let mut current = Some(id);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            if scope.vars.contains_key(name) {
                return Some(scope_id);
            }
            if scope.isolate {
                return None;
            }
            current = scope.parent;
        }
        None
    }

    pub fn get(&self, id: ScopeId, name: &str) -> Value {
        self.owner_of(id, name)
            .and_then(|owner| self.scope(owner).vars.get(name).cloned())
            .unwrap_or_default()
    }

    pub fn get_own(&self, id: ScopeId, name: &str) -> Option<&Value> {
        self.scope(id).vars.get(name)
    }

    /// Writes `name` on `id` itself, shadowing any inherited value.
    pub fn set(&mut self, id: ScopeId, name: &str, value: impl Into<Value>) {
        self.scope_mut(id).vars.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, id: ScopeId, name: &str) {
        self.scope_mut(id).vars.remove(name);
    }

    /// Writes below an existing variable, mutating it where it lives so the
    /// change is shared with every scope that inherits it.
    pub fn set_path(&mut self, id: ScopeId, root: &str, path: &[String], value: Value) -> bool {
        let owner = self.owner_of(id, root).unwrap_or(id);
        let slot = self
            .scope_mut(owner)
            .vars
            .entry(root.to_string())
            .or_default();
        slot.set_path(path, value)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // WATCHERS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn watch(
        &mut self,
        id: ScopeId,
        source: WatchSource,
        listener: Option<WatchListener>,
    ) -> WatchHandle {
        self.next_watch_id += 1;
        let watch_id = self.next_watch_id;
        self.scope_mut(id).watchers.push(Watcher {
            id: watch_id,
            source,
            listener,
            last: None,
        });
        WatchHandle {
            scope: id,
            id: watch_id,
        }
    }

    pub fn unwatch(&mut self, handle: WatchHandle) {
        self.scope_mut(handle.scope)
            .watchers
            .retain(|w| w.id != handle.id);
    }

    pub(crate) fn watcher_ids(&self, id: ScopeId) -> Vec<u64> {
        self.scope(id).watchers.iter().map(|w| w.id).collect()
    }

    pub(crate) fn watcher(&self, id: ScopeId, watch_id: u64) -> Option<&Watcher> {
        self.scope(id).watchers.iter().find(|w| w.id == watch_id)
    }

    pub(crate) fn watcher_mut(&mut self, id: ScopeId, watch_id: u64) -> Option<&mut Watcher> {
        self.scope_mut(id)
            .watchers
            .iter_mut()
            .find(|w| w.id == watch_id)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TRAVERSAL AND TEARDOWN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Live scopes below and including `id`, parents before children.
    pub fn walk(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.scope(current).destroyed {
                continue;
            }
            out.push(current);
            for child in self.scope(current).children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    pub fn on_destroy(&mut self, id: ScopeId, hook: DestroyHook) {
        self.scope_mut(id).destroy_hooks.push(hook);
    }

    /// Detaches `id` from its parent and marks the subtree destroyed.
    /// Returns the destroyed scopes top-down together with their hooks.
    pub(crate) fn tear_down(&mut self, id: ScopeId) -> Vec<(ScopeId, Vec<ControllerId>, Vec<DestroyHook>)> {
        if self.scope(id).destroyed {
            return Vec::new();
        }
        let order = self.walk(id);
        if let Some(parent) = self.scope(id).parent {
            self.scope_mut(parent).children.retain(|c| *c != id);
        }
        let mut out = Vec::new();
        for scope_id in order {
            let scope = self.scope_mut(scope_id);
            scope.destroyed = true;
            scope.watchers.clear();
            let checks = std::mem::take(&mut scope.check_hooks);
            let hooks = std::mem::take(&mut scope.destroy_hooks);
            out.push((scope_id, checks, hooks));
        }
        out
    }
}
