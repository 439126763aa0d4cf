//! Attribute access for directives.
//!
//! `AttrSnapshot` is what compile callbacks see; `Attributes` is the live
//! façade handed to link functions, with observers.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;

use crate::dom::{Dom, NodeId};
use crate::error::Result;
use crate::interpolate::Interpolation;
use crate::runtime::Runtime;

/// `myAttr` -> `my-attr`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE-TIME SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Normalized attribute values of a node as seen at compile time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttrSnapshot {
    values: BTreeMap<String, String>,
    /// Normalized name -> attribute name in the markup.
    names: BTreeMap<String, String>,
}

impl AttrSnapshot {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn dom_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Records an attribute from the markup. The first value for a
    /// normalized name wins; the markup name is always updated.
    pub fn insert(&mut self, normalized: &str, dom_name: &str, value: &str) {
        self.names.insert(normalized.to_string(), dom_name.to_string());
        self.values
            .entry(normalized.to_string())
            .or_insert_with(|| value.to_string());
    }

    /// Records a value with no markup attribute behind it (class and
    /// comment directives).
    pub fn insert_value(&mut self, normalized: &str, value: &str) {
        self.values.insert(normalized.to_string(), value.to_string());
    }

    /// Updates the value and writes it through to the node.
    pub fn set(&mut self, dom: &mut Dom, node: NodeId, key: &str, value: Option<&str>, dom_name: Option<&str>) {
        let name = match dom_name {
            Some(n) => {
                self.names.insert(key.to_string(), n.to_string());
                n.to_string()
            }
            None => self
                .names
                .entry(key.to_string())
                .or_insert_with(|| snake_case(key))
                .clone(),
        };
        match value {
            Some(v) => {
                self.values.insert(key.to_string(), v.to_string());
                dom.set_attr(node, &name, v);
            }
            None => {
                self.values.remove(key);
                dom.remove_attr(node, &name);
            }
        }
    }

    /// Attributes whose values contain `{{ }}` markers.
    pub fn interpolations(&self) -> Vec<(String, Interpolation)> {
        self.values
            .iter()
            .filter_map(|(k, v)| Interpolation::parse(v).map(|i| (k.clone(), i)))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINK-TIME FAÇADE
// ═══════════════════════════════════════════════════════════════════════════════

/// Observer callback; receives the attribute's current value.
pub type ObserverFn = Rc<dyn Fn(&mut Runtime, Option<&str>) -> Result<()>>;

#[derive(Default)]
struct ObserverList {
    entries: Vec<(u64, ObserverFn)>,
    /// Value is driven by an interpolation watch.
    interpolated: bool,
}

struct AttrState {
    node: NodeId,
    values: BTreeMap<String, Option<String>>,
    names: BTreeMap<String, String>,
    observers: BTreeMap<String, ObserverList>,
    next_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverHandle {
    key: String,
    id: u64,
}

/// Attribute façade shared by every directive on one linked node.
#[derive(Clone)]
pub struct Attributes {
    inner: Rc<RefCell<AttrState>>,
}

impl Attributes {
    pub fn from_snapshot(node: NodeId, snapshot: &AttrSnapshot) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AttrState {
                node,
                values: snapshot
                    .values
                    .iter()
                    .map(|(k, v)| (k.clone(), Some(v.clone())))
                    .collect(),
                names: snapshot.names.clone(),
                observers: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn node(&self) -> NodeId {
        self.inner.borrow().node
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.borrow().values.get(key).cloned().flatten()
    }

    /// The attribute was present on the markup (even if now unset).
    pub fn has(&self, key: &str) -> bool {
        self.inner.borrow().values.contains_key(key)
    }

    pub fn dom_name(&self, key: &str) -> Option<String> {
        self.inner.borrow().names.get(key).cloned()
    }

    /// Sets or removes (`None`) an attribute, optionally writing it to the
    /// node under `dom_name`, and notifies observers synchronously.
    pub fn set(
        &self,
        rt: &mut Runtime,
        key: &str,
        value: Option<&str>,
        write_dom: bool,
        dom_name: Option<&str>,
    ) {
        let (node, name, observers) = {
            let mut state = self.inner.borrow_mut();
            state.values.insert(key.to_string(), value.map(str::to_string));
            let name = match dom_name {
                Some(n) => {
                    state.names.insert(key.to_string(), n.to_string());
                    n.to_string()
                }
                None => state
                    .names
                    .entry(key.to_string())
                    .or_insert_with(|| snake_case(key))
                    .clone(),
            };
            let observers: Vec<ObserverFn> = state
                .observers
                .get(key)
                .map(|l| l.entries.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default();
            (state.node, name, observers)
        };
        if write_dom {
            match value {
                Some(v) => rt.dom.set_attr(node, &name, v),
                None => rt.dom.remove_attr(node, &name),
            }
        }
        for observer in observers {
            if let Err(err) = observer(rt, value) {
                rt.report(&err);
            }
        }
    }

    /// Registers `f` for changes of `key`. Unless the value comes from an
    /// interpolation, `f` also runs once asynchronously with the current value.
    pub fn observe(
        &self,
        rt: &mut Runtime,
        key: &str,
        f: impl Fn(&mut Runtime, Option<&str>) -> Result<()> + 'static,
    ) -> ObserverHandle {
        let f: ObserverFn = Rc::new(f);
        let id = {
            let mut state = self.inner.borrow_mut();
            state.next_id += 1;
            let id = state.next_id;
            state
                .observers
                .entry(key.to_string())
                .or_default()
                .entries
                .push((id, f.clone()));
            id
        };
        let attrs = self.clone();
        let key_owned = key.to_string();
        rt.eval_async(Box::new(move |rt: &mut Runtime| {
            let current = {
                let state = attrs.inner.borrow();
                let Some(list) = state.observers.get(&key_owned) else {
                    return Ok(());
                };
                let still_registered = list.entries.iter().any(|(i, _)| *i == id);
                if list.interpolated || !still_registered {
                    return Ok(());
                }
                state.values.get(&key_owned).cloned().flatten()
            };
            if let Some(value) = current {
                f(rt, Some(&value))?;
            }
            Ok(())
        }));
        ObserverHandle {
            key: key.to_string(),
            id,
        }
    }

    pub fn unobserve(&self, handle: &ObserverHandle) {
        if let Some(list) = self.inner.borrow_mut().observers.get_mut(&handle.key) {
            list.entries.retain(|(id, _)| *id != handle.id);
        }
    }

    pub(crate) fn mark_interpolated(&self, key: &str) {
        self.inner
            .borrow_mut()
            .observers
            .entry(key.to_string())
            .or_default()
            .interpolated = true;
    }

    /// Replaces a value without touching the node or observers.
    pub(crate) fn set_quiet(&self, key: &str, value: Option<String>) {
        self.inner.borrow_mut().values.insert(key.to_string(), value);
    }
}
