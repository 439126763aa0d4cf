//! Directive controllers and their lifecycle hooks.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::dom::NodeId;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::scope::ScopeId;
use crate::value::{Value, ValueMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ControllerId(pub u32);

/// A bound property that changed during one digest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleChange {
    pub previous_value: Value,
    pub current_value: Value,
    #[serde(skip)]
    first: bool,
}

impl SimpleChange {
    pub fn new(previous_value: Value, current_value: Value) -> Self {
        Self {
            previous_value,
            current_value,
            first: false,
        }
    }

    pub fn first(current_value: Value) -> Self {
        Self {
            previous_value: Value::Undefined,
            current_value,
            first: true,
        }
    }

    pub fn is_first_change(&self) -> bool {
        self.first
    }
}

pub type Changes = BTreeMap<String, SimpleChange>;

/// Controllers located through a directive's `require` declaration.
#[derive(Debug, Clone, Default)]
pub enum Required {
    #[default]
    None,
    Single(Option<ControllerHandle>),
    List(Vec<Option<ControllerHandle>>),
    Map(BTreeMap<String, Option<ControllerHandle>>),
}

impl Required {
    /// First located controller registered under `name`.
    pub fn get(&self, name: &str) -> Option<&ControllerHandle> {
        match self {
            Required::None => None,
            Required::Single(c) => c.as_ref().filter(|c| c.name() == name),
            Required::List(items) => items.iter().flatten().find(|c| c.name() == name),
            Required::Map(map) => map
                .get(name)
                .and_then(|c| c.as_ref())
                .or_else(|| map.values().flatten().find(|c| c.name() == name)),
        }
    }

    pub fn single(&self) -> Option<&ControllerHandle> {
        match self {
            Required::Single(c) => c.as_ref(),
            _ => None,
        }
    }
}

/// What a hook can reach while it runs.
pub struct HookContext<'a> {
    pub rt: &'a mut Runtime,
    pub scope: ScopeId,
    pub node: NodeId,
    /// Name of the directive that owns the controller.
    pub directive: String,
    pub bindings: Rc<RefCell<ValueMap>>,
    pub required: Rc<Required>,
}

impl HookContext<'_> {
    pub fn binding(&self, key: &str) -> Value {
        self.bindings.borrow().get(key).cloned().unwrap_or_default()
    }

    pub fn set_binding(&self, key: &str, value: impl Into<Value>) {
        self.bindings.borrow_mut().insert(key.to_string(), value.into());
    }
}

/// Behavior attached to a directive instance. Every hook is optional.
pub trait Controller: Any {
    fn on_init(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_changes(&mut self, _ctx: &mut HookContext<'_>, _changes: &Changes) -> Result<()> {
        Ok(())
    }

    fn do_check(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn post_link(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_destroy(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Controller with no behavior beyond its bound properties.
#[derive(Debug, Default)]
pub struct BasicController;

impl Controller for BasicController {}

struct HandleInner {
    name: String,
    instance: Rc<RefCell<dyn Controller>>,
    any: Rc<dyn Any>,
    bindings: Rc<RefCell<ValueMap>>,
}

/// Shared reference to a live controller. Clones refer to the same instance.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Rc<HandleInner>,
}

impl ControllerHandle {
    pub fn new<T: Controller>(name: &str, controller: T, bindings: Rc<RefCell<ValueMap>>) -> Self {
        let rc = Rc::new(RefCell::new(controller));
        let instance: Rc<RefCell<dyn Controller>> = rc.clone();
        let any: Rc<dyn Any> = rc;
        Self {
            inner: Rc::new(HandleInner {
                name: name.to_string(),
                instance,
                any,
                bindings,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn instance(&self) -> Rc<RefCell<dyn Controller>> {
        self.inner.instance.clone()
    }

    pub fn bindings(&self) -> Rc<RefCell<ValueMap>> {
        self.inner.bindings.clone()
    }

    pub fn binding(&self, key: &str) -> Value {
        self.inner.bindings.borrow().get(key).cloned().unwrap_or_default()
    }

    pub fn set_binding(&self, key: &str, value: Value) {
        self.inner.bindings.borrow_mut().insert(key.to_string(), value);
    }

    pub fn bindings_snapshot(&self) -> ValueMap {
        self.inner.bindings.borrow().clone()
    }

    pub fn same(&self, other: &ControllerHandle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn shares_bindings(&self, other: &ControllerHandle) -> bool {
        Rc::ptr_eq(&self.inner.bindings, &other.inner.bindings)
    }

    /// Typed access to the controller behind this handle.
    pub fn downcast<T: Controller>(&self) -> Option<Rc<RefCell<T>>> {
        self.inner.any.clone().downcast::<RefCell<T>>().ok()
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("name", &self.inner.name)
            .field("bindings", &*self.inner.bindings.borrow())
            .finish()
    }
}

/// Runtime bookkeeping for one instantiated controller.
pub(crate) struct ControllerSlot {
    pub(crate) handle: ControllerHandle,
    pub(crate) scope: ScopeId,
    pub(crate) node: NodeId,
    pub(crate) required: Rc<Required>,
    pub(crate) destroyed: bool,
}

#[derive(Clone)]
pub(crate) enum Hook {
    Init,
    Changes(Changes),
    Check,
    PostLink,
    Destroy,
}

impl Hook {
    fn label(&self) -> &'static str {
        match self {
            Hook::Init => "on_init",
            Hook::Changes(_) => "on_changes",
            Hook::Check => "do_check",
            Hook::PostLink => "post_link",
            Hook::Destroy => "on_destroy",
        }
    }
}

impl Runtime {
    pub(crate) fn register_controller(
        &mut self,
        handle: ControllerHandle,
        scope: ScopeId,
        node: NodeId,
    ) -> ControllerId {
        let id = ControllerId(self.next_controller);
        self.next_controller += 1;
        self.controllers.insert(
            id,
            ControllerSlot {
                handle,
                scope,
                node,
                required: Rc::new(Required::None),
                destroyed: false,
            },
        );
        id
    }

    pub(crate) fn controller_slot_mut(&mut self, id: ControllerId) -> Option<&mut ControllerSlot> {
        self.controllers.get_mut(&id)
    }

    /// Handle of a live controller; `None` once its node was removed.
    pub fn controller_handle(&self, id: ControllerId) -> Option<&ControllerHandle> {
        self.controllers.get(&id).map(|slot| &slot.handle)
    }

    /// Runs one lifecycle hook. Failures are reported, never propagated, so
    /// one controller cannot stop another's hooks from running.
    pub(crate) fn call_hook(&mut self, id: ControllerId, hook: Hook) {
        let Some(slot) = self.controllers.get_mut(&id) else {
            return;
        };
        if slot.destroyed {
            return;
        }
        let handle = slot.handle.clone();
        let scope = slot.scope;
        let node = slot.node;
        let required = slot.required.clone();
        if matches!(hook, Hook::Destroy) {
            slot.destroyed = true;
        }

        let instance = handle.instance();
        let Ok(mut controller) = instance.try_borrow_mut() else {
            let err = crate::error::CompileError::hook(format!(
                "Controller '{}' re-entered its {} hook.",
                handle.name(),
                hook.label()
            ));
            self.report(&err);
            return;
        };
        tracing::trace!(controller = handle.name(), hook = hook.label(), "lifecycle hook");
        let mut ctx = HookContext {
            rt: self,
            scope,
            node,
            directive: handle.name().to_string(),
            bindings: handle.bindings(),
            required,
        };
        let result = match &hook {
            Hook::Init => controller.on_init(&mut ctx),
            Hook::Changes(changes) => controller.on_changes(&mut ctx, changes),
            Hook::Check => controller.do_check(&mut ctx),
            Hook::PostLink => controller.post_link(&mut ctx),
            Hook::Destroy => controller.on_destroy(&mut ctx),
        };
        drop(controller);
        if let Err(err) = result {
            let context = self.dom.start_tag(node);
            self.report(&err.with_context(context));
        }
    }
}
