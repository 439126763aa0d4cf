//! Isolate-scope and controller bindings.
//!
//! Each binding ties a property on the isolate scope or on a controller to
//! an attribute of the host node:
//!
//! - `@` follows the attribute's (interpolated) text through an observer;
//! - `=` keeps the property and an outer expression in sync both ways;
//! - `<` copies the outer expression's value inward only;
//! - `&` exposes the outer expression as a callable handler.
//!
//! Change records for `on_changes` are produced for `@` and `<` bindings
//! on controllers.

use std::cell::RefCell;
use std::rc::Rc;

use crate::attributes::{Attributes, ObserverHandle};
use crate::controller::{Changes, ControllerHandle, ControllerId, SimpleChange};
use crate::error::{CompileError, Result, ERR_MISSING_ATTR, ERR_NON_ASSIGNABLE};
use crate::interpolate::Interpolation;
use crate::registry::{BindingMode, BindingSpec, DirectiveDefinition};
use crate::runtime::Runtime;
use crate::scope::{ScopeId, WatchFn, WatchHandle, WatchListener, WatchSource};
use crate::value::{ExpressionHandler, Value};

/// Where bound values are written.
#[derive(Clone)]
pub(crate) enum BindingTarget {
    Scope(ScopeId),
    Controller {
        id: ControllerId,
        handle: ControllerHandle,
    },
}

impl BindingTarget {
    fn get(&self, rt: &Runtime, key: &str) -> Value {
        match self {
            BindingTarget::Scope(scope) => rt.scopes.get_own(*scope, key).cloned().unwrap_or_default(),
            BindingTarget::Controller { handle, .. } => handle.binding(key),
        }
    }

    fn set(&self, rt: &mut Runtime, key: &str, value: Value) {
        match self {
            BindingTarget::Scope(scope) => rt.scopes.set(*scope, key, value),
            BindingTarget::Controller { handle, .. } => handle.set_binding(key, value),
        }
    }

    fn record(&self, rt: &mut Runtime, key: &str, current: Value, previous: Value) {
        if let BindingTarget::Controller { id, .. } = self {
            rt.record_change(*id, key, current, previous);
        }
    }

    fn records_changes(&self) -> bool {
        matches!(self, BindingTarget::Controller { .. })
    }
}

/// What `initialize_bindings` set up, so it can be torn down again.
#[derive(Default)]
pub(crate) struct BindingInfo {
    pub(crate) initial_changes: Changes,
    watches: Vec<WatchHandle>,
    observers: Vec<ObserverHandle>,
}

impl BindingInfo {
    pub(crate) fn remove(&self, rt: &mut Runtime, attrs: &Attributes) {
        for watch in &self.watches {
            if !rt.scopes.is_destroyed(watch.scope) {
                rt.scopes.unwatch(*watch);
            }
        }
        for observer in &self.observers {
            attrs.unobserve(observer);
        }
    }
}

/// Wires `specs` from the outer `scope` onto `target`.
pub(crate) fn initialize_bindings(
    rt: &mut Runtime,
    scope: ScopeId,
    attrs: &Attributes,
    target: BindingTarget,
    specs: &[BindingSpec],
    directive: &DirectiveDefinition,
) -> Result<BindingInfo> {
    let mut info = BindingInfo::default();
    for spec in specs {
        let key = spec.property.as_str();
        let raw = attrs.get(&spec.attr);
        let present = attrs.has(&spec.attr) && raw.is_some();

        if !present && !spec.optional && rt.config.strict_bindings {
            return Err(CompileError::new(
                ERR_MISSING_ATTR,
                &format!(
                    "Attribute '{}' of '{}' is non-optional and must be set!",
                    spec.attr, directive.name
                ),
            ));
        }

        match spec.mode {
            BindingMode::Text => {
                if spec.optional && !present {
                    continue;
                }
                let observer_target = target.clone();
                let prop = key.to_string();
                let handle = attrs.observe(rt, &spec.attr, move |rt, value| {
                    let Some(value) = value else { return Ok(()) };
                    let current = Value::str(value);
                    let previous = observer_target.get(rt, &prop);
                    observer_target.record(rt, &prop, current.clone(), previous);
                    observer_target.set(rt, &prop, current);
                    Ok(())
                });
                info.observers.push(handle);

                let initial = match raw {
                    Some(text) => match Interpolation::parse(&text) {
                        Some(interp) => Value::String(interp.render(rt, scope)?),
                        None => Value::String(text),
                    },
                    None => Value::Undefined,
                };
                target.set(rt, key, initial.clone());
                if target.records_changes() {
                    info.initial_changes
                        .insert(key.to_string(), SimpleChange::first(initial));
                }
            }

            BindingMode::TwoWay => {
                if spec.optional && raw.as_deref().unwrap_or_default().is_empty() {
                    continue;
                }
                let expression = raw.unwrap_or_default();
                let initial = rt.eval(scope, &expression)?;
                target.set(rt, key, initial.clone());
                let watch = two_way_watch(
                    target.clone(),
                    key.to_string(),
                    spec.attr.clone(),
                    expression,
                    directive.name.clone(),
                    initial,
                );
                info.watches
                    .push(rt.scopes.watch(scope, WatchSource::Native(watch), None));
            }

            BindingMode::OneWay => {
                if spec.optional && raw.as_deref().unwrap_or_default().is_empty() {
                    continue;
                }
                let expression = raw.unwrap_or_default();
                let initial = rt.eval(scope, &expression)?;
                target.set(rt, key, initial.clone());
                if target.records_changes() {
                    info.initial_changes
                        .insert(key.to_string(), SimpleChange::first(initial.clone()));
                }
                let listener = one_way_listener(target.clone(), key.to_string(), initial);
                info.watches.push(rt.scopes.watch(
                    scope,
                    WatchSource::Expression(expression),
                    Some(listener),
                ));
            }

            BindingMode::Expression => {
                if spec.optional && !present {
                    continue;
                }
                let handler = ExpressionHandler {
                    expression: raw.unwrap_or_default(),
                    scope,
                };
                target.set(rt, key, Value::Handler(Rc::new(handler)));
            }
        }
    }
    Ok(info)
}

/// Parent-to-child wins when the parent changed; otherwise a child change
/// is written back to the parent expression.
fn two_way_watch(
    target: BindingTarget,
    key: String,
    attr: String,
    expression: String,
    directive: String,
    initial: Value,
) -> WatchFn {
    let last = Rc::new(RefCell::new(initial));
    Rc::new(move |rt: &mut Runtime, scope: ScopeId| -> Result<Value> {
        let mut parent_value = rt.eval(scope, &expression)?;
        let current = target.get(rt, &key);
        if parent_value != current {
            let previous = last.borrow().clone();
            if parent_value != previous {
                target.set(rt, &key, parent_value.clone());
            } else {
                parent_value = current.clone();
                if let Err(err) = rt.assign(scope, &expression, current) {
                    let restored = rt.eval(scope, &expression)?;
                    *last.borrow_mut() = restored.clone();
                    target.set(rt, &key, restored);
                    if !err.is(ERR_NON_ASSIGNABLE) {
                        return Err(err);
                    }
                    return Err(CompileError::new(
                        ERR_NON_ASSIGNABLE,
                        &format!(
                            "Expression '{}' in attribute '{}' used with directive '{}' is non-assignable!",
                            expression, attr, directive
                        ),
                    ));
                }
            }
        }
        *last.borrow_mut() = parent_value.clone();
        Ok(parent_value)
    })
}

fn one_way_listener(target: BindingTarget, key: String, initial: Value) -> WatchListener {
    Rc::new(move |rt: &mut Runtime, new: &Value, old: Option<&Value>| {
        let previous = match old {
            Some(old) => old.clone(),
            // First evaluation: already delivered as the initial value.
            None if *new == initial => return Ok(()),
            None => initial.clone(),
        };
        target.record(rt, &key, new.clone(), previous);
        target.set(rt, &key, new.clone());
        Ok(())
    })
}
