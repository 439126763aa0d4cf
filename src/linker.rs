//! Linking: binding compiled nodes to scopes.
//!
//! Per node, linking creates scopes, instantiates controllers, wires
//! bindings and runs the directives' link functions: pre-links in priority
//! order, then the children, then post-links in reverse. Errors from link
//! functions abort the link; errors from controller hooks, observers and
//! watch listeners are reported and linking continues.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::attributes::Attributes;
use crate::bindings::{initialize_bindings, BindingInfo, BindingTarget};
use crate::compiler::{CompositeLink, DeferredTemplate, LinkStep, NodeLinkFn};
use crate::controller::{
    BasicController, Changes, ControllerHandle, ControllerId, Hook, HookContext, Required,
};
use crate::dom::NodeId;
use crate::error::{CompileError, Result, ERR_CONTROLLER_REQUIRED};
use crate::interpolate::Interpolation;
use crate::matcher::group_scan;
use crate::registry::{
    new_binding_bag, DirectiveDefinition, RequireEntry, RequireShape, RequireSpec, Search,
};
use crate::runtime::Runtime;
use crate::scope::{ScopeId, WatchFn, WatchListener, WatchSource};
use crate::transclude::TranscludeFn;
use crate::value::Value;

/// What a link function can reach.
pub struct LinkContext<'a> {
    pub rt: &'a mut Runtime,
    pub scope: ScopeId,
    pub node: NodeId,
    /// Every node a multi-element directive spans; just `node` otherwise.
    pub group: Vec<NodeId>,
    pub attrs: Attributes,
    pub directive: Rc<DirectiveDefinition>,
    /// The directive's own controller, if it has one.
    pub controller: Option<ControllerHandle>,
    pub required: Rc<Required>,
    pub transclude: Option<TranscludeFn>,
}

impl LinkContext<'_> {
    pub fn eval(&mut self, expression: &str) -> Result<Value> {
        self.rt.eval(self.scope, expression)
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.attrs.get(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPOSITE LINKING
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn link_composite(
    rt: &mut Runtime,
    composite: &CompositeLink,
    nodes: &[NodeId],
    scope: ScopeId,
    parent_bound: Option<TranscludeFn>,
) -> Result<()> {
    // Link functions may move nodes around; index into the list as it was.
    let stable = nodes.to_vec();
    for entry in &composite.entries {
        let Some(&node) = stable.get(entry.index) else {
            continue;
        };
        match &entry.node {
            Some(link) => {
                let child_scope = if link.new_scope {
                    let child = rt.scopes.new_child(scope, false);
                    rt.own_scope(node, child);
                    rt.node_scopes.insert(node, child);
                    if rt.config.debug_info {
                        rt.dom.add_class(node, "scope-node");
                    }
                    child
                } else {
                    scope
                };
                let bound = if link.transclude_on_this_element {
                    link.transclude
                        .clone()
                        .map(|plan| TranscludeFn::bind(scope, plan, parent_bound.clone()))
                } else if !link.template_on_this_element {
                    parent_bound.clone()
                } else {
                    None
                };
                node_link(rt, link, entry.children.as_deref(), node, child_scope, bound)?;
            }
            None => {
                if let Some(children) = &entry.children {
                    let kids = rt.dom.children(node).to_vec();
                    link_composite(rt, children, &kids, scope, parent_bound.clone())?;
                }
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE LINKING
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn node_link(
    rt: &mut Runtime,
    link: &NodeLinkFn,
    children: Option<&CompositeLink>,
    node: NodeId,
    scope: ScopeId,
    bound: Option<TranscludeFn>,
) -> Result<()> {
    if let Some(deferred) = &link.deferred {
        return link_deferred(rt, deferred, scope, node, bound);
    }
    if let Some(text) = &link.text {
        link_text(rt, text.clone(), node, scope);
        return Ok(());
    }

    let attrs = Attributes::from_snapshot(node, &link.attrs);

    let isolate_scope = link.isolate.as_ref().map(|_| {
        let isolate = rt.scopes.new_child(scope, true);
        rt.own_scope(node, isolate);
        rt.isolate_scopes.insert(node, isolate);
        if rt.config.debug_info {
            rt.dom.add_class(node, "isolate-scope-node");
        }
        isolate
    });
    let controller_scope = if link.isolate.is_none() && link.new_scope {
        rt.scopes.parent(scope).unwrap_or(scope)
    } else {
        scope
    };
    let scope_to_child = match (&link.isolate, isolate_scope) {
        (Some(def), Some(isolate)) if def.template.is_some() || def.original.is_some() => isolate,
        _ => scope,
    };
    let transclude = bound.as_ref().map(|b| b.with_containing(scope_to_child));

    if let (Some(def), Some(isolate)) = (&link.isolate, isolate_scope) {
        if !def.scope_bindings.is_empty() {
            let info = initialize_bindings(
                rt,
                scope,
                &attrs,
                BindingTarget::Scope(isolate),
                &def.scope_bindings,
                def,
            )?;
            let cleanup_attrs = attrs.clone();
            rt.scopes.on_destroy(
                isolate,
                Box::new(move |rt: &mut Runtime| info.remove(rt, &cleanup_attrs)),
            );
        }
    }

    let controllers = setup_controllers(rt, link, node, scope, isolate_scope, controller_scope, &attrs)?;
    run_controller_hooks(rt, &controllers, controller_scope);

    link_attr_interpolations(rt, link, &attrs, scope);

    for step in &link.pre {
        let step_scope = if step.isolate_scope {
            isolate_scope.unwrap_or(scope)
        } else {
            scope
        };
        invoke_step(rt, step, node, step_scope, &attrs, transclude.clone())?;
    }

    if let Some(children) = children {
        let kids = rt.dom.children(node).to_vec();
        link_composite(rt, children, &kids, scope_to_child, bound.clone())?;
    }

    for step in link.post.iter().rev() {
        let step_scope = if step.isolate_scope {
            isolate_scope.unwrap_or(scope)
        } else {
            scope
        };
        invoke_step(rt, step, node, step_scope, &attrs, transclude.clone())?;
    }

    for (id, _) in &controllers {
        rt.call_hook(*id, Hook::PostLink);
    }
    Ok(())
}

fn link_text(rt: &mut Runtime, text: Interpolation, node: NodeId, scope: ScopeId) {
    if rt.config.debug_info {
        if let Some(parent) = rt.dom.parent(node) {
            rt.dom.add_class(parent, "binding-node");
        }
    }
    let listener: WatchListener = Rc::new(move |rt: &mut Runtime, value: &Value, _: Option<&Value>| {
        rt.dom.set_text(node, &value.to_display_string());
        Ok(())
    });
    rt.scopes
        .watch(scope, WatchSource::Native(render_watch(text)), Some(listener));
}

fn render_watch(interpolation: Interpolation) -> WatchFn {
    Rc::new(move |rt: &mut Runtime, scope: ScopeId| -> Result<Value> {
        Ok(Value::String(interpolation.render(rt, scope)?))
    })
}

fn link_attr_interpolations(rt: &mut Runtime, link: &NodeLinkFn, attrs: &Attributes, scope: ScopeId) {
    for (key, interpolation) in &link.attr_interpolations {
        let initial = match interpolation.render(rt, scope) {
            Ok(value) => value,
            Err(err) => {
                rt.report(&err.with_context(rt.dom.start_tag(attrs.node())));
                continue;
            }
        };
        attrs.set_quiet(key, Some(initial));
        attrs.mark_interpolated(key);
        let target = attrs.clone();
        let key = key.clone();
        let listener: WatchListener = Rc::new(move |rt: &mut Runtime, value: &Value, _: Option<&Value>| {
            target.set(rt, &key, Some(&value.to_display_string()), true, None);
            Ok(())
        });
        rt.scopes
            .watch(scope, WatchSource::Native(render_watch(interpolation.clone())), Some(listener));
    }
}

fn invoke_step(
    rt: &mut Runtime,
    step: &LinkStep,
    node: NodeId,
    scope: ScopeId,
    attrs: &Attributes,
    transclude: Option<TranscludeFn>,
) -> Result<()> {
    let required = match &step.require {
        Some(spec) => Rc::new(get_controllers(rt, &step.directive.name, spec, node)?),
        None => Rc::new(Required::None),
    };
    let group = group_scan(&rt.dom, node, step.range.as_ref())?;
    let controller = rt.controller(node, &step.directive.name);
    let mut ctx = LinkContext {
        rt: &mut *rt,
        scope,
        node,
        group,
        attrs: attrs.clone(),
        directive: step.directive.clone(),
        controller,
        required,
        transclude,
    };
    let result = (step.func)(&mut ctx);
    drop(ctx);
    result.map_err(|err| {
        if err.context.is_some() {
            err
        } else {
            err.with_context(rt.dom.start_tag(node))
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLERS
// ═══════════════════════════════════════════════════════════════════════════════

fn setup_controllers(
    rt: &mut Runtime,
    link: &NodeLinkFn,
    node: NodeId,
    scope: ScopeId,
    isolate_scope: Option<ScopeId>,
    controller_scope: ScopeId,
    attrs: &Attributes,
) -> Result<Vec<(ControllerId, Changes)>> {
    let mut created: Vec<(Rc<DirectiveDefinition>, ControllerId, BindingInfo)> = Vec::new();
    for matched in &link.controllers {
        let def = &matched.def;
        let Some(factory) = def.controller.clone() else {
            continue;
        };
        let is_isolate = link.isolate.as_ref().is_some_and(|d| Rc::ptr_eq(d, def));
        let own_scope = if is_isolate || matched.isolate_scope {
            isolate_scope.unwrap_or(scope)
        } else {
            scope
        };

        let bag = new_binding_bag();
        let basic = ControllerHandle::new(&def.name, BasicController, bag.clone());
        let id = rt.register_controller(basic.clone(), own_scope, node);
        let pre_assign = rt.config.pre_assign_bindings && !def.controller_bindings.is_empty();
        let mut info = if pre_assign {
            initialize_bindings(
                rt,
                controller_scope,
                attrs,
                BindingTarget::Controller {
                    id,
                    handle: basic.clone(),
                },
                &def.controller_bindings,
                def,
            )?
        } else {
            BindingInfo::default()
        };

        let mut ctx = HookContext {
            rt: &mut *rt,
            scope: own_scope,
            node,
            directive: def.name.clone(),
            bindings: bag,
            required: Rc::new(Required::None),
        };
        let produced = factory(&mut ctx);
        drop(ctx);
        let produced = produced.map_err(|e| e.with_context(rt.dom.start_tag(node)))?;
        let handle = produced.unwrap_or_else(|| basic.clone());
        if let Some(slot) = rt.controller_slot_mut(id) {
            slot.handle = handle.clone();
        }

        // A factory that handed back a foreign controller gets the bindings
        // re-applied to it.
        let rebind = !pre_assign || !handle.shares_bindings(&basic);
        if !def.controller_bindings.is_empty() && rebind {
            info.remove(rt, attrs);
            info = initialize_bindings(
                rt,
                controller_scope,
                attrs,
                BindingTarget::Controller {
                    id,
                    handle: handle.clone(),
                },
                &def.controller_bindings,
                def,
            )?;
        }

        rt.node_controllers
            .entry(node)
            .or_default()
            .insert(def.name.clone(), handle.clone());
        rt.node_controller_ids.entry(node).or_default().push(id);
        if let Some(alias) = &def.controller_as {
            rt.scopes.set(own_scope, alias, Value::Controller(handle));
        }
        created.push((def.clone(), id, info));
    }

    // Requirements resolve once every controller on the node exists.
    for (def, id, _) in &created {
        let Some(spec) = def.effective_require() else {
            continue;
        };
        let required = get_controllers(rt, &def.name, &spec, node)?;
        if def.bind_to_controller && spec.shape == RequireShape::Map {
            if let (Required::Map(map), Some(handle)) = (&required, rt.controller_handle(*id)) {
                for (key, found) in map {
                    let value = found.clone().map(Value::Controller).unwrap_or(Value::Null);
                    handle.set_binding(key, value);
                }
            }
        }
        if let Some(slot) = rt.controller_slot_mut(*id) {
            slot.required = Rc::new(required);
        }
    }

    let mut out = Vec::with_capacity(created.len());
    let mut infos = Vec::with_capacity(created.len());
    for (_, id, mut info) in created {
        out.push((id, std::mem::take(&mut info.initial_changes)));
        infos.push(info);
    }
    if !infos.is_empty() {
        let cleanup_attrs = attrs.clone();
        rt.on_node_removed(
            node,
            Box::new(move |rt: &mut Runtime| {
                for info in &infos {
                    info.remove(rt, &cleanup_attrs);
                }
            }),
        );
    }
    Ok(out)
}

/// `on_changes` with the initial values, `on_init`, a first `do_check`,
/// then registration for later checks and for destruction.
fn run_controller_hooks(rt: &mut Runtime, controllers: &[(ControllerId, Changes)], controller_scope: ScopeId) {
    for (id, initial) in controllers {
        let id = *id;
        if !initial.is_empty() {
            rt.call_hook(id, Hook::Changes(initial.clone()));
        }
        rt.call_hook(id, Hook::Init);
        if !rt.scopes.is_destroyed(controller_scope) {
            rt.scopes.scope_mut(controller_scope).check_hooks.push(id);
            rt.scopes
                .on_destroy(controller_scope, Box::new(move |rt: &mut Runtime| rt.call_hook(id, Hook::Destroy)));
        }
        rt.call_hook(id, Hook::Check);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUIRE
// ═══════════════════════════════════════════════════════════════════════════════

fn find_controller(
    rt: &Runtime,
    directive: &str,
    entry: &RequireEntry,
    node: NodeId,
) -> Result<Option<ControllerHandle>> {
    let candidates = match entry.search {
        Search::Local => vec![node],
        Search::SelfAndAncestors => rt.dom.ancestors(node),
        Search::Ancestors => rt.dom.ancestors(node).into_iter().skip(1).collect(),
    };
    let found = candidates.into_iter().find_map(|n| rt.controller(n, &entry.name));
    if found.is_none() && !entry.optional {
        return Err(CompileError::new(
            ERR_CONTROLLER_REQUIRED,
            &format!(
                "Controller '{}', required by directive '{}', can't be found!",
                entry.name, directive
            ),
        )
        .with_context(rt.dom.start_tag(node)));
    }
    Ok(found)
}

pub(crate) fn get_controllers(
    rt: &Runtime,
    directive: &str,
    spec: &RequireSpec,
    node: NodeId,
) -> Result<Required> {
    Ok(match spec.shape {
        RequireShape::Single => match spec.entries.first() {
            Some(entry) => Required::Single(find_controller(rt, directive, entry, node)?),
            None => Required::None,
        },
        RequireShape::List => Required::List(
            spec.entries
                .iter()
                .map(|e| find_controller(rt, directive, e, node))
                .collect::<Result<_>>()?,
        ),
        RequireShape::Map => {
            let mut map = BTreeMap::new();
            for entry in &spec.entries {
                map.insert(entry.key.clone(), find_controller(rt, directive, entry, node)?);
            }
            Required::Map(map)
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFERRED TEMPLATES
// ═══════════════════════════════════════════════════════════════════════════════

fn link_deferred(
    rt: &mut Runtime,
    deferred: &Rc<RefCell<DeferredTemplate>>,
    scope: ScopeId,
    node: NodeId,
    bound: Option<TranscludeFn>,
) -> Result<()> {
    if rt.scopes.is_destroyed(scope) {
        return Ok(());
    }
    let (link, children) = {
        let mut state = deferred.borrow_mut();
        if state.failed {
            return Ok(());
        }
        match &state.resolved {
            Some(resolved) => (resolved.link.clone(), resolved.children.clone()),
            None => {
                state.queue.push((scope, node, bound));
                rt.awaiting_template.insert(node);
                return Ok(());
            }
        }
    };
    link_resolved(rt, &link, children.as_deref(), node, scope, bound)
}

/// Links a request that arrived while the template was loading.
pub(crate) fn replay_deferred(
    rt: &mut Runtime,
    deferred: &Rc<RefCell<DeferredTemplate>>,
    scope: ScopeId,
    link_node: NodeId,
    bound: Option<TranscludeFn>,
) -> Result<()> {
    let awaiting = rt.awaiting_template.remove(&link_node);
    if !awaiting || rt.scopes.is_destroyed(scope) {
        return Ok(());
    }
    let (link, children, compiled, before, keep_original) = {
        let state = deferred.borrow();
        let Some(resolved) = &state.resolved else {
            return Ok(());
        };
        (
            resolved.link.clone(),
            resolved.children.clone(),
            resolved.node,
            state.compile_node,
            state.has_element_transclude && state.origin.replace,
        )
    };

    let mut node = compiled;
    if link_node != before {
        // A clone was linked; give it the compiled content.
        if !keep_original {
            node = rt.dom.clone_subtree(compiled);
        }
        for class in rt.dom.class_tokens(link_node) {
            rt.dom.add_class(node, &class);
        }
        rt.dom.replace(link_node, node);
    }
    if node != link_node {
        for scope_id in rt.scope_owners.remove(&link_node).unwrap_or_default() {
            rt.own_scope(node, scope_id);
        }
        if let Some(owner) = rt.node_scopes.remove(&link_node) {
            rt.node_scopes.insert(node, owner);
        }
        if rt.linked.remove(&link_node) {
            rt.linked.insert(node);
        }
    }
    link_resolved(rt, &link, children.as_deref(), node, scope, bound)
}

fn link_resolved(
    rt: &mut Runtime,
    link: &NodeLinkFn,
    children: Option<&CompositeLink>,
    node: NodeId,
    scope: ScopeId,
    bound: Option<TranscludeFn>,
) -> Result<()> {
    let bound = if link.transclude_on_this_element {
        link.transclude
            .clone()
            .map(|plan| TranscludeFn::bind(scope, plan, bound))
    } else {
        bound
    };
    node_link(rt, link, children, node, scope, bound)
}
