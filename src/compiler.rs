//! Compilation: walking a node list, applying matched directives and
//! producing the link functions that later bind the result to scopes.
//!
//! Compilation is top-down. Each node's directives run in priority order;
//! templates, transclusion and terminal directives may reshape the tree as
//! they go. URL templates suspend the affected node until the host task
//! queue resolves the fetch.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;

use crate::attributes::AttrSnapshot;
use crate::dom::{NodeId, NodeKind};
use crate::error::{
    CompileError, Result, ERR_MULTI_DIRECTIVE, ERR_MULTI_LINK, ERR_REQUIRED_SLOT,
    ERR_TEMPLATE_LOAD,
};
use crate::interpolate::Interpolation;
use crate::linker;
use crate::matcher::{collect_directives, directive_normalize, group_scan, MatchOptions, Matched};
use crate::registry::{
    DirectiveDefinition, LinkFn, LinkFns, RequireSpec, ScopeRequest, TemplateSpec, Transclusion,
};
use crate::runtime::Runtime;
use crate::scope::ScopeId;
use crate::template::{merge_template_attributes, single_root};
use crate::transclude::{TranscludeFn, TranscludePlan};

/// What a directive's compile callback can reach.
pub struct CompileContext<'a> {
    pub rt: &'a mut Runtime,
    pub node: NodeId,
    pub attrs: &'a mut AttrSnapshot,
    pub directive: Rc<DirectiveDefinition>,
}

impl CompileContext<'_> {
    /// Sets (or with `None`, removes) an attribute on the node being compiled.
    pub fn set_attr(&mut self, key: &str, value: Option<&str>) {
        self.attrs.set(&mut self.rt.dom, self.node, key, value, None);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINK FUNCTION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
pub struct LinkOptions {
    /// Transclusion inherited from an enclosing transcluded clone.
    pub parent_bound_transclude: Option<TranscludeFn>,
}

/// Receives the cloned nodes (and their scope) before they are linked.
pub type CloneAttach<'a> = &'a mut dyn FnMut(&mut Runtime, &[NodeId], ScopeId);

struct LinkInner {
    /// Compiled top-level nodes. Shared with pending URL templates, which
    /// swap in their replacement root when they resolve.
    nodes: Rc<RefCell<Vec<NodeId>>>,
    composite: Option<Rc<CompositeLink>>,
    linked: Cell<bool>,
}

/// Result of compiling a node list.
#[derive(Clone)]
pub struct LinkFunction {
    inner: Rc<LinkInner>,
}

impl LinkFunction {
    /// Current top-level nodes of the compiled tree.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.nodes.borrow().clone()
    }

    /// Links the compiled nodes themselves against `scope`.
    pub fn link(&self, rt: &mut Runtime, scope: ScopeId) -> Result<Vec<NodeId>> {
        self.link_with(rt, scope, None, LinkOptions::default())
    }

    /// Links against `scope`. With `clone_attach`, a fresh copy of the
    /// compiled nodes is linked instead and handed to the callback first;
    /// the compiled nodes can then be instantiated any number of times.
    pub fn link_with(
        &self,
        rt: &mut Runtime,
        scope: ScopeId,
        clone_attach: Option<CloneAttach<'_>>,
        options: LinkOptions,
    ) -> Result<Vec<NodeId>> {
        let nodes = match clone_attach {
            Some(attach) => {
                let clones: Vec<NodeId> = self
                    .nodes()
                    .into_iter()
                    .map(|n| rt.dom.clone_subtree(n))
                    .collect();
                attach(rt, &clones, scope);
                clones
            }
            None => {
                let nodes = self.nodes();
                if self.inner.linked.get() || nodes.iter().any(|n| rt.linked.contains(n)) {
                    let context = nodes
                        .first()
                        .map(|n| rt.dom.start_tag(*n))
                        .unwrap_or_default();
                    return Err(CompileError::new(
                        ERR_MULTI_LINK,
                        "This element has already been linked.",
                    )
                    .with_context(context));
                }
                self.inner.linked.set(true);
                rt.linked.extend(nodes.iter().copied());
                nodes
            }
        };

        for node in &nodes {
            if rt.dom.is_element(*node) {
                rt.node_scopes.insert(*node, scope);
                if rt.config.debug_info {
                    rt.dom.add_class(*node, "scope-node");
                }
            }
        }
        if let Some(composite) = &self.inner.composite {
            linker::link_composite(rt, composite, &nodes, scope, options.parent_bound_transclude)?;
        }
        Ok(nodes)
    }

    /// Serializable outline of what linking will run.
    pub fn plan(&self) -> LinkPlan {
        LinkPlan {
            nodes: self
                .inner
                .composite
                .as_deref()
                .map(plan_entries)
                .unwrap_or_default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILED STRUCTURE
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct CompositeLink {
    pub(crate) entries: Vec<LinkEntry>,
}

pub(crate) struct LinkEntry {
    /// Position in the node list at compile time.
    pub(crate) index: usize,
    pub(crate) node: Option<Rc<NodeLinkFn>>,
    pub(crate) children: Option<Rc<CompositeLink>>,
}

#[derive(Clone)]
pub(crate) struct LinkStep {
    pub(crate) func: LinkFn,
    pub(crate) directive: Rc<DirectiveDefinition>,
    pub(crate) isolate_scope: bool,
    pub(crate) range: Option<(String, String)>,
    pub(crate) require: Option<RequireSpec>,
}

/// Everything linking needs to know about one compiled node.
#[derive(Default)]
pub(crate) struct NodeLinkFn {
    pub(crate) applied: Vec<String>,
    pub(crate) pre: Vec<LinkStep>,
    pub(crate) post: Vec<LinkStep>,
    pub(crate) new_scope: bool,
    pub(crate) isolate: Option<Rc<DirectiveDefinition>>,
    pub(crate) controllers: Vec<Matched>,
    pub(crate) terminal: bool,
    pub(crate) transclude: Option<Rc<TranscludePlan>>,
    pub(crate) transclude_on_this_element: bool,
    pub(crate) template_on_this_element: bool,
    pub(crate) attrs: AttrSnapshot,
    pub(crate) attr_interpolations: Vec<(String, Interpolation)>,
    pub(crate) text: Option<Interpolation>,
    pub(crate) deferred: Option<Rc<RefCell<DeferredTemplate>>>,
}

/// Directive bookkeeping carried across a URL template suspension.
#[derive(Clone, Default)]
pub(crate) struct CompileState {
    pre: Vec<LinkStep>,
    post: Vec<LinkStep>,
    controllers: Vec<Matched>,
    new_scope_directive: Option<Rc<DirectiveDefinition>>,
    isolate_directive: Option<Rc<DirectiveDefinition>>,
    template_directive: Option<Rc<DirectiveDefinition>>,
    transclude_directive: Option<Rc<DirectiveDefinition>>,
    replace_directive: Option<Rc<DirectiveDefinition>>,
    pub(crate) has_element_transclude: bool,
}

/// Inputs captured when a node suspends on a URL template.
struct PendingTemplate {
    url: String,
    directives: Vec<Matched>,
    attrs: AttrSnapshot,
    transclude: Option<Rc<TranscludePlan>>,
    state: CompileState,
}

pub(crate) struct ResolvedTemplate {
    pub(crate) link: Rc<NodeLinkFn>,
    pub(crate) children: Option<Rc<CompositeLink>>,
    pub(crate) node: NodeId,
}

/// A node whose URL template has not loaded yet, plus the links requested
/// against it in the meantime.
pub(crate) struct DeferredTemplate {
    pub(crate) origin: Rc<DirectiveDefinition>,
    /// The node as compiled before the template arrived.
    pub(crate) compile_node: NodeId,
    pub(crate) has_element_transclude: bool,
    root: Rc<RefCell<Vec<NodeId>>>,
    pending: Option<PendingTemplate>,
    pub(crate) queue: Vec<(ScopeId, NodeId, Option<TranscludeFn>)>,
    pub(crate) resolved: Option<ResolvedTemplate>,
    pub(crate) failed: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE LIST COMPILATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles a detached or attached node list into a link function.
pub(crate) fn compile_root(
    rt: &mut Runtime,
    nodes: Vec<NodeId>,
    max_priority: Option<i32>,
    ignore: Option<&str>,
) -> Result<LinkFunction> {
    tracing::debug!(roots = nodes.len(), "compiling");
    let root = Rc::new(RefCell::new(nodes.clone()));
    let mut list = nodes;
    let composite = compile_nodes(rt, &mut list, max_priority, ignore, &root)?;
    *root.borrow_mut() = list;
    Ok(LinkFunction {
        inner: Rc::new(LinkInner {
            nodes: root,
            composite,
            linked: Cell::new(false),
        }),
    })
}

fn compile_nodes(
    rt: &mut Runtime,
    nodes: &mut Vec<NodeId>,
    max_priority: Option<i32>,
    ignore: Option<&str>,
    root: &Rc<RefCell<Vec<NodeId>>>,
) -> Result<Option<Rc<CompositeLink>>> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i < nodes.len() {
        let node = nodes[i];
        let options = MatchOptions {
            max_priority: if i == 0 { max_priority } else { None },
            ignore,
        };
        let mut attrs = AttrSnapshot::default();
        let directives =
            collect_directives(&rt.registry, &rt.dom, &rt.config, node, &mut attrs, &options);

        let (node_link, current) = match rt.dom.kind(node) {
            NodeKind::Text => {
                let text = rt.dom.text(node).and_then(Interpolation::parse);
                let link = text.map(|text| NodeLinkFn {
                    text: Some(text),
                    ..NodeLinkFn::default()
                });
                (link, node)
            }
            _ if !directives.is_empty() || !attrs.interpolations().is_empty() => {
                let (link, current) = apply_directives(
                    rt,
                    directives,
                    node,
                    attrs,
                    None,
                    nodes,
                    CompileState::default(),
                    root,
                )?;
                (Some(link), current)
            }
            _ => (None, node),
        };

        let descend = node_link.as_ref().map_or(true, |l| !l.terminal && l.deferred.is_none());
        let children = if descend && !rt.dom.children(current).is_empty() {
            let mut kids = rt.dom.children(current).to_vec();
            compile_nodes(rt, &mut kids, None, None, root)?
        } else {
            None
        };

        if node_link.is_some() || children.is_some() {
            entries.push(LinkEntry {
                index: i,
                node: node_link.map(Rc::new),
                children,
            });
        }
        i += 1;
    }
    Ok(if entries.is_empty() {
        None
    } else {
        Some(Rc::new(CompositeLink { entries }))
    })
}

/// Puts `new` in place of `olds` both in the tree and in `collection`.
fn replace_with(rt: &mut Runtime, collection: &mut Vec<NodeId>, olds: &[NodeId], new: NodeId) {
    let Some(&first) = olds.first() else { return };
    if let Some(pos) = collection.iter().position(|n| *n == first) {
        collection[pos] = new;
        collection.retain(|n| !olds[1..].contains(n));
    }
    rt.dom.replace(first, new);
    for extra in &olds[1..] {
        rt.dom.detach(*extra);
    }
}

fn swap_in_root(root: &Rc<RefCell<Vec<NodeId>>>, old: NodeId, new: NodeId) {
    for node in root.borrow_mut().iter_mut() {
        if *node == old {
            *node = new;
        }
    }
}

fn assert_no_duplicate(
    rt: &Runtime,
    what: &str,
    previous: Option<&Rc<DirectiveDefinition>>,
    directive: &DirectiveDefinition,
    node: NodeId,
) -> Result<()> {
    let Some(previous) = previous else {
        return Ok(());
    };
    let tag = rt.dom.start_tag(node);
    Err(CompileError::new(
        ERR_MULTI_DIRECTIVE,
        &format!(
            "Multiple directives [{}, {}] asking for {} on: {}",
            previous.display_name(),
            directive.display_name(),
            what,
            tag
        ),
    )
    .with_context(tag))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIRECTIVE APPLICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs `directives` (sorted) against `node`. Returns the node's link data
/// and the node that now stands in its place.
#[allow(clippy::too_many_arguments)]
fn apply_directives(
    rt: &mut Runtime,
    mut directives: Vec<Matched>,
    node: NodeId,
    mut attrs: AttrSnapshot,
    transclude: Option<Rc<TranscludePlan>>,
    collection: &mut Vec<NodeId>,
    mut st: CompileState,
    root: &Rc<RefCell<Vec<NodeId>>>,
) -> Result<(NodeLinkFn, NodeId)> {
    let mut compile_node = node;
    let mut terminal_priority = i32::MIN;
    let mut terminal = false;
    let mut has_transclude = false;
    let mut has_template = false;
    let mut child_transclude = transclude;
    let mut applied = Vec::new();
    let mut deferred = None;

    let mut i = 0;
    while i < directives.len() {
        let matched = directives[i].clone();
        let def = matched.def.clone();
        if terminal_priority > def.priority {
            break;
        }
        applied.push(def.name.clone());
        let is_url = def.template.as_ref().is_some_and(TemplateSpec::is_url);
        if matched.range.is_some() {
            group_scan(&rt.dom, compile_node, matched.range.as_ref())?;
        }

        if def.scope != ScopeRequest::None {
            if !is_url {
                let existing = st.isolate_directive.as_ref().or(st.new_scope_directive.as_ref());
                assert_no_duplicate(rt, "new/isolated scope", existing, &def, compile_node)?;
                if def.scope == ScopeRequest::Isolate {
                    st.isolate_directive = Some(def.clone());
                }
            }
            if st.new_scope_directive.is_none() {
                st.new_scope_directive = Some(def.clone());
            }
        }

        if !is_url && def.controller.is_some() {
            st.controllers.push(matched.clone());
        }

        if def.transclude != Transclusion::None {
            has_transclude = true;
            assert_no_duplicate(rt, "transclusion", st.transclude_directive.as_ref(), &def, compile_node)?;
            st.transclude_directive = Some(def.clone());
            match &def.transclude {
                Transclusion::Element => {
                    st.has_element_transclude = true;
                    terminal_priority = def.priority;
                    let group = group_scan(&rt.dom, compile_node, matched.range.as_ref())?;
                    let text = if rt.config.debug_info {
                        format!(" {}: {} ", def.name, attrs.get(&def.name).unwrap_or_default())
                    } else {
                        String::new()
                    };
                    let comment = rt.dom.create_comment(&text);
                    replace_with(rt, collection, &group, comment);
                    compile_node = comment;
                    let ignore = st.replace_directive.as_ref().map(|d| d.name.clone());
                    let link = compile_root(rt, group, Some(terminal_priority), ignore.as_deref())?;
                    child_transclude = Some(Rc::new(TranscludePlan::new(link)));
                }
                Transclusion::Content => {
                    let contents = rt.dom.empty(compile_node);
                    let link = compile_root(rt, contents, None, None)?;
                    child_transclude = Some(Rc::new(TranscludePlan::new(link)));
                }
                Transclusion::Slots(slots) => {
                    child_transclude = Some(Rc::new(compile_slots(rt, compile_node, slots)?));
                }
                Transclusion::None => {}
            }
        }

        if let Some(template) = def.template.clone() {
            has_template = true;
            assert_no_duplicate(rt, "template", st.template_directive.as_ref(), &def, compile_node)?;
            st.template_directive = Some(def.clone());
            if def.replace {
                st.replace_directive = Some(def.clone());
            }
            match template {
                TemplateSpec::Inline(_) | TemplateSpec::Dynamic(_) => {
                    let html = match &template {
                        TemplateSpec::Dynamic(f) => f(&rt.dom, compile_node, &attrs),
                        TemplateSpec::Inline(html) => html.clone(),
                        _ => String::new(),
                    };
                    if def.replace {
                        let nodes = rt.template_nodes(html.trim())?;
                        let new_root = single_root(&rt.dom, &nodes, &def.name, None)
                            .map_err(|e| e.with_context(rt.dom.start_tag(compile_node)))?;
                        replace_with(rt, collection, &[compile_node], new_root);

                        let mut template_attrs = AttrSnapshot::default();
                        let mut template_directives = collect_directives(
                            &rt.registry,
                            &rt.dom,
                            &rt.config,
                            new_root,
                            &mut template_attrs,
                            &MatchOptions::ALL,
                        );
                        if st.isolate_directive.is_some() {
                            for t in &mut template_directives {
                                t.isolate_scope = true;
                            }
                        }
                        let rest = directives.split_off(i + 1);
                        directives.extend(template_directives);
                        directives.extend(rest);
                        merge_template_attributes(&mut rt.dom, new_root, &mut attrs, &template_attrs);
                        compile_node = new_root;
                    } else {
                        rt.dom.empty(compile_node);
                        for child in rt.template_nodes(&html)? {
                            rt.dom.append_child(compile_node, child);
                        }
                    }
                }
                TemplateSpec::Url(_) | TemplateSpec::DynamicUrl(_) => {
                    let rest = directives.split_off(i);
                    let state = CompileState {
                        new_scope_directive: st
                            .new_scope_directive
                            .clone()
                            .filter(|d| !Rc::ptr_eq(d, &def)),
                        ..st.clone()
                    };
                    let pending_transclude = if has_transclude {
                        child_transclude.clone()
                    } else {
                        None
                    };
                    deferred = Some(defer_template(
                        rt,
                        rest,
                        compile_node,
                        attrs.clone(),
                        pending_transclude,
                        state,
                        root,
                    )?);
                    st.pre.clear();
                    st.post.clear();
                    st.controllers.clear();
                }
            }
        }

        if !is_url {
            let fns = match &def.compile {
                Some(compile) => {
                    let mut ctx = CompileContext {
                        rt: &mut *rt,
                        node: compile_node,
                        attrs: &mut attrs,
                        directive: def.clone(),
                    };
                    match compile(&mut ctx) {
                        Ok(Some(fns)) => fns,
                        Ok(None) => def.link.clone(),
                        Err(err) => {
                            rt.report(&err.with_context(rt.dom.start_tag(compile_node)));
                            LinkFns::default()
                        }
                    }
                }
                None => def.link.clone(),
            };
            add_link_fns(&mut st, &matched, fns);
        }

        if def.terminal {
            terminal = true;
            terminal_priority = terminal_priority.max(def.priority);
        }
        if deferred.is_some() {
            break;
        }
        i += 1;
    }

    tracing::trace!(node = ?compile_node, directives = ?applied, "applied directives");
    let attr_interpolations = if rt.dom.is_element(compile_node) {
        attrs.interpolations()
    } else {
        Vec::new()
    };
    let link = NodeLinkFn {
        applied,
        pre: st.pre,
        post: st.post,
        new_scope: st
            .new_scope_directive
            .as_ref()
            .is_some_and(|d| d.scope == ScopeRequest::Child),
        // A suspended node only creates its isolate scope once resolved.
        isolate: st.isolate_directive.filter(|_| deferred.is_none()),
        controllers: st.controllers,
        terminal,
        transclude: child_transclude,
        transclude_on_this_element: has_transclude,
        template_on_this_element: has_template,
        attrs,
        attr_interpolations,
        text: None,
        deferred,
    };
    Ok((link, compile_node))
}

fn add_link_fns(st: &mut CompileState, matched: &Matched, fns: LinkFns) {
    let def = &matched.def;
    let isolate_scope = matched.isolate_scope
        || st
            .isolate_directive
            .as_ref()
            .is_some_and(|d| Rc::ptr_eq(d, def));
    let step = |func: LinkFn| LinkStep {
        func,
        directive: def.clone(),
        isolate_scope,
        range: matched.range.clone(),
        require: def.effective_require(),
    };
    if let Some(pre) = fns.pre {
        st.pre.push(step(pre));
    }
    if let Some(post) = fns.post {
        st.post.push(step(post));
    }
}

/// Routes children into named slots by element or attribute name.
fn compile_slots(
    rt: &mut Runtime,
    node: NodeId,
    slots: &[crate::registry::SlotSpec],
) -> Result<TranscludePlan> {
    let children = rt.dom.empty(node);
    let mut slot_nodes: Vec<Vec<NodeId>> = vec![Vec::new(); slots.len()];
    let mut default_nodes = Vec::new();

    for child in children {
        let slot = if rt.dom.is_element(child) {
            let tag = rt.dom.tag(child).map(directive_normalize).unwrap_or_default();
            let attr_names: Vec<String> = rt
                .dom
                .attrs(child)
                .iter()
                .map(|a| directive_normalize(&a.name.to_lowercase()))
                .collect();
            slots
                .iter()
                .position(|s| s.selector == tag || attr_names.contains(&s.selector))
        } else {
            None
        };
        match slot {
            Some(idx) => slot_nodes[idx].push(child),
            None => default_nodes.push(child),
        }
    }

    for (slot, nodes) in slots.iter().zip(&slot_nodes) {
        if nodes.is_empty() && !slot.optional {
            return Err(CompileError::new(
                ERR_REQUIRED_SLOT,
                &format!("Required transclusion slot `{}` was not filled.", slot.name),
            )
            .with_context(rt.dom.start_tag(node)));
        }
    }

    let mut plan = TranscludePlan::new(compile_root(rt, default_nodes, None, None)?);
    for (slot, nodes) in slots.iter().zip(slot_nodes) {
        let link = if nodes.is_empty() {
            None
        } else {
            Some(compile_root(rt, nodes, None, None)?)
        };
        plan.slots.insert(slot.name.clone(), link);
    }
    Ok(plan)
}

// ═══════════════════════════════════════════════════════════════════════════════
// URL TEMPLATES
// ═══════════════════════════════════════════════════════════════════════════════

fn defer_template(
    rt: &mut Runtime,
    directives: Vec<Matched>,
    compile_node: NodeId,
    attrs: AttrSnapshot,
    transclude: Option<Rc<TranscludePlan>>,
    state: CompileState,
    root: &Rc<RefCell<Vec<NodeId>>>,
) -> Result<Rc<RefCell<DeferredTemplate>>> {
    let origin = directives[0].def.clone();
    let url = match &origin.template {
        Some(TemplateSpec::Url(url)) => url.clone(),
        Some(TemplateSpec::DynamicUrl(f)) => f(&rt.dom, compile_node, &attrs),
        _ => String::new(),
    };
    rt.dom.empty(compile_node);
    tracing::debug!(directive = %origin.name, %url, "deferring template");

    let deferred = Rc::new(RefCell::new(DeferredTemplate {
        origin,
        compile_node,
        has_element_transclude: state.has_element_transclude,
        root: root.clone(),
        pending: Some(PendingTemplate {
            url,
            directives,
            attrs,
            transclude,
            state,
        }),
        queue: Vec::new(),
        resolved: None,
        failed: false,
    }));
    let task_state = deferred.clone();
    rt.queue_task(Box::new(move |rt: &mut Runtime| {
        let result = resolve_template(rt, &task_state);
        if result.is_err() {
            let mut state = task_state.borrow_mut();
            state.failed = true;
            for (_, node, _) in state.queue.drain(..) {
                rt.awaiting_template.remove(&node);
            }
        }
        result
    }));
    Ok(deferred)
}

/// Fetches and compiles a suspended template, then replays the links that
/// were requested while it was loading.
fn resolve_template(rt: &mut Runtime, deferred: &Rc<RefCell<DeferredTemplate>>) -> Result<()> {
    let (origin, before, root, pending) = {
        let mut state = deferred.borrow_mut();
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        (state.origin.clone(), state.compile_node, state.root.clone(), pending)
    };
    let PendingTemplate {
        url,
        mut directives,
        mut attrs,
        transclude,
        state,
    } = pending;

    let content = rt.templates.fetch(&url).map_err(|reason| {
        CompileError::new(
            ERR_TEMPLATE_LOAD,
            &format!("Failed to load template: {} (reason: {})", url, reason),
        )
        .with_context(rt.dom.start_tag(before))
    })?;

    let first = directives.remove(0);
    let derived = Matched {
        def: origin.derive_sync(),
        range: first.range,
        isolate_scope: first.isolate_scope,
    };

    let mut collection = vec![before];
    let mut compile_node = before;
    if origin.replace {
        let nodes = rt.template_nodes(content.trim())?;
        let new_root = single_root(&rt.dom, &nodes, &origin.name, Some(&url))
            .map_err(|e| e.with_context(rt.dom.start_tag(before)))?;
        replace_with(rt, &mut collection, &[before], new_root);
        swap_in_root(&root, before, new_root);

        let mut template_attrs = AttrSnapshot::default();
        let mut template_directives = collect_directives(
            &rt.registry,
            &rt.dom,
            &rt.config,
            new_root,
            &mut template_attrs,
            &MatchOptions::ALL,
        );
        if origin.scope == ScopeRequest::Isolate {
            for t in &mut template_directives {
                t.isolate_scope = true;
            }
        }
        template_directives.extend(directives);
        directives = template_directives;
        merge_template_attributes(&mut rt.dom, new_root, &mut attrs, &template_attrs);
        compile_node = new_root;
    } else {
        for child in rt.template_nodes(&content)? {
            rt.dom.append_child(compile_node, child);
        }
    }
    directives.insert(0, derived);

    let (link, node) = apply_directives(
        rt,
        directives,
        compile_node,
        attrs,
        transclude,
        &mut collection,
        state,
        &root,
    )?;
    if node != compile_node {
        swap_in_root(&root, compile_node, node);
    }
    let children = if link.terminal || rt.dom.children(node).is_empty() {
        None
    } else {
        let mut kids = rt.dom.children(node).to_vec();
        compile_nodes(rt, &mut kids, None, None, &root)?
    };

    let queue = {
        let mut state = deferred.borrow_mut();
        state.resolved = Some(ResolvedTemplate {
            link: Rc::new(link),
            children,
            node,
        });
        std::mem::take(&mut state.queue)
    };
    tracing::debug!(directive = %origin.name, %url, queued = queue.len(), "template resolved");
    for (scope, link_node, bound) in queue {
        linker::replay_deferred(rt, deferred, scope, link_node, bound)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINK PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// Outline of the link steps for one compiled node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    pub index: usize,
    pub directives: Vec<String>,
    pub pre_link: Vec<String>,
    /// In execution order.
    pub post_link: Vec<String>,
    pub new_scope: bool,
    pub isolate_scope: Option<String>,
    pub terminal: bool,
    pub transclude: bool,
    pub template: bool,
    pub deferred: bool,
    pub interpolated: bool,
    pub children: Vec<NodePlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkPlan {
    pub nodes: Vec<NodePlan>,
}

fn plan_entries(composite: &CompositeLink) -> Vec<NodePlan> {
    composite
        .entries
        .iter()
        .map(|entry| {
            let mut plan = NodePlan {
                index: entry.index,
                children: entry.children.as_deref().map(plan_entries).unwrap_or_default(),
                ..NodePlan::default()
            };
            if let Some(link) = &entry.node {
                plan.directives = link.applied.clone();
                plan.pre_link = link.pre.iter().map(|s| s.directive.name.clone()).collect();
                plan.post_link = link
                    .post
                    .iter()
                    .rev()
                    .map(|s| s.directive.name.clone())
                    .collect();
                plan.new_scope = link.new_scope;
                plan.isolate_scope = link.isolate.as_ref().map(|d| d.name.clone());
                plan.terminal = link.terminal;
                plan.transclude = link.transclude_on_this_element;
                plan.template = link.template_on_this_element;
                plan.deferred = link.deferred.is_some();
                plan.interpolated = link.text.is_some() || !link.attr_interpolations.is_empty();
            }
            plan
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DirectiveRegistry, DirectiveSpec};

    #[test]
    fn test_plan_orders_links() {
        let mut registry = DirectiveRegistry::new();
        registry
            .register("outer", DirectiveSpec::new().priority(2).link(|_| Ok(())))
            .unwrap();
        registry
            .register("inner", DirectiveSpec::new().pre_link(|_| Ok(())).link(|_| Ok(())))
            .unwrap();
        let mut rt = Runtime::new(registry);
        let link = rt
            .compile_html(r#"<div outer inner><p>{{x}}</p></div>"#)
            .unwrap();
        let plan = link.plan();
        let node = &plan.nodes[0];
        assert_eq!(node.directives, vec!["outer", "inner"]);
        assert_eq!(node.pre_link, vec!["inner"]);
        assert_eq!(node.post_link, vec!["inner", "outer"]);
        assert!(node.children[0].children[0].interpolated);

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["nodes"][0]["postLink"][1], "outer");
    }

    #[test]
    fn test_duplicate_template_is_rejected() {
        let mut registry = DirectiveRegistry::new();
        registry.register("one", DirectiveSpec::new().template("<i></i>")).unwrap();
        registry.register("two", DirectiveSpec::new().template("<b></b>")).unwrap();
        let mut rt = Runtime::new(registry);
        let err = rt.compile_html("<div one two></div>").err().unwrap();
        assert_eq!(err.code, ERR_MULTI_DIRECTIVE);
        assert!(err.message.contains("asking for template on: <div one two>"));
    }
}
