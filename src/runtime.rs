//! The `Runtime` owns everything a compile/link cycle touches: the markup
//! tree, the scope arena, the registry and the pluggable collaborators.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::compiler::{self, LinkFunction};
use crate::config::CompileConfig;
use crate::controller::{Changes, ControllerHandle, ControllerId, ControllerSlot, Hook};
use crate::diagnostics::{FaultReporter, TracingReporter};
use crate::dom::{Dom, NodeId};
use crate::error::{CompileError, Result, ERR_EXPRESSION};
use crate::expr::{EvalContext, Evaluator, OxcEvaluator};
use crate::registry::DirectiveRegistry;
use crate::scope::{ScopeArena, ScopeId};
use crate::template::{ParsedTemplateCache, TemplateCache, TemplateSource};
use crate::value::{Value, ValueMap};

/// Deferred unit of work run against the runtime.
pub type Task = Box<dyn FnOnce(&mut Runtime) -> Result<()>>;

/// Work to run when a linked node is removed.
pub(crate) type Cleanup = Box<dyn FnOnce(&mut Runtime)>;

pub struct Runtime {
    pub dom: Dom,
    pub scopes: ScopeArena,
    pub(crate) registry: DirectiveRegistry,
    pub(crate) evaluator: Rc<dyn Evaluator>,
    pub(crate) templates: Rc<dyn TemplateSource>,
    pub(crate) reporter: Rc<dyn FaultReporter>,
    pub(crate) config: CompileConfig,
    pub(crate) parsed_templates: ParsedTemplateCache,
    /// "Run after the current synchronous work"; drained by the digest.
    pub(crate) async_queue: VecDeque<Task>,
    /// Host task queue (template fetches); drained by `flush_tasks`.
    pub(crate) tasks: VecDeque<Task>,
    pub(crate) controllers: HashMap<ControllerId, ControllerSlot>,
    pub(crate) next_controller: u32,
    pub(crate) node_controllers: HashMap<NodeId, BTreeMap<String, ControllerHandle>>,
    pub(crate) node_controller_ids: HashMap<NodeId, Vec<ControllerId>>,
    pub(crate) scope_owners: HashMap<NodeId, Vec<ScopeId>>,
    pub(crate) node_scopes: HashMap<NodeId, ScopeId>,
    pub(crate) isolate_scopes: HashMap<NodeId, ScopeId>,
    pub(crate) cleanups: HashMap<NodeId, Vec<Cleanup>>,
    pub(crate) pending_changes: BTreeMap<ControllerId, Changes>,
    pub(crate) linked: HashSet<NodeId>,
    /// Nodes whose link waits on a loading template.
    pub(crate) awaiting_template: HashSet<NodeId>,
}

impl Runtime {
    pub fn new(registry: DirectiveRegistry) -> Self {
        Self {
            dom: Dom::new(),
            scopes: ScopeArena::new(),
            registry,
            evaluator: Rc::new(OxcEvaluator::new()),
            templates: Rc::new(TemplateCache::new()),
            reporter: Rc::new(TracingReporter),
            config: CompileConfig::default(),
            parsed_templates: ParsedTemplateCache::default(),
            async_queue: VecDeque::new(),
            tasks: VecDeque::new(),
            controllers: HashMap::new(),
            next_controller: 0,
            node_controllers: HashMap::new(),
            node_controller_ids: HashMap::new(),
            scope_owners: HashMap::new(),
            node_scopes: HashMap::new(),
            isolate_scopes: HashMap::new(),
            cleanups: HashMap::new(),
            pending_changes: BTreeMap::new(),
            linked: HashSet::new(),
            awaiting_template: HashSet::new(),
        }
    }

    pub fn with_config(mut self, config: CompileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_templates(mut self, templates: Rc<dyn TemplateSource>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_reporter(mut self, reporter: Rc<dyn FaultReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Rc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn registry(&self) -> &DirectiveRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DirectiveRegistry {
        &mut self.registry
    }

    pub fn root_scope(&self) -> ScopeId {
        self.scopes.root()
    }

    pub fn report(&self, error: &CompileError) {
        self.reporter.report(error);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COMPILATION ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn parse(&mut self, html: &str) -> Result<Vec<NodeId>> {
        self.dom.parse_html(html)
    }

    /// Compiles `nodes` (and their subtrees) into a link function.
    pub fn compile(&mut self, nodes: &[NodeId]) -> Result<LinkFunction> {
        compiler::compile_root(self, nodes.to_vec(), None, None)
    }

    /// Parses `html` and compiles the resulting top-level nodes.
    pub fn compile_html(&mut self, html: &str) -> Result<LinkFunction> {
        let nodes = self.parse(html)?;
        self.compile(&nodes)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXPRESSIONS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn eval(&mut self, scope: ScopeId, expression: &str) -> Result<Value> {
        self.eval_with_locals(scope, expression, ValueMap::new())
    }

    pub fn eval_with_locals(
        &mut self,
        scope: ScopeId,
        expression: &str,
        locals: ValueMap,
    ) -> Result<Value> {
        let evaluator = self.evaluator.clone();
        let mut ctx = ScopeContext {
            rt: self,
            scope,
            locals,
        };
        evaluator.evaluate(expression, &mut ctx)
    }

    pub fn assign(&mut self, scope: ScopeId, expression: &str, value: Value) -> Result<()> {
        let evaluator = self.evaluator.clone();
        let mut ctx = ScopeContext {
            rt: self,
            scope,
            locals: ValueMap::new(),
        };
        evaluator.assign(expression, &mut ctx, value)
    }

    pub fn is_assignable(&self, expression: &str) -> bool {
        self.evaluator.is_assignable(expression)
    }

    /// Calls an `&` binding handler or a native function.
    pub fn invoke(&mut self, callee: &Value, locals: ValueMap) -> Result<Value> {
        match callee {
            Value::Handler(handler) => {
                self.eval_with_locals(handler.scope, &handler.expression, locals)
            }
            Value::Function(f) => Ok(f(&[Value::Object(locals)])),
            Value::Undefined => Ok(Value::Undefined),
            other => Err(CompileError::new(
                ERR_EXPRESSION,
                &format!("Value of type '{}' is not callable.", other.type_name()),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUEUES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Schedules `task` to run after the current synchronous work, inside
    /// the next digest.
    pub fn eval_async(&mut self, task: Task) {
        self.async_queue.push_back(task);
    }

    /// Queues a host task, such as a template fetch.
    pub fn queue_task(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Runs queued host tasks, each followed by a digest. Task failures are
    /// reported; digest failures abort.
    pub fn flush_tasks(&mut self) -> Result<()> {
        while let Some(task) = self.tasks.pop_front() {
            if let Err(err) = task(self) {
                self.report(&err);
            }
            self.digest()?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SCOPES AND NODES
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.new_child(parent, false)
    }

    /// Destroys `scope` and everything below it, running destroy hooks
    /// parents first.
    pub fn destroy_scope(&mut self, scope: ScopeId) {
        let torn = self.scopes.tear_down(scope);
        if !torn.is_empty() {
            tracing::trace!(?scope, count = torn.len(), "scopes destroyed");
        }
        for (_, _, hooks) in torn {
            for hook in hooks {
                hook(self);
            }
        }
    }

    /// Records that `node` owns `scope`; removing the node destroys it.
    pub(crate) fn own_scope(&mut self, node: NodeId, scope: ScopeId) {
        self.scope_owners.entry(node).or_default().push(scope);
    }

    pub(crate) fn on_node_removed(&mut self, node: NodeId, cleanup: Cleanup) {
        self.cleanups.entry(node).or_default().push(cleanup);
    }

    /// Detaches `node`, destroys the scopes its subtree owns and runs the
    /// destroy hooks of controllers living on it. Pending template links for
    /// the subtree are dropped and its per-node records forgotten.
    pub fn remove_node(&mut self, node: NodeId) {
        self.dom.detach(node);
        let nodes = self.dom.descendants(node);
        for &id in &nodes {
            self.awaiting_template.remove(&id);
        }
        for &id in &nodes {
            if let Some(scopes) = self.scope_owners.remove(&id) {
                for scope in scopes {
                    self.destroy_scope(scope);
                }
            }
            if let Some(controllers) = self.node_controller_ids.remove(&id) {
                for controller in controllers {
                    self.call_hook(controller, Hook::Destroy);
                    self.controllers.remove(&controller);
                    self.pending_changes.remove(&controller);
                }
            }
            if let Some(cleanups) = self.cleanups.remove(&id) {
                for cleanup in cleanups {
                    cleanup(self);
                }
            }
        }
        for id in nodes {
            self.node_controllers.remove(&id);
            self.node_scopes.remove(&id);
            self.isolate_scopes.remove(&id);
            self.linked.remove(&id);
        }
    }

    /// Scope a linked node evaluates against.
    pub fn scope_of(&self, node: NodeId) -> Option<ScopeId> {
        self.dom
            .ancestors(node)
            .into_iter()
            .find_map(|n| self.node_scopes.get(&n).copied())
    }

    pub fn isolate_scope_of(&self, node: NodeId) -> Option<ScopeId> {
        self.isolate_scopes.get(&node).copied()
    }

    /// Controller `name` on `node` itself.
    pub fn controller(&self, node: NodeId, name: &str) -> Option<ControllerHandle> {
        self.node_controllers.get(&node)?.get(name).cloned()
    }

    /// Controller `name` on `node` or its nearest ancestor that has one.
    pub fn inherited_controller(&self, node: NodeId, name: &str) -> Option<ControllerHandle> {
        self.dom
            .ancestors(node)
            .into_iter()
            .find_map(|n| self.controller(n, name))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPRESSION CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves names against locals first, then the scope chain.
struct ScopeContext<'a> {
    rt: &'a mut Runtime,
    scope: ScopeId,
    locals: ValueMap,
}

impl EvalContext for ScopeContext<'_> {
    fn lookup(&self, name: &str) -> Value {
        if let Some(value) = self.locals.get(name) {
            return value.clone();
        }
        self.rt.scopes.get(self.scope, name)
    }

    fn store(&mut self, root: &str, path: &[String], value: Value) -> Result<()> {
        let stored = if let Some(local) = self.locals.get_mut(root) {
            local.set_path(path, value)
        } else if path.is_empty() {
            self.rt.scopes.set(self.scope, root, value);
            true
        } else {
            self.rt.scopes.set_path(self.scope, root, path, value)
        };
        if stored {
            Ok(())
        } else {
            Err(CompileError::new(
                ERR_EXPRESSION,
                &format!("Cannot assign to '{}.{}'.", root, path.join(".")),
            ))
        }
    }

    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        match callee {
            Value::Handler(_) => {
                let locals = match args.into_iter().next() {
                    Some(Value::Object(map)) => map,
                    _ => ValueMap::new(),
                };
                self.rt.invoke(callee, locals)
            }
            Value::Function(f) => Ok(f(&args)),
            other => Err(CompileError::new(
                ERR_EXPRESSION,
                &format!("Value of type '{}' is not a function.", other.type_name()),
            )),
        }
    }
}
