//! # Directive Compiler
//!
//! Compiles a markup tree annotated with directives into link functions and
//! links them against a hierarchy of scopes.
//!
//! ## Phases
//!
//! 1. **Compile** walks the tree top-down. For each node it collects the
//!    matching directives (element, attribute, class and comment forms),
//!    sorts them by priority and applies them: templates are inlined or
//!    deferred until fetched, content is set aside for transclusion, and
//!    conflicting requests for templates, transclusion or scopes are
//!    rejected.
//! 2. **Link** runs the recorded link functions against a scope: scopes are
//!    created, controllers instantiated and bound, pre-links run top-down,
//!    post-links bottom-up.
//! 3. **Digest** re-evaluates watchers until the scope tree is stable and
//!    delivers `on_changes` notifications to controllers.
//!
//! ```text
//! let mut rt = Runtime::new(registry);
//! let link = rt.compile_html("<my-dir name=\"{{who}}\"></my-dir>")?;
//! link.link(&mut rt, rt.root_scope())?;
//! rt.digest()?;
//! ```
//!
//! Everything is single-threaded. Remote templates are fetched through the
//! host task queue (`Runtime::flush_tasks`); linking of a subtree waiting on
//! a template resumes once it arrives.

mod attributes;
mod bindings;
mod builtins;
mod compiler;
mod config;
mod controller;
mod diagnostics;
mod digest;
mod dom;
mod error;
mod expr;
mod interpolate;
mod linker;
mod matcher;
mod registry;
mod runtime;
mod scope;
mod template;
mod transclude;
mod value;

#[cfg(test)]
mod compile_tests;
#[cfg(test)]
mod link_tests;

pub use attributes::{snake_case, AttrSnapshot, Attributes, ObserverHandle};
pub use compiler::{CloneAttach, CompileContext, LinkFunction, LinkOptions, LinkPlan, NodePlan};
pub use config::CompileConfig;
pub use controller::{
    BasicController, Changes, Controller, ControllerHandle, ControllerId, HookContext, Required,
    SimpleChange,
};
pub use diagnostics::{CollectingReporter, FaultReporter, TracingReporter};
pub use dom::{Dom, DomAttr, NodeId, NodeKind};
pub use error::*;
pub use expr::{EvalContext, Evaluator, OxcEvaluator};
pub use interpolate::{has_interpolation, Interpolation, Part};
pub use linker::LinkContext;
pub use matcher::{directive_normalize, Matched};
pub use registry::{
    validate_name, BindingMode, BindingSpec, CompileFn, ControllerFactory, DirectiveDefinition,
    DirectiveRegistry, DirectiveSpec, LinkFn, LinkFns, RequireEntry, RequireShape, RequireSpec,
    Restrict, ScopeRequest, Search, SlotSpec, TemplateFn, TemplateSpec, Transclusion,
};
pub use runtime::{Runtime, Task};
pub use scope::{ScopeArena, ScopeId, WatchFn, WatchHandle, WatchListener, WatchSource};
pub use template::{CachedTemplateSource, DirectoryTemplateSource, TemplateCache, TemplateSource};
pub use transclude::TranscludeFn;
pub use value::{ExpressionHandler, NativeFn, Value, ValueMap};
