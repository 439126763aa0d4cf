//! Directive definitions and the registry that holds them.
//!
//! Directives are declared with the `DirectiveSpec` builder and validated
//! once, at registration. Compilation only ever sees the validated,
//! immutable `DirectiveDefinition`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::attributes::AttrSnapshot;
use crate::compiler::CompileContext;
use crate::controller::{BasicController, Controller, ControllerHandle, HookContext};
use crate::dom::{Dom, NodeId};
use crate::error::{
    CompileError, Result, ERR_BAD_BINDING, ERR_BAD_NAME, ERR_BAD_REQUIRE, ERR_BAD_RESTRICT,
    ERR_NO_CONTROLLER,
};
use crate::linker::LinkContext;
use crate::value::ValueMap;

lazy_static! {
    static ref BINDING_RE: Regex = Regex::new(r"^\s*([@&<]|=(\*?))(\??)\s*([\w$]*)\s*$").unwrap();
    static ref REQUIRE_PREFIX_RE: Regex = Regex::new(r"^(?:(\^\^?)?(\?)?(\^\^?)?)?").unwrap();
    static ref REQUIRE_NAME_RE: Regex = Regex::new(r"^[a-zA-Z_$][\w$]*$").unwrap();
}

const RESERVED_NAMES: &[&str] = &["hasOwnProperty", "constructor", "prototype"];

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACK TYPES
// ═══════════════════════════════════════════════════════════════════════════════

pub type LinkFn = Rc<dyn Fn(&mut LinkContext<'_>) -> Result<()>>;
/// Compile callback. Returning link functions overrides the directive's own.
pub type CompileFn = Rc<dyn Fn(&mut CompileContext<'_>) -> Result<Option<LinkFns>>>;
/// Builds a controller. `None` keeps the plain controller the engine allocated.
pub type ControllerFactory = Rc<dyn Fn(&mut HookContext<'_>) -> Result<Option<ControllerHandle>>>;
pub type TemplateFn = Rc<dyn Fn(&Dom, NodeId, &AttrSnapshot) -> String>;

#[derive(Clone, Default)]
pub struct LinkFns {
    pub pre: Option<LinkFn>,
    pub post: Option<LinkFn>,
}

impl LinkFns {
    pub fn post(f: impl Fn(&mut LinkContext<'_>) -> Result<()> + 'static) -> Self {
        Self {
            pre: None,
            post: Some(Rc::new(f)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.post.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NORMALIZED DEFINITION
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a directive may appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Restrict(u8);

impl Restrict {
    pub const ELEMENT: Restrict = Restrict(1);
    pub const ATTRIBUTE: Restrict = Restrict(2);
    pub const CLASS: Restrict = Restrict(4);
    pub const COMMENT: Restrict = Restrict(8);

    pub fn parse(letters: &str) -> Option<Restrict> {
        if letters.is_empty() {
            return None;
        }
        let mut mask = 0;
        for c in letters.chars() {
            mask |= match c {
                'E' => 1,
                'A' => 2,
                'C' => 4,
                'M' => 8,
                _ => return None,
            };
        }
        Some(Restrict(mask))
    }

    pub fn allows(self, location: Restrict) -> bool {
        self.0 & location.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeRequest {
    None,
    Child,
    Isolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingMode {
    /// `@`: interpolated attribute text.
    Text,
    /// `=`: two-way alias of an outer expression.
    TwoWay,
    /// `<`: one-way from the outer expression.
    OneWay,
    /// `&`: callable outer expression.
    Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    pub property: String,
    /// Normalized attribute name.
    pub attr: String,
    pub mode: BindingMode,
    pub optional: bool,
    /// `=*`. Kept for the definition outline only: two-way watches compare
    /// with structural `Value` equality, which already sees element changes.
    pub collection: bool,
}

impl BindingSpec {
    fn parse(directive: &str, property: &str, definition: &str, what: &str) -> Result<Self> {
        let caps = BINDING_RE.captures(definition).ok_or_else(|| {
            CompileError::new(
                ERR_BAD_BINDING,
                &format!(
                    "Invalid {} for directive '{}'. Definition: {{... {}: '{}' ...}}",
                    what, directive, property, definition
                ),
            )
        })?;
        let mode = match caps.get(1).map(|m| m.as_str()).unwrap_or_default() {
            "@" => BindingMode::Text,
            "<" => BindingMode::OneWay,
            "&" => BindingMode::Expression,
            _ => BindingMode::TwoWay,
        };
        let attr = caps
            .get(4)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(property);
        Ok(BindingSpec {
            property: property.to_string(),
            attr: attr.to_string(),
            mode,
            optional: caps.get(3).is_some_and(|m| m.as_str() == "?"),
            collection: caps.get(2).is_some_and(|m| m.as_str() == "*"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Search {
    /// The directive's own node.
    Local,
    /// `^`: own node, then ancestors.
    SelfAndAncestors,
    /// `^^`: ancestors only.
    Ancestors,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequireEntry {
    pub key: String,
    pub name: String,
    pub search: Search,
    pub optional: bool,
}

impl RequireEntry {
    fn parse(directive: &str, key: &str, raw: &str, allow_empty_name: bool) -> Result<Self> {
        let caps = REQUIRE_PREFIX_RE.captures(raw);
        let prefix_len = caps
            .as_ref()
            .and_then(|c| c.get(0))
            .map_or(0, |m| m.end());
        let group = |i: usize| {
            caps.as_ref()
                .and_then(|c| c.get(i))
                .map(|m| m.as_str())
                .unwrap_or_default()
        };
        let inherit = if group(1).is_empty() { group(3) } else { group(1) };
        let search = match inherit {
            "^^" => Search::Ancestors,
            "^" => Search::SelfAndAncestors,
            _ => Search::Local,
        };
        let mut name = raw[prefix_len..].trim().to_string();
        if name.is_empty() && allow_empty_name {
            name = key.to_string();
        }
        if !REQUIRE_NAME_RE.is_match(&name) {
            return Err(CompileError::new(
                ERR_BAD_REQUIRE,
                &format!("Invalid require '{}' on directive '{}'.", raw, directive),
            ));
        }
        Ok(RequireEntry {
            key: key.to_string(),
            name,
            search,
            optional: group(2) == "?",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequireShape {
    Single,
    List,
    Map,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequireSpec {
    pub shape: RequireShape,
    pub entries: Vec<RequireEntry>,
}

impl RequireSpec {
    fn own(name: &str) -> Self {
        RequireSpec {
            shape: RequireShape::Single,
            entries: vec![RequireEntry {
                key: name.to_string(),
                name: name.to_string(),
                search: Search::Local,
                optional: false,
            }],
        }
    }
}

#[derive(Clone)]
pub enum TemplateSpec {
    Inline(String),
    Dynamic(TemplateFn),
    Url(String),
    DynamicUrl(TemplateFn),
}

impl TemplateSpec {
    pub fn is_url(&self) -> bool {
        matches!(self, TemplateSpec::Url(_) | TemplateSpec::DynamicUrl(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSpec {
    pub name: String,
    /// Normalized tag or attribute name that routes a child into this slot.
    pub selector: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "slots", rename_all = "camelCase")]
pub enum Transclusion {
    None,
    Content,
    Element,
    Slots(Vec<SlotSpec>),
}

#[derive(Clone)]
pub struct DirectiveDefinition {
    pub name: String,
    /// Registration sequence number, used for stable ordering.
    pub index: usize,
    pub module: Option<String>,
    pub priority: i32,
    pub restrict: Restrict,
    pub terminal: bool,
    pub scope: ScopeRequest,
    pub scope_bindings: Vec<BindingSpec>,
    pub controller_bindings: Vec<BindingSpec>,
    /// Bindings (and a map-shaped `require`) land on the controller.
    pub bind_to_controller: bool,
    pub controller: Option<ControllerFactory>,
    pub controller_as: Option<String>,
    pub template: Option<TemplateSpec>,
    pub replace: bool,
    pub transclude: Transclusion,
    pub require: Option<RequireSpec>,
    pub compile: Option<CompileFn>,
    pub link: LinkFns,
    pub multi_element: bool,
    /// Set on the synchronous stand-in created once a URL template loads.
    pub(crate) original: Option<Rc<DirectiveDefinition>>,
}

impl DirectiveDefinition {
    /// Name annotated with the module it was registered in.
    pub fn display_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{} (module: {})", self.name, module),
            None => self.name.clone(),
        }
    }

    /// Declared require, or the directive's own controller when it has one.
    pub fn effective_require(&self) -> Option<RequireSpec> {
        match (&self.require, &self.controller) {
            (Some(r), _) => Some(r.clone()),
            (None, Some(_)) => Some(RequireSpec::own(&self.name)),
            (None, None) => None,
        }
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    /// Same directive once its URL template has been resolved.
    pub(crate) fn derive_sync(self: &Rc<Self>) -> Rc<DirectiveDefinition> {
        let mut derived = (**self).clone();
        derived.template = None;
        derived.transclude = Transclusion::None;
        derived.replace = false;
        derived.original = Some(self.clone());
        Rc::new(derived)
    }

    /// The directive this one was derived from, or itself.
    pub fn origin(&self) -> &DirectiveDefinition {
        self.original.as_deref().unwrap_or(self)
    }
}

impl fmt::Debug for DirectiveDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveDefinition")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("restrict", &self.restrict)
            .field("terminal", &self.terminal)
            .field("scope", &self.scope)
            .field("transclude", &self.transclude)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
enum ScopeDecl {
    #[default]
    None,
    Child,
    Isolate(Vec<(String, String)>),
}

#[derive(Clone, Default)]
enum BindToController {
    #[default]
    Off,
    FromScope,
    Map(Vec<(String, String)>),
}

#[derive(Clone)]
enum RequireDecl {
    Single(String),
    List(Vec<String>),
    Map(Vec<(String, String)>),
}

#[derive(Clone)]
enum TranscludeDecl {
    Content,
    Element,
    Slots(Vec<(String, String)>),
}

/// Unvalidated directive declaration.
#[derive(Clone, Default)]
pub struct DirectiveSpec {
    priority: i32,
    restrict: Option<String>,
    terminal: bool,
    scope: ScopeDecl,
    bind_to_controller: BindToController,
    controller: Option<ControllerFactory>,
    controller_as: Option<String>,
    template: Option<TemplateSpec>,
    replace: bool,
    transclude: Option<TranscludeDecl>,
    require: Option<RequireDecl>,
    compile: Option<CompileFn>,
    link: LinkFns,
    multi_element: bool,
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl DirectiveSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Component shorthand: element-only, isolate scope, bindings on the
    /// controller, controller published as `$ctrl`.
    pub fn component(bindings: &[(&str, &str)]) -> Self {
        let mut spec = Self::new().restrict("E");
        spec.scope = ScopeDecl::Isolate(Vec::new());
        spec.bind_to_controller = BindToController::Map(pairs(bindings));
        spec
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn restrict(mut self, letters: &str) -> Self {
        self.restrict = Some(letters.to_string());
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn child_scope(mut self) -> Self {
        self.scope = ScopeDecl::Child;
        self
    }

    pub fn isolate(mut self, bindings: &[(&str, &str)]) -> Self {
        self.scope = ScopeDecl::Isolate(pairs(bindings));
        self
    }

    /// Moves the isolate bindings onto the controller.
    pub fn bind_to_controller(mut self) -> Self {
        self.bind_to_controller = BindToController::FromScope;
        self
    }

    pub fn bind_to_controller_map(mut self, bindings: &[(&str, &str)]) -> Self {
        self.bind_to_controller = BindToController::Map(pairs(bindings));
        self
    }

    /// Controller built by `f`; the instance shares the engine's binding bag.
    pub fn controller<T, F>(mut self, f: F) -> Self
    where
        T: Controller,
        F: Fn(&mut HookContext<'_>) -> Result<T> + 'static,
    {
        self.controller = Some(Rc::new(move |ctx: &mut HookContext<'_>| {
            let controller = f(ctx)?;
            Ok(Some(ControllerHandle::new(
                &ctx.directive,
                controller,
                ctx.bindings.clone(),
            )))
        }));
        self
    }

    /// Controller factory that may hand back any existing controller, which
    /// then replaces the constructed instance.
    pub fn controller_factory(
        mut self,
        f: impl Fn(&mut HookContext<'_>) -> Result<Option<ControllerHandle>> + 'static,
    ) -> Self {
        self.controller = Some(Rc::new(f));
        self
    }

    pub fn controller_as(mut self, alias: &str) -> Self {
        self.controller_as = Some(alias.to_string());
        self
    }

    pub fn template(mut self, html: &str) -> Self {
        self.template = Some(TemplateSpec::Inline(html.to_string()));
        self
    }

    pub fn template_fn(mut self, f: impl Fn(&Dom, NodeId, &AttrSnapshot) -> String + 'static) -> Self {
        self.template = Some(TemplateSpec::Dynamic(Rc::new(f)));
        self
    }

    pub fn template_url(mut self, url: &str) -> Self {
        self.template = Some(TemplateSpec::Url(url.to_string()));
        self
    }

    pub fn template_url_fn(
        mut self,
        f: impl Fn(&Dom, NodeId, &AttrSnapshot) -> String + 'static,
    ) -> Self {
        self.template = Some(TemplateSpec::DynamicUrl(Rc::new(f)));
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn transclude(mut self) -> Self {
        self.transclude = Some(TranscludeDecl::Content);
        self
    }

    pub fn transclude_element(mut self) -> Self {
        self.transclude = Some(TranscludeDecl::Element);
        self
    }

    /// Named slots, `(slot, selector)`; a `?` selector prefix makes the slot optional.
    pub fn transclude_slots(mut self, slots: &[(&str, &str)]) -> Self {
        self.transclude = Some(TranscludeDecl::Slots(pairs(slots)));
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.require = Some(RequireDecl::Single(name.to_string()));
        self
    }

    pub fn require_list(mut self, names: &[&str]) -> Self {
        self.require = Some(RequireDecl::List(
            names.iter().map(|n| n.to_string()).collect(),
        ));
        self
    }

    pub fn require_map(mut self, entries: &[(&str, &str)]) -> Self {
        self.require = Some(RequireDecl::Map(pairs(entries)));
        self
    }

    pub fn compile(
        mut self,
        f: impl Fn(&mut CompileContext<'_>) -> Result<Option<LinkFns>> + 'static,
    ) -> Self {
        self.compile = Some(Rc::new(f));
        self
    }

    /// Post-link function.
    pub fn link(self, f: impl Fn(&mut LinkContext<'_>) -> Result<()> + 'static) -> Self {
        self.post_link(f)
    }

    pub fn pre_link(mut self, f: impl Fn(&mut LinkContext<'_>) -> Result<()> + 'static) -> Self {
        self.link.pre = Some(Rc::new(f));
        self
    }

    pub fn post_link(mut self, f: impl Fn(&mut LinkContext<'_>) -> Result<()> + 'static) -> Self {
        self.link.post = Some(Rc::new(f));
        self
    }

    pub fn multi_element(mut self) -> Self {
        self.multi_element = true;
        self
    }

    fn build(self, name: &str, index: usize, module: Option<String>) -> Result<DirectiveDefinition> {
        let restrict_letters = self.restrict.as_deref().unwrap_or("EA");
        let restrict = Restrict::parse(restrict_letters).ok_or_else(|| {
            CompileError::new(
                ERR_BAD_RESTRICT,
                &format!(
                    "Restrict property '{}' of directive '{}' is invalid",
                    restrict_letters, name
                ),
            )
        })?;

        let (scope, declared) = match self.scope {
            ScopeDecl::None => (ScopeRequest::None, Vec::new()),
            ScopeDecl::Child => (ScopeRequest::Child, Vec::new()),
            ScopeDecl::Isolate(b) => (ScopeRequest::Isolate, b),
        };
        let parse_all = |items: &[(String, String)], what: &str| -> Result<Vec<BindingSpec>> {
            items
                .iter()
                .map(|(prop, def)| BindingSpec::parse(name, prop, def, what))
                .collect()
        };
        let (scope_bindings, controller_bindings) = match &self.bind_to_controller {
            BindToController::Off => (parse_all(&declared, "isolate scope definition")?, Vec::new()),
            BindToController::FromScope => (
                Vec::new(),
                parse_all(&declared, "isolate scope definition")?,
            ),
            BindToController::Map(map) => (
                parse_all(&declared, "isolate scope definition")?,
                parse_all(map, "bindings definition")?,
            ),
        };
        let binds_controller = !matches!(self.bind_to_controller, BindToController::Off);
        if binds_controller && self.controller.is_none() {
            return Err(CompileError::new(
                ERR_NO_CONTROLLER,
                &format!("Cannot bind to controller without directive '{}'s controller.", name),
            ));
        }

        let transclude = match self.transclude {
            None => Transclusion::None,
            Some(TranscludeDecl::Content) => Transclusion::Content,
            Some(TranscludeDecl::Element) => Transclusion::Element,
            Some(TranscludeDecl::Slots(slots)) => Transclusion::Slots(
                slots
                    .into_iter()
                    .map(|(slot, selector)| {
                        let optional = selector.starts_with('?');
                        let selector = selector.trim_start_matches('?');
                        SlotSpec {
                            name: slot,
                            selector: crate::matcher::directive_normalize(selector),
                            optional,
                        }
                    })
                    .collect(),
            ),
        };

        let require = match self.require {
            None => None,
            Some(RequireDecl::Single(raw)) => Some(RequireSpec {
                shape: RequireShape::Single,
                entries: vec![RequireEntry::parse(name, &raw, &raw, false)?],
            }),
            Some(RequireDecl::List(items)) => Some(RequireSpec {
                shape: RequireShape::List,
                entries: items
                    .iter()
                    .map(|raw| RequireEntry::parse(name, raw, raw, false))
                    .collect::<Result<_>>()?,
            }),
            Some(RequireDecl::Map(items)) => Some(RequireSpec {
                shape: RequireShape::Map,
                entries: items
                    .iter()
                    .map(|(key, raw)| RequireEntry::parse(name, key, raw, true))
                    .collect::<Result<_>>()?,
            }),
        };

        Ok(DirectiveDefinition {
            name: name.to_string(),
            index,
            module,
            priority: self.priority,
            restrict,
            terminal: self.terminal,
            scope,
            scope_bindings,
            controller_bindings,
            bind_to_controller: binds_controller,
            controller: self.controller,
            controller_as: self.controller_as,
            template: self.template,
            replace: self.replace,
            transclude,
            require,
            compile: self.compile,
            link: self.link,
            multi_element: self.multi_element,
            original: None,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(CompileError::new(
            ERR_BAD_NAME,
            &format!("Directive/Component name '{}' is invalid. {}", name, why),
        ))
    };
    if name.trim() != name {
        return invalid("The name should not contain leading or trailing whitespaces");
    }
    let Some(first) = name.chars().next() else {
        return invalid("The name must not be empty");
    };
    if !first.is_ascii_lowercase() {
        return invalid("The first character must be a lowercase letter");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return invalid("Names may only contain letters, digits, '_' and '$'");
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(CompileError::new(
            ERR_BAD_NAME,
            &format!("{} is not a valid directive name", name),
        ));
    }
    Ok(())
}

/// Explicit, append-only directive registry.
#[derive(Default)]
pub struct DirectiveRegistry {
    directives: HashMap<String, Vec<Rc<DirectiveDefinition>>>,
    next_index: usize,
    module: Option<String>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in directives.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtins::register_builtins(&mut registry);
        registry
    }

    /// Module name recorded on subsequently registered directives.
    pub fn set_module(&mut self, module: Option<&str>) {
        self.module = module.map(str::to_string);
    }

    pub fn register(&mut self, name: &str, spec: DirectiveSpec) -> Result<()> {
        self.register_all(name, vec![spec])
    }

    /// Registers several definitions under one name; all of them apply.
    pub fn register_all(&mut self, name: &str, specs: Vec<DirectiveSpec>) -> Result<()> {
        validate_name(name)?;
        let module = self.module.clone();
        let mut built = Vec::with_capacity(specs.len());
        for spec in specs {
            built.push(Rc::new(spec.build(name, self.next_index, module.clone())?));
            self.next_index += 1;
        }
        tracing::debug!(directive = name, count = built.len(), "registered directive");
        self.directives.entry(name.to_string()).or_default().extend(built);
        Ok(())
    }

    /// Registers a component. A missing controller becomes a plain one and
    /// the alias defaults to `$ctrl`.
    pub fn register_component(&mut self, name: &str, spec: DirectiveSpec) -> Result<()> {
        let mut spec = spec.restrict("E");
        spec.scope = match spec.scope {
            ScopeDecl::Isolate(b) => ScopeDecl::Isolate(b),
            _ => ScopeDecl::Isolate(Vec::new()),
        };
        if matches!(spec.bind_to_controller, BindToController::Off) {
            spec.bind_to_controller = BindToController::Map(Vec::new());
        }
        if spec.controller.is_none() {
            spec = spec.controller(|_| Ok(BasicController));
        }
        if spec.controller_as.is_none() {
            spec.controller_as = Some("$ctrl".to_string());
        }
        self.register(name, spec)
    }

    pub fn lookup(&self, name: &str) -> &[Rc<DirectiveDefinition>] {
        self.directives.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.directives.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

/// Fresh binding bag for a controller under construction.
pub(crate) fn new_binding_bag() -> Rc<RefCell<ValueMap>> {
    Rc::new(RefCell::new(ValueMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERR_BAD_REQUIRE;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("myDir").is_ok());
        assert!(validate_name("my_dir2").is_ok());
        for bad in ["", "MyDir", " myDir", "myDir ", "my-dir", "hasOwnProperty"] {
            let err = validate_name(bad).unwrap_err();
            assert_eq!(err.code, ERR_BAD_NAME, "{:?}", bad);
        }
    }

    #[test]
    fn test_restrict_parse() {
        let r = Restrict::parse("EA").unwrap();
        assert!(r.allows(Restrict::ELEMENT));
        assert!(r.allows(Restrict::ATTRIBUTE));
        assert!(!r.allows(Restrict::CLASS));
        assert!(Restrict::parse("").is_none());
        assert!(Restrict::parse("EX").is_none());

        let mut registry = DirectiveRegistry::new();
        let err = registry
            .register("bad", DirectiveSpec::new().restrict("Z"))
            .unwrap_err();
        assert_eq!(err.code, ERR_BAD_RESTRICT);
    }

    #[test]
    fn test_binding_parse() {
        let b = BindingSpec::parse("d", "value", "=?myAttr", "isolate scope definition").unwrap();
        assert_eq!(b.mode, BindingMode::TwoWay);
        assert!(b.optional);
        assert_eq!(b.attr, "myAttr");

        let b = BindingSpec::parse("d", "name", "@", "isolate scope definition").unwrap();
        assert_eq!(b.mode, BindingMode::Text);
        assert_eq!(b.attr, "name");

        let b = BindingSpec::parse("d", "list", "=*", "isolate scope definition").unwrap();
        assert!(b.collection);

        let err = BindingSpec::parse("d", "x", "xxx", "isolate scope definition").unwrap_err();
        assert_eq!(err.code, ERR_BAD_BINDING);
        assert!(err.message.contains("x: 'xxx'"));
    }

    #[test]
    fn test_require_prefixes() {
        let e = RequireEntry::parse("d", "k", "^^?tabs", false).unwrap();
        assert_eq!(e.search, Search::Ancestors);
        assert!(e.optional);
        assert_eq!(e.name, "tabs");

        let e = RequireEntry::parse("d", "k", "?^tabs", false).unwrap();
        assert_eq!(e.search, Search::SelfAndAncestors);
        assert!(e.optional);

        let e = RequireEntry::parse("d", "tabs", "^^", true).unwrap();
        assert_eq!(e.name, "tabs");

        let err = RequireEntry::parse("d", "k", "^", false).unwrap_err();
        assert_eq!(err.code, ERR_BAD_REQUIRE);
    }

    #[test]
    fn test_bind_to_controller_needs_controller() {
        let mut registry = DirectiveRegistry::new();
        let err = registry
            .register(
                "dir",
                DirectiveSpec::new().isolate(&[("a", "<")]).bind_to_controller(),
            )
            .unwrap_err();
        assert_eq!(err.code, ERR_NO_CONTROLLER);
    }

    #[test]
    fn test_registry_appends_and_orders() {
        let mut registry = DirectiveRegistry::new();
        registry.register("a", DirectiveSpec::new()).unwrap();
        registry.set_module(Some("app"));
        registry.register("a", DirectiveSpec::new().priority(5)).unwrap();
        let defs = registry.lookup("a");
        assert_eq!(defs.len(), 2);
        assert!(defs[0].index < defs[1].index);
        assert_eq!(defs[1].display_name(), "a (module: app)");
        assert!(registry.lookup("missing").is_empty());
    }

    #[test]
    fn test_component_defaults() {
        let mut registry = DirectiveRegistry::new();
        registry
            .register_component("myComp", DirectiveSpec::component(&[("value", "<")]))
            .unwrap();
        let def = &registry.lookup("myComp")[0];
        assert_eq!(def.scope, ScopeRequest::Isolate);
        assert!(def.restrict.allows(Restrict::ELEMENT));
        assert!(!def.restrict.allows(Restrict::ATTRIBUTE));
        assert_eq!(def.controller_as.as_deref(), Some("$ctrl"));
        assert_eq!(def.controller_bindings[0].mode, BindingMode::OneWay);
        assert!(def.effective_require().is_some());
    }

    #[test]
    fn test_slot_selectors_are_normalized() {
        let mut registry = DirectiveRegistry::new();
        registry
            .register(
                "pane",
                DirectiveSpec::new().transclude_slots(&[("bossSlot", "boss"), ("title", "?pane-title")]),
            )
            .unwrap();
        let Transclusion::Slots(slots) = &registry.lookup("pane")[0].transclude else {
            panic!("expected slots");
        };
        assert_eq!(slots[1].selector, "paneTitle");
        assert!(slots[1].optional);
        assert!(!slots[0].optional);
    }
}
