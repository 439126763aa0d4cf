//! Link-phase behavior: scopes, interpolation, require, controllers and
//! templates that arrive asynchronously.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::CompileConfig;
use crate::controller::{BasicController, Controller, ControllerHandle, HookContext};
use crate::diagnostics::CollectingReporter;
use crate::error::{
    Result, ERR_CONTROLLER_REQUIRED, ERR_EXPRESSION, ERR_HOOK, ERR_MULTI_LINK, ERR_TEMPLATE_LOAD,
};
use crate::registry::{DirectiveRegistry, DirectiveSpec};
use crate::runtime::Runtime;
use crate::scope::ScopeId;
use crate::template::TemplateCache;
use crate::value::Value;

type Log = Rc<RefCell<Vec<String>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERPOLATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_text_and_attribute_interpolation() {
    let log = new_log();
    let sink = log.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "track",
            DirectiveSpec::new().link(move |ctx| {
                let sink = sink.clone();
                ctx.attrs.observe(ctx.rt, "href", move |_, value| {
                    sink.borrow_mut().push(value.unwrap_or_default().to_string());
                    Ok(())
                });
                Ok(())
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    rt.scopes.set(root, "id", 7);
    rt.scopes.set(root, "name", "Ada");

    let link = rt
        .compile_html(r#"<a track href="/u/{{id}}">Hi {{name}}!</a>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    rt.digest().unwrap();
    let a = link.nodes()[0];
    assert_eq!(rt.dom.attr(a, "href"), Some("/u/7"));
    assert_eq!(rt.dom.text_content(a), "Hi Ada!");

    rt.scopes.set(root, "id", 8);
    rt.digest().unwrap();
    assert_eq!(rt.dom.attr(a, "href"), Some("/u/8"));
    assert_eq!(*log.borrow(), vec!["/u/7", "/u/8"]);
}

#[test]
fn test_static_attribute_observer_fires_once_asynchronously() {
    let log = new_log();
    let sink = log.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "watchTitle",
            DirectiveSpec::new().link(move |ctx| {
                let sink = sink.clone();
                ctx.attrs.observe(ctx.rt, "title", move |_, value| {
                    sink.borrow_mut().push(value.unwrap_or_default().to_string());
                    Ok(())
                });
                Ok(())
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html(r#"<p watch-title title="fixed"></p>"#).unwrap();
    link.link(&mut rt, root).unwrap();
    assert!(log.borrow().is_empty());
    rt.digest().unwrap();
    rt.digest().unwrap();
    assert_eq!(*log.borrow(), vec!["fixed"]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINKING AND SCOPES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_objects_render_as_compact_json() {
    let mut rt = Runtime::new(DirectiveRegistry::new());
    let root = rt.root_scope();
    rt.scopes
        .set(root, "obj", Value::from(serde_json::json!({"a": 1, "b": [2, 3], "c": 0.5})));
    let link = rt.compile_html("<p>{{obj}}</p>").unwrap();
    link.link(&mut rt, root).unwrap();
    rt.digest().unwrap();
    assert_eq!(rt.dom.inner_html(link.nodes()[0]), r#"{"a":1,"b":[2,3],"c":0.5}"#);
}

#[test]
fn test_far_array_index_assignment_fails_cleanly() {
    let mut rt = Runtime::new(DirectiveRegistry::new());
    let root = rt.root_scope();
    rt.scopes.set(root, "list", Value::Array(vec![]));
    for expression in ["list[1e18] = 1", "list[1e12] = 1"] {
        let err = rt.eval(root, expression).unwrap_err();
        assert_eq!(err.code, ERR_EXPRESSION);
    }
    rt.eval(root, "list[1] = 'b'").unwrap();
    assert_eq!(rt.eval(root, "list.length").unwrap(), Value::from(2));
}

#[test]
fn test_linking_twice_is_rejected_but_clones_are_not() {
    let mut rt = Runtime::new(DirectiveRegistry::new());
    let root = rt.root_scope();
    let link = rt.compile_html("<p>{{x}}</p>").unwrap();

    let clone = link
        .link_with(&mut rt, root, Some(&mut |_: &mut Runtime, _: &[crate::dom::NodeId], _: ScopeId| {}), Default::default())
        .unwrap();
    assert_ne!(clone, link.nodes());

    link.link(&mut rt, root).unwrap();
    let err = link.link(&mut rt, root).err().unwrap();
    assert_eq!(err.code, ERR_MULTI_LINK);
}

#[test]
fn test_child_scope_inherits_and_isolate_does_not() {
    let seen: Rc<RefCell<Vec<(String, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    let mut registry = DirectiveRegistry::new();
    for (name, spec) in [
        ("childy", DirectiveSpec::new().child_scope()),
        ("lonely", DirectiveSpec::new().isolate(&[])),
    ] {
        let seen = seen.clone();
        registry
            .register(
                name,
                spec.link(move |ctx| {
                    let value = ctx.rt.scopes.get(ctx.scope, "name");
                    seen.borrow_mut().push((ctx.directive.name.clone(), value));
                    Ok(())
                }),
            )
            .unwrap();
    }
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    rt.scopes.set(root, "name", "outer");
    let link = rt.compile_html("<div><p childy></p><p lonely></p></div>").unwrap();
    link.link(&mut rt, root).unwrap();

    assert_eq!(
        *seen.borrow(),
        vec![
            ("childy".to_string(), Value::str("outer")),
            ("lonely".to_string(), Value::Undefined),
        ]
    );
    let div = link.nodes()[0];
    let p = rt.dom.children(div)[0];
    let child_scope = rt.scope_of(p).unwrap();
    assert_ne!(child_scope, root);
    assert_eq!(rt.scopes.parent(child_scope), Some(root));
    let q = rt.dom.children(div)[1];
    assert!(rt.scopes.is_isolate(rt.isolate_scope_of(q).unwrap()));
}

#[test]
fn test_isolate_template_renders_bound_values() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "card",
            DirectiveSpec::new()
                .isolate(&[("title", "@"), ("model", "="), ("count", "<")])
                .template("<h1>{{title}}</h1><p>{{model.name}} {{count}}</p>"),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    rt.scopes.set(root, "who", "Bob");
    rt.scopes.set(root, "user", Value::from(serde_json::json!({"name": "Ann"})));
    rt.scopes.set(root, "n", 1);
    let link = rt
        .compile_html(r#"<div card title="hi {{who}}" model="user" count="n"></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    rt.digest().unwrap();
    let card = link.nodes()[0];
    assert_eq!(rt.dom.inner_html(card), "<h1>hi Bob</h1><p>Ann 1</p>");

    rt.scopes.set(root, "who", "Cy");
    rt.scopes.set(root, "n", 2);
    rt.digest().unwrap();
    assert_eq!(rt.dom.inner_html(card), "<h1>hi Cy</h1><p>Ann 2</p>");

    // One-way bindings never flow back out.
    let isolate = rt.isolate_scope_of(card).unwrap();
    rt.scopes.set(isolate, "count", 99);
    rt.digest().unwrap();
    assert_eq!(rt.scopes.get(root, "n"), Value::from(2));
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLERS AND REQUIRE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Greeter;

impl Controller for Greeter {
    fn on_init(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        ctx.set_binding("greeting", "hello");
        Ok(())
    }
}

#[test]
fn test_controller_alias_is_published_on_scope() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "greeter",
            DirectiveSpec::new()
                .child_scope()
                .controller(|_| Ok(Greeter))
                .controller_as("vm"),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html("<div greeter><b>{{vm.greeting}}</b></div>").unwrap();
    link.link(&mut rt, root).unwrap();
    rt.digest().unwrap();
    assert_eq!(rt.dom.text_content(link.nodes()[0]), "hello");
    assert!(rt.controller(link.nodes()[0], "greeter").is_some());
    // The alias lives on the directive's own scope, not the parent.
    assert!(rt.scopes.get(root, "vm").is_undefined());
}

#[test]
fn test_require_searches_ancestors() {
    let found: Rc<RefCell<Vec<Option<String>>>> = Rc::new(RefCell::new(Vec::new()));
    let mut registry = DirectiveRegistry::new();
    registry
        .register("tabs", DirectiveSpec::new().controller(|_| Ok(BasicController)))
        .unwrap();
    for (name, require) in [("pane", "^^tabs"), ("maybe", "?^^tabs")] {
        let found = found.clone();
        registry
            .register(
                name,
                DirectiveSpec::new().require(require).link(move |ctx| {
                    found
                        .borrow_mut()
                        .push(ctx.required.single().map(|c| c.name().to_string()));
                    Ok(())
                }),
            )
            .unwrap();
    }
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();

    let link = rt
        .compile_html("<div tabs><section><p pane></p></section></div><p maybe></p>")
        .unwrap();
    link.link(&mut rt, root).unwrap();
    assert_eq!(*found.borrow(), vec![Some("tabs".to_string()), None]);

    let orphan = rt.compile_html("<p pane></p>").unwrap();
    let err = orphan.link(&mut rt, root).err().unwrap();
    assert_eq!(err.code, ERR_CONTROLLER_REQUIRED);
    assert_eq!(
        err.message,
        "Controller 'tabs', required by directive 'pane', can't be found!"
    );
    assert_eq!(err.context.as_deref(), Some("<p pane>"));
}

#[test]
fn test_factory_result_replaces_the_controller() {
    let shared = ControllerHandle::new("store", BasicController, Rc::new(RefCell::new(Default::default())));
    shared.set_binding("kind", Value::str("shared"));
    let given = shared.clone();
    let seen: Rc<RefCell<Option<ControllerHandle>>> = Rc::new(RefCell::new(None));
    let sink = seen.clone();

    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "store",
            DirectiveSpec::new().controller_factory(move |_| Ok(Some(given.clone()))),
        )
        .unwrap();
    registry
        .register(
            "reader",
            DirectiveSpec::new().require("^store").link(move |ctx| {
                *sink.borrow_mut() = ctx.required.single().cloned();
                Ok(())
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html("<div store><i reader></i></div>").unwrap();
    link.link(&mut rt, root).unwrap();

    let required = seen.borrow().clone().unwrap();
    assert!(required.same(&shared));
    assert_eq!(required.binding("kind"), Value::str("shared"));
}

#[test]
fn test_map_require_binds_onto_controller() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register("form", DirectiveSpec::new().controller(|_| Ok(BasicController)))
        .unwrap();
    registry
        .register(
            "field",
            DirectiveSpec::new()
                .controller(|_| Ok(BasicController))
                .bind_to_controller_map(&[])
                .require_map(&[("form", "^^"), ("missing", "?^^nothing")]),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html("<div form><input field></div>").unwrap();
    link.link(&mut rt, root).unwrap();

    let input = rt.dom.children(link.nodes()[0])[0];
    let field = rt.controller(input, "field").unwrap();
    match field.binding("form") {
        Value::Controller(form) => assert_eq!(form.name(), "form"),
        other => panic!("expected controller, got {:?}", other),
    }
    assert_eq!(field.binding("missing"), Value::Null);
}

#[test]
fn test_link_errors_propagate_and_compile_errors_are_reported() {
    let reporter = Rc::new(CollectingReporter::new());
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "broken",
            DirectiveSpec::new().link(|_| Err(crate::error::CompileError::hook("link failed"))),
        )
        .unwrap();
    registry
        .register(
            "flaky",
            DirectiveSpec::new().compile(|_| Err(crate::error::CompileError::hook("compile failed"))),
        )
        .unwrap();
    let mut rt = Runtime::new(registry).with_reporter(reporter.clone());
    let root = rt.root_scope();

    let link = rt.compile_html("<p flaky></p>").unwrap();
    assert_eq!(reporter.faults()[0].message, "compile failed");
    link.link(&mut rt, root).unwrap();

    let link = rt.compile_html("<p broken></p>").unwrap();
    let err = link.link(&mut rt, root).err().unwrap();
    assert_eq!(err.code, ERR_HOOK);
    assert_eq!(err.context.as_deref(), Some("<p broken>"));
}

// ═══════════════════════════════════════════════════════════════════════════════
// URL TEMPLATES
// ═══════════════════════════════════════════════════════════════════════════════

fn remote_runtime(log: &Log) -> (Runtime, Rc<TemplateCache>) {
    let cache = Rc::new(TemplateCache::new());
    cache.put("remote.html", "<b>{{x}}</b>");
    cache.put("root.html", r#"<section class="r">{{x}}</section>"#);

    let mut registry = DirectiveRegistry::new();
    for (name, spec) in [
        ("remote", DirectiveSpec::new().template_url("remote.html")),
        ("remoteRoot", DirectiveSpec::new().replace().template_url("root.html")),
        ("missing", DirectiveSpec::new().template_url("nowhere.html")),
    ] {
        let log = log.clone();
        registry
            .register(
                name,
                spec.link(move |ctx| {
                    log.borrow_mut().push(ctx.directive.name.clone());
                    Ok(())
                }),
            )
            .unwrap();
    }
    let rt = Runtime::new(registry).with_templates(cache.clone());
    (rt, cache)
}

#[test]
fn test_url_template_links_after_fetch() {
    let log = new_log();
    let (mut rt, _cache) = remote_runtime(&log);
    let root = rt.root_scope();
    rt.scopes.set(root, "x", 1);
    let link = rt.compile_html("<div><p remote>old</p></div>").unwrap();
    assert!(link.plan().nodes[0].children[0].deferred);

    link.link(&mut rt, root).unwrap();
    let p = rt.dom.children(link.nodes()[0])[0];
    assert_eq!(rt.dom.inner_html(p), "");
    assert!(log.borrow().is_empty());

    rt.flush_tasks().unwrap();
    assert_eq!(*log.borrow(), vec!["remote"]);
    assert_eq!(rt.dom.inner_html(p), "<b>1</b>");
}

#[test]
fn test_url_template_replace_swaps_root() {
    let log = new_log();
    let (mut rt, _cache) = remote_runtime(&log);
    let root = rt.root_scope();
    rt.scopes.set(root, "x", "y");
    let link = rt.compile_html(r#"<div remote-root class="o"></div>"#).unwrap();
    link.link(&mut rt, root).unwrap();
    rt.flush_tasks().unwrap();

    let node = link.nodes()[0];
    assert_eq!(rt.dom.tag(node), Some("section"));
    let mut classes = rt.dom.class_tokens(node);
    classes.sort();
    assert_eq!(classes, vec!["o", "r"]);
    assert_eq!(rt.dom.text_content(node), "y");
    assert_eq!(*log.borrow(), vec!["remoteRoot"]);
}

#[test]
fn test_removed_or_destroyed_before_fetch_is_never_linked() {
    let log = new_log();
    let (mut rt, _cache) = remote_runtime(&log);
    let root = rt.root_scope();

    let removed = rt.compile_html("<div><p remote></p></div>").unwrap();
    removed.link(&mut rt, root).unwrap();
    let p = rt.dom.children(removed.nodes()[0])[0];
    rt.remove_node(p);

    let scope = rt.new_scope(root);
    let destroyed = rt.compile_html("<div><p remote></p></div>").unwrap();
    destroyed.link(&mut rt, scope).unwrap();
    rt.destroy_scope(scope);

    rt.flush_tasks().unwrap();
    assert!(log.borrow().is_empty());
    assert!(rt.awaiting_template.is_empty());
}

#[test]
fn test_template_fetch_failure_is_reported() {
    let log = new_log();
    let reporter = Rc::new(CollectingReporter::new());
    let (rt, _cache) = remote_runtime(&log);
    let mut rt = rt.with_reporter(reporter.clone());
    let root = rt.root_scope();
    let link = rt.compile_html("<p missing></p>").unwrap();
    link.link(&mut rt, root).unwrap();
    rt.flush_tasks().unwrap();

    let faults = reporter.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].code, ERR_TEMPLATE_LOAD);
    assert!(faults[0].message.starts_with("Failed to load template: nowhere.html"));
    assert!(log.borrow().is_empty());
}

#[test]
fn test_clones_linked_while_loading_get_their_own_copy() {
    let log = new_log();
    let (mut rt, _cache) = remote_runtime(&log);
    let root = rt.root_scope();
    rt.scopes.set(root, "x", 5);
    let link = rt.compile_html("<p remote></p>").unwrap();
    let mut clones = Vec::new();
    for _ in 0..2 {
        let nodes = link
            .link_with(
                &mut rt,
                root,
                Some(&mut |_: &mut Runtime, _: &[crate::dom::NodeId], _: ScopeId| {}),
                Default::default(),
            )
            .unwrap();
        let host = rt.dom.create_element("div");
        rt.dom.append_child(host, nodes[0]);
        clones.push(host);
    }
    rt.flush_tasks().unwrap();
    assert_eq!(log.borrow().len(), 2);
    for host in clones {
        assert_eq!(rt.dom.inner_html(host), "<p remote><b>5</b></p>");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REMOVAL
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Tracked {
    destroyed: Rc<Cell<u32>>,
}

impl Controller for Tracked {
    fn on_destroy(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        self.destroyed.set(self.destroyed.get() + 1);
        Ok(())
    }
}

#[test]
fn test_remove_node_destroys_owned_scopes_and_controllers() {
    let destroyed = Rc::new(Cell::new(0));
    let counter = destroyed.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "tracked",
            DirectiveSpec::new().child_scope().controller(move |_| {
                Ok(Tracked {
                    destroyed: counter.clone(),
                })
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html("<div><p tracked>{{a}}</p><p tracked></p></div>").unwrap();
    link.link(&mut rt, root).unwrap();
    let live_before = rt.scopes.live_count();

    let first = rt.dom.children(link.nodes()[0])[0];
    let scope = rt.scope_of(first).unwrap();
    rt.remove_node(first);
    assert!(rt.scopes.is_destroyed(scope));
    assert_eq!(rt.scopes.live_count(), live_before - 1);
    assert_eq!(destroyed.get(), 1);
    assert_eq!(rt.dom.children(link.nodes()[0]).len(), 1);
}

#[test]
fn test_remove_node_forgets_the_removed_subtree() {
    let destroyed = Rc::new(Cell::new(0));
    let counter = destroyed.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register_component(
            "card",
            DirectiveSpec::component(&[("title", "<")]).controller(move |_| {
                Ok(Tracked {
                    destroyed: counter.clone(),
                })
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div><card title="'a'"></card></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    let card = rt.dom.children(link.nodes()[0])[0];
    assert!(rt.controller(card, "card").is_some());
    assert!(rt.isolate_scope_of(card).is_some());

    rt.remove_node(card);
    assert_eq!(destroyed.get(), 1);
    assert!(rt.controller(card, "card").is_none());
    assert!(rt.isolate_scope_of(card).is_none());
    assert!(rt.controllers.is_empty());

    // Later digests and scope teardown do not reach the removed controller.
    rt.digest().unwrap();
    rt.destroy_scope(root);
    assert_eq!(destroyed.get(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEBUG INFO
// ═══════════════════════════════════════════════════════════════════════════════

fn annotated_registry() -> DirectiveRegistry {
    let mut registry = DirectiveRegistry::new();
    registry.register("boxed", DirectiveSpec::new().child_scope()).unwrap();
    registry.register("lonely", DirectiveSpec::new().isolate(&[])).unwrap();
    registry
        .register(
            "stamp",
            DirectiveSpec::new().priority(1000).terminal().transclude_element(),
        )
        .unwrap();
    registry
}

const ANNOTATED: &str = r#"<div><p boxed>{{a}}</p><i lonely></i><b stamp="items">x</b></div>"#;

#[test]
fn test_debug_info_annotates_scopes_bindings_and_anchors() {
    let config = CompileConfig {
        debug_info: true,
        ..CompileConfig::default()
    };
    let mut rt = Runtime::new(annotated_registry()).with_config(config);
    let root = rt.root_scope();
    let link = rt.compile_html(ANNOTATED).unwrap();
    link.link(&mut rt, root).unwrap();

    let div = link.nodes()[0];
    let children = rt.dom.children(div).to_vec();
    assert_eq!(children.len(), 3);
    assert!(rt.dom.has_class(div, "scope-node"));
    assert!(rt.dom.has_class(children[0], "scope-node"));
    assert!(rt.dom.has_class(children[0], "binding-node"));
    assert!(rt.dom.has_class(children[1], "isolate-scope-node"));
    assert!(!rt.dom.has_class(children[1], "scope-node"));
    assert_eq!(rt.dom.text(children[2]), Some(" stamp: items "));
}

#[test]
fn test_debug_info_off_leaves_markup_alone() {
    let mut rt = Runtime::new(annotated_registry());
    let root = rt.root_scope();
    let link = rt.compile_html(ANNOTATED).unwrap();
    link.link(&mut rt, root).unwrap();

    let div = link.nodes()[0];
    let children = rt.dom.children(div).to_vec();
    assert!(rt.dom.class_tokens(div).is_empty());
    assert!(rt.dom.class_tokens(children[0]).is_empty());
    assert!(rt.dom.class_tokens(children[1]).is_empty());
    assert_eq!(rt.dom.text(children[2]), Some(""));
}
