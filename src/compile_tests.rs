//! Compile-phase behavior: directive ordering, terminal directives, template
//! replacement and structural conflicts.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{ERR_MULTI_DIRECTIVE, ERR_TEMPLATE_ROOT, ERR_UNTERMINATED};
use crate::linker::LinkContext;
use crate::registry::{DirectiveRegistry, DirectiveSpec};
use crate::runtime::Runtime;

type Log = Rc<RefCell<Vec<String>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Post-link that records the directive's attribute value, or `fallback`.
fn logger(log: &Log, name: &'static str, fallback: &'static str) -> impl Fn(&mut LinkContext<'_>) -> crate::error::Result<()> {
    let log = log.clone();
    move |ctx: &mut LinkContext<'_>| {
        let value = ctx.attr(name).filter(|v| !v.is_empty());
        log.borrow_mut().push(value.unwrap_or_else(|| fallback.to_string()));
        Ok(())
    }
}

fn log_registry(log: &Log) -> DirectiveRegistry {
    let mut registry = DirectiveRegistry::with_builtins();
    registry
        .register("log", DirectiveSpec::new().restrict("CAM").link(logger(log, "log", "LOG")))
        .unwrap();
    registry
        .register(
            "highLog",
            DirectiveSpec::new()
                .restrict("CAM")
                .priority(3)
                .link(logger(log, "highLog", "HIGH")),
        )
        .unwrap();
    registry
        .register(
            "logMedium",
            DirectiveSpec::new()
                .restrict("CAM")
                .priority(2)
                .link(logger(log, "logMedium", "MEDIUM")),
        )
        .unwrap();
    registry
}

#[test]
fn test_post_links_run_in_reverse_priority_order() {
    let log = new_log();
    let mut rt = Runtime::new(log_registry(&log));
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div log="L" high-log log-medium="M"></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    assert_eq!(log.borrow().join("; "), "L; M; HIGH");

    // Identical markup compiles to the identical order.
    log.borrow_mut().clear();
    let again = rt
        .compile_html(r#"<div log="L" high-log log-medium="M"></div>"#)
        .unwrap();
    again.link(&mut rt, root).unwrap();
    assert_eq!(log.borrow().join("; "), "L; M; HIGH");
}

#[test]
fn test_class_and_comment_directives() {
    let log = new_log();
    let mut rt = Runtime::new(log_registry(&log));
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div><span class="log: from-class"></span><!-- directive: log from-comment --></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    assert_eq!(*log.borrow(), vec!["from-class", "from-comment"]);
}

#[test]
fn test_disabled_comment_directives_are_ignored() {
    let log = new_log();
    let config = crate::config::CompileConfig {
        comment_directives: false,
        class_directives: false,
        ..Default::default()
    };
    let mut rt = Runtime::new(log_registry(&log)).with_config(config);
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div><span class="log"></span><!-- directive: log x --><i log></i></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    assert_eq!(*log.borrow(), vec!["LOG"]);
}

#[test]
fn test_terminal_stops_lower_priorities_and_children() {
    let log = new_log();
    let mut registry = log_registry(&log);
    registry
        .register("stop", DirectiveSpec::new().priority(2).terminal())
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div stop high-log log-medium="M" log="L"><span log="child"></span></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    // Same priority as the terminal directive still runs.
    assert_eq!(*log.borrow(), vec!["M", "HIGH"]);

    let plan = link.plan();
    assert!(plan.nodes[0].terminal);
    assert!(plan.nodes[0].children.is_empty());
}

#[test]
fn test_two_scope_requests_are_rejected_regardless_of_priority() {
    for (child_priority, isolate_priority) in [(1, 2), (2, 1)] {
        let mut registry = DirectiveRegistry::new();
        registry
            .register("childScope", DirectiveSpec::new().priority(child_priority).child_scope())
            .unwrap();
        registry
            .register("isoScope", DirectiveSpec::new().priority(isolate_priority).isolate(&[]))
            .unwrap();
        let mut rt = Runtime::new(registry);
        let err = rt
            .compile_html(r#"<div child-scope iso-scope></div>"#)
            .err()
            .unwrap();
        assert_eq!(err.code, ERR_MULTI_DIRECTIVE);
        assert!(err.message.contains("childScope"));
        assert!(err.message.contains("isoScope"));
        assert_eq!(err.context.as_deref(), Some("<div child-scope iso-scope>"));
    }
}

#[test]
fn test_two_child_scopes_are_rejected_with_module_names() {
    let mut registry = DirectiveRegistry::new();
    registry.set_module(Some("app"));
    registry.register("first", DirectiveSpec::new().child_scope()).unwrap();
    registry.register("second", DirectiveSpec::new().child_scope()).unwrap();
    let mut rt = Runtime::new(registry);
    let err = rt.compile_html("<div first second></div>").err().unwrap();
    assert_eq!(err.code, ERR_MULTI_DIRECTIVE);
    assert!(err
        .message
        .starts_with("Multiple directives [first (module: app), second (module: app)] asking for new/isolated scope"));
}

#[test]
fn test_two_transclusions_are_rejected() {
    let mut registry = DirectiveRegistry::new();
    registry.register("one", DirectiveSpec::new().transclude()).unwrap();
    registry.register("two", DirectiveSpec::new().transclude_element()).unwrap();
    let mut rt = Runtime::new(registry);
    let err = rt.compile_html("<div one two>x</div>").err().unwrap();
    assert_eq!(err.code, ERR_MULTI_DIRECTIVE);
    assert!(err.message.contains("asking for transclusion"));
}

#[test]
fn test_replace_merges_class_and_style() {
    let log = new_log();
    let mut registry = log_registry(&log);
    registry
        .register(
            "replace",
            DirectiveSpec::new()
                .replace()
                .template(r#"<div class="log" style="width:10px"></div>"#),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div replace class="medium-log" style="height:20px" id="x"></div>"#)
        .unwrap();
    let node = link.nodes()[0];
    let mut classes = rt.dom.class_tokens(node);
    classes.sort();
    assert_eq!(classes, vec!["log", "medium-log"]);
    assert_eq!(rt.dom.attr(node, "style"), Some("width:10px; height:20px"));
    assert_eq!(rt.dom.attr(node, "id"), Some("x"));

    // The class directive on the template root is applied to the new node.
    link.link(&mut rt, root).unwrap();
    assert_eq!(*log.borrow(), vec!["LOG"]);
}

#[test]
fn test_replace_template_needs_one_root() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register("twoRoots", DirectiveSpec::new().replace().template("<b></b><i></i>"))
        .unwrap();
    registry
        .register("textRoot", DirectiveSpec::new().replace().template("just text"))
        .unwrap();
    registry
        .register(
            "spaced",
            DirectiveSpec::new().replace().template("  <p>ok</p> <!-- c -->  "),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    for html in ["<div two-roots></div>", "<div text-root></div>"] {
        let err = rt.compile_html(html).err().unwrap();
        assert_eq!(err.code, ERR_TEMPLATE_ROOT, "{}", html);
    }
    let link = rt.compile_html("<div spaced></div>").unwrap();
    assert_eq!(rt.dom.tag(link.nodes()[0]), Some("p"));
}

#[test]
fn test_template_without_replace_fills_contents() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register("greeting", DirectiveSpec::new().template("<b>{{who}}</b>"))
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    rt.scopes.set(root, "who", "world");
    let link = rt.compile_html("<p greeting>old</p>").unwrap();
    link.link(&mut rt, root).unwrap();
    rt.digest().unwrap();
    assert_eq!(rt.dom.outer_html(link.nodes()[0]), "<p greeting><b>world</b></p>");
}

#[test]
fn test_dynamic_template_sees_attributes() {
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "heading",
            DirectiveSpec::new().template_fn(|_, _, attrs| {
                format!("<h{0}>title</h{0}>", attrs.get("level").unwrap_or("1"))
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let link = rt.compile_html(r#"<div heading level="3"></div>"#).unwrap();
    assert_eq!(rt.dom.inner_html(link.nodes()[0]), "<h3>title</h3>");
}

#[test]
fn test_multi_element_range() {
    let groups = Rc::new(RefCell::new(Vec::new()));
    let seen = groups.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "group",
            DirectiveSpec::new().multi_element().link(move |ctx| {
                seen.borrow_mut().push(ctx.group.len());
                Ok(())
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt
        .compile_html(r#"<div><p group-start></p><i></i><p group-end></p></div>"#)
        .unwrap();
    link.link(&mut rt, root).unwrap();
    assert_eq!(*groups.borrow(), vec![3]);

    let err = rt
        .compile_html(r#"<div><p group-start></p><i></i></div>"#)
        .err()
        .unwrap();
    assert_eq!(err.code, ERR_UNTERMINATED);
    assert!(err.message.contains("group-start"));
    assert!(err.message.contains("group-end"));
}

#[test]
fn test_compile_callback_can_rewrite_attributes_and_links() {
    let log = new_log();
    let sink = log.clone();
    let mut registry = DirectiveRegistry::new();
    registry
        .register(
            "stamp",
            DirectiveSpec::new().compile(move |ctx| {
                ctx.set_attr("stamped", Some("yes"));
                let sink = sink.clone();
                Ok(Some(crate::registry::LinkFns::post(move |ctx| {
                    sink.borrow_mut().push(ctx.attr("stamped").unwrap_or_default());
                    Ok(())
                })))
            }),
        )
        .unwrap();
    let mut rt = Runtime::new(registry);
    let root = rt.root_scope();
    let link = rt.compile_html("<div stamp></div>").unwrap();
    assert_eq!(rt.dom.attr(link.nodes()[0], "stamped"), Some("yes"));
    link.link(&mut rt, root).unwrap();
    assert_eq!(*log.borrow(), vec!["yes"]);
}
