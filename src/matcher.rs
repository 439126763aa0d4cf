//! Finding the directives that apply to a node.

use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::attributes::AttrSnapshot;
use crate::config::CompileConfig;
use crate::dom::{Dom, NodeId, NodeKind};
use crate::error::{CompileError, Result, ERR_UNTERMINATED};
use crate::registry::{DirectiveDefinition, DirectiveRegistry, Restrict};

lazy_static! {
    static ref PREFIX_RE: Regex = Regex::new(r"(?i)^(?:x|data)[:\-_]").unwrap();
    static ref SPECIAL_CHARS_RE: Regex = Regex::new(r"[:\-_]+(.)").unwrap();
    static ref CLASS_DIRECTIVE_RE: Regex = Regex::new(r"(([\w-]+)(?::([^;]+))?;?)").unwrap();
    static ref COMMENT_DIRECTIVE_RE: Regex = Regex::new(r"^\s*directive:\s*([\w-]+)\s+(.*)$").unwrap();
}

/// Converts a markup name (`data-my-dir`, `x:my_dir`) into the registered
/// lower-camel-case form (`myDir`).
pub fn directive_normalize(name: &str) -> String {
    let stripped = PREFIX_RE.replace(name, "");
    SPECIAL_CHARS_RE
        .replace_all(&stripped, |caps: &regex::Captures<'_>| caps[1].to_uppercase())
        .into_owned()
}

/// A directive matched on a node.
#[derive(Debug, Clone)]
pub struct Matched {
    pub def: Rc<DirectiveDefinition>,
    /// `(start, end)` attribute names for multi-element directives.
    pub range: Option<(String, String)>,
    /// Links against the node's isolate scope rather than the outer one.
    pub isolate_scope: bool,
}

impl Matched {
    pub fn new(def: Rc<DirectiveDefinition>) -> Self {
        Self {
            def,
            range: None,
            isolate_scope: false,
        }
    }
}

pub struct MatchOptions<'a> {
    /// Only directives with a priority strictly below this one match.
    pub max_priority: Option<i32>,
    /// Directive name to skip entirely.
    pub ignore: Option<&'a str>,
}

impl MatchOptions<'_> {
    pub const ALL: MatchOptions<'static> = MatchOptions {
        max_priority: None,
        ignore: None,
    };
}

fn add_directive(
    registry: &DirectiveRegistry,
    out: &mut Vec<Matched>,
    name: &str,
    location: Restrict,
    options: &MatchOptions<'_>,
    range: Option<(String, String)>,
) -> bool {
    if options.ignore == Some(name) {
        return false;
    }
    let mut matched = false;
    for def in registry.lookup(name) {
        let below_max = options.max_priority.map_or(true, |max| max > def.priority);
        if below_max && def.restrict.allows(location) {
            out.push(Matched {
                def: def.clone(),
                range: range.clone(),
                isolate_scope: false,
            });
            matched = true;
        }
    }
    matched
}

fn is_multi_element(registry: &DirectiveRegistry, name: &str) -> bool {
    registry.lookup(name).iter().any(|d| d.multi_element)
}

/// Splits a range-start attribute name into its stem and the matching end
/// suffix: `repeat-start` gives `("repeat", "-end")`.
fn split_range_start(name: &str) -> Option<(&str, &'static str)> {
    const SUFFIXES: [(&str, &str); 4] = [
        ("-start", "-end"),
        ("_start", "_end"),
        (":start", ":end"),
        ("Start", "End"),
    ];
    SUFFIXES.iter().find_map(|(start, end)| {
        name.strip_suffix(start)
            .filter(|stem| !stem.is_empty())
            .map(|stem| (stem, *end))
    })
}

/// Collects the directives for `node` in application order and fills
/// `attrs` with the node's normalized attributes.
pub fn collect_directives(
    registry: &DirectiveRegistry,
    dom: &Dom,
    config: &CompileConfig,
    node: NodeId,
    attrs: &mut AttrSnapshot,
    options: &MatchOptions<'_>,
) -> Vec<Matched> {
    let mut out = Vec::new();
    match dom.kind(node) {
        NodeKind::Element => {
            if let Some(tag) = dom.tag(node) {
                add_directive(
                    registry,
                    &mut out,
                    &directive_normalize(tag),
                    Restrict::ELEMENT,
                    options,
                    None,
                );
            }

            for attr in dom.attrs(node) {
                let mut name = attr.name.clone();
                let mut range = None;
                let normalized = directive_normalize(&name);
                if let Some(base) = normalized.strip_suffix("Start") {
                    if !base.is_empty() && is_multi_element(registry, base) {
                        if let Some((stem, end)) = split_range_start(&name) {
                            range = Some((name.clone(), format!("{}{}", stem, end)));
                            name = stem.to_string();
                        }
                    }
                }
                let normalized = directive_normalize(&name.to_lowercase());
                attrs.insert(&normalized, &name, &attr.value);
                add_directive(registry, &mut out, &normalized, Restrict::ATTRIBUTE, options, range);
            }

            if config.class_directives {
                if let Some(class) = dom.attr(node, "class") {
                    for caps in CLASS_DIRECTIVE_RE.captures_iter(class) {
                        let Some(token) = caps.get(2) else { continue };
                        let normalized = directive_normalize(token.as_str());
                        if add_directive(registry, &mut out, &normalized, Restrict::CLASS, options, None) {
                            let value = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
                            attrs.insert_value(&normalized, value);
                        }
                    }
                }
            }
        }
        NodeKind::Comment => {
            if config.comment_directives {
                let text = dom.text(node).unwrap_or_default();
                if let Some(caps) = COMMENT_DIRECTIVE_RE.captures(text) {
                    let normalized = directive_normalize(&caps[1]);
                    if add_directive(registry, &mut out, &normalized, Restrict::COMMENT, options, None) {
                        attrs.insert_value(&normalized, caps[2].trim());
                    }
                }
            }
        }
        NodeKind::Text => {}
    }
    // Stable: equal priorities keep discovery order, then registration order.
    out.sort_by(|a, b| b.def.priority.cmp(&a.def.priority));
    out
}

/// Nodes covered by a multi-element directive starting at `node`.
pub fn group_scan(dom: &Dom, node: NodeId, range: Option<&(String, String)>) -> Result<Vec<NodeId>> {
    let Some((start, end)) = range else {
        return Ok(vec![node]);
    };
    if dom.attr(node, start).is_none() {
        return Ok(vec![node]);
    }
    let mut nodes = Vec::new();
    let mut depth = 0i32;
    let mut current = Some(node);
    loop {
        let Some(id) = current else {
            return Err(CompileError::new(
                ERR_UNTERMINATED,
                &format!(
                    "Unterminated attribute, found '{}' but no matching '{}' found.",
                    start, end
                ),
            )
            .with_context(dom.start_tag(node)));
        };
        if dom.is_element(id) {
            if dom.attr(id, start).is_some() {
                depth += 1;
            }
            if dom.attr(id, end).is_some() {
                depth -= 1;
            }
        }
        nodes.push(id);
        current = dom.next_sibling(id);
        if depth <= 0 {
            break;
        }
    }
    Ok(nodes)
}
