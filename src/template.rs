//! Template loading.
//!
//! URL templates are fetched through a `TemplateSource`. Parsed markup is
//! cached by content hash so repeated use of one template only parses it
//! once; callers always receive fresh copies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::attributes::AttrSnapshot;
use crate::dom::{Dom, NodeId, NodeKind};
use crate::error::{CompileError, Result, ERR_TEMPLATE_ROOT};
use crate::runtime::Runtime;

/// Resolves a template URL to markup. Errors are human-readable reasons.
pub trait TemplateSource {
    fn fetch(&self, url: &str) -> std::result::Result<String, String>;
}

/// In-memory URL -> markup table.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: RefCell<HashMap<String, String>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, url: &str, html: &str) {
        self.entries
            .borrow_mut()
            .insert(url.to_string(), html.to_string());
    }

    pub fn get(&self, url: &str) -> Option<String> {
        self.entries.borrow().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl TemplateSource for TemplateCache {
    fn fetch(&self, url: &str) -> std::result::Result<String, String> {
        self.get(url).ok_or_else(|| format!("no template registered for '{}'", url))
    }
}

/// Serves `*.html` files below a directory. URLs are paths relative to the
/// root, with `/` separators.
#[derive(Debug, Clone)]
pub struct DirectoryTemplateSource {
    root: PathBuf,
}

impl DirectoryTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// URLs of every template under the root.
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "html"))
            .filter_map(|e| relative_url(&self.root, e.path()))
            .collect();
        urls.sort();
        urls
    }

    /// Loads every template into a cache.
    pub fn preload(&self, cache: &TemplateCache) -> std::io::Result<usize> {
        let urls = self.urls();
        for url in &urls {
            let html = std::fs::read_to_string(self.root.join(url))?;
            cache.put(url, &html);
        }
        tracing::debug!(root = %self.root.display(), count = urls.len(), "preloaded templates");
        Ok(urls.len())
    }
}

fn relative_url(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

impl TemplateSource for DirectoryTemplateSource {
    fn fetch(&self, url: &str) -> std::result::Result<String, String> {
        let rel = url.trim_start_matches('/');
        if rel.split('/').any(|part| part == "..") {
            return Err(format!("template url '{}' escapes the template root", url));
        }
        let path = self.root.join(rel);
        std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path.display(), e))
    }
}

/// Consults a cache first and stores whatever the inner source returns.
pub struct CachedTemplateSource<S> {
    cache: TemplateCache,
    inner: S,
}

impl<S: TemplateSource> CachedTemplateSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            cache: TemplateCache::new(),
            inner,
        }
    }

    pub fn cache(&self) -> &TemplateCache {
        &self.cache
    }
}

impl<S: TemplateSource> TemplateSource for CachedTemplateSource<S> {
    fn fetch(&self, url: &str) -> std::result::Result<String, String> {
        if let Some(html) = self.cache.get(url) {
            return Ok(html);
        }
        let html = self.inner.fetch(url)?;
        self.cache.put(url, &html);
        Ok(html)
    }
}

impl<S: TemplateSource + ?Sized> TemplateSource for Rc<S> {
    fn fetch(&self, url: &str) -> std::result::Result<String, String> {
        (**self).fetch(url)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSED TEMPLATE CACHE
// ═══════════════════════════════════════════════════════════════════════════════

fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Detached prototype trees keyed by the SHA-256 of their markup.
#[derive(Debug, Default)]
pub(crate) struct ParsedTemplateCache {
    prototypes: HashMap<String, Vec<NodeId>>,
}

impl Runtime {
    /// Fresh, detached nodes for `html`.
    pub(crate) fn template_nodes(&mut self, html: &str) -> Result<Vec<NodeId>> {
        let key = content_hash(html);
        let prototypes = match self.parsed_templates.prototypes.get(&key) {
            Some(p) => p.clone(),
            None => {
                let parsed = self.dom.parse_html(html)?;
                tracing::trace!(hash = %key, roots = parsed.len(), "parsed template");
                self.parsed_templates.prototypes.insert(key, parsed.clone());
                parsed
            }
        };
        Ok(prototypes
            .into_iter()
            .map(|n| self.dom.clone_subtree(n))
            .collect())
    }
}

/// The single element a replacing template must consist of. Comments and
/// whitespace around it are ignored.
pub(crate) fn single_root(
    dom: &Dom,
    nodes: &[NodeId],
    directive: &str,
    url: Option<&str>,
) -> Result<NodeId> {
    let significant: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|n| !dom.is_blank(*n))
        .collect();
    match significant.as_slice() {
        [root] if dom.kind(*root) == NodeKind::Element => Ok(*root),
        _ => Err(CompileError::new(
            ERR_TEMPLATE_ROOT,
            &format!(
                "Template for directive '{}' must have exactly one root element. {}",
                directive,
                url.unwrap_or_default()
            ),
        )),
    }
}

/// Folds the replaced node's attributes into the template root. Template
/// values come first: classes are unioned, styles are joined with `;`, and
/// other attributes are concatenated with a space.
pub(crate) fn merge_template_attributes(
    dom: &mut Dom,
    node: NodeId,
    dst: &mut AttrSnapshot,
    src: &AttrSnapshot,
) {
    let original: Vec<(String, String)> = dst
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (key, value) in &original {
        if key.starts_with('$') {
            continue;
        }
        // Class and comment directive values have no markup attribute.
        let Some(dom_name) = dst.dom_name(key).map(str::to_string) else {
            continue;
        };
        let merged = match src.get(key) {
            Some(template_value) if template_value != value => match key.as_str() {
                "class" => merge_classes(template_value, value),
                "style" => merge_styles(template_value, value),
                _ => join_nonempty(template_value, value, " "),
            },
            _ => value.clone(),
        };
        dst.set(dom, node, key, Some(&merged), Some(&dom_name));
    }

    for (key, value) in src.iter() {
        if dst.has(key) || key.starts_with('$') {
            continue;
        }
        match key {
            // Already present on the template root itself.
            "class" | "style" => dst.insert_value(key, value),
            _ => {
                let dom_name = src.dom_name(key).unwrap_or(key).to_string();
                dst.insert(key, &dom_name, value);
            }
        }
    }
}

fn merge_classes(template: &str, original: &str) -> String {
    let mut tokens: Vec<&str> = template.split_whitespace().collect();
    for token in original.split_whitespace() {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens.join(" ")
}

fn merge_styles(template: &str, original: &str) -> String {
    let template = template.trim().trim_end_matches(';');
    let original = original.trim();
    join_nonempty(template, original, "; ")
}

fn join_nonempty(a: &str, b: &str, sep: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}{}{}", a, sep, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DirectiveRegistry;

    #[test]
    fn test_template_cache_source() {
        let cache = TemplateCache::new();
        cache.put("a.html", "<p>a</p>");
        assert_eq!(cache.fetch("a.html").unwrap(), "<p>a</p>");
        assert!(cache.fetch("b.html").unwrap_err().contains("b.html"));
    }

    #[test]
    fn test_directory_source_and_caching() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("widgets")).unwrap();
        std::fs::write(dir.path().join("widgets/card.html"), "<div>card</div>").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = DirectoryTemplateSource::new(dir.path());
        assert_eq!(source.urls(), vec!["widgets/card.html".to_string()]);
        assert!(source.fetch("../etc/passwd").is_err());

        let cached = CachedTemplateSource::new(source);
        assert_eq!(cached.fetch("widgets/card.html").unwrap(), "<div>card</div>");
        std::fs::remove_file(dir.path().join("widgets/card.html")).unwrap();
        assert_eq!(cached.fetch("widgets/card.html").unwrap(), "<div>card</div>");
        assert_eq!(cached.cache().len(), 1);
    }

    #[test]
    fn test_preload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), "<b></b>").unwrap();
        let cache = TemplateCache::new();
        let count = DirectoryTemplateSource::new(dir.path()).preload(&cache).unwrap();
        assert_eq!(count, 1);
        assert_eq!(cache.get("a.html").as_deref(), Some("<b></b>"));
    }

    #[test]
    fn test_template_nodes_are_fresh_copies() {
        let mut rt = Runtime::new(DirectiveRegistry::new());
        let first = rt.template_nodes("<span>x</span>").unwrap();
        let second = rt.template_nodes("<span>x</span>").unwrap();
        assert_ne!(first, second);
        assert_eq!(rt.dom.outer_html(second[0]), "<span>x</span>");
    }

    #[test]
    fn test_single_root() {
        let mut dom = Dom::new();
        let ok = dom.parse_html("<!-- c --> <div></div> ").unwrap();
        assert!(single_root(&dom, &ok, "d", None).is_ok());
        let two = dom.parse_html("<div></div><div></div>").unwrap();
        let err = single_root(&dom, &two, "d", Some("t.html")).unwrap_err();
        assert_eq!(err.code, ERR_TEMPLATE_ROOT);
        assert!(err.message.ends_with("t.html"));
        let text = dom.parse_html("just text").unwrap();
        assert!(single_root(&dom, &text, "d", None).is_err());
    }

    #[test]
    fn test_merge_rules() {
        assert_eq!(merge_classes("a b", "b c"), "a b c");
        assert_eq!(merge_styles("width: 1px;", "color: red"), "width: 1px; color: red");
        assert_eq!(merge_styles("", "color: red"), "color: red");
        assert_eq!(join_nonempty("x", "", " "), "x");
    }

    #[test]
    fn test_merge_template_attributes() {
        let mut dom = Dom::new();
        let root = dom.create_element("div");
        dom.set_attr(root, "class", "tpl");
        dom.set_attr(root, "title", "t");
        let mut dst = AttrSnapshot::default();
        dst.insert("class", "class", "orig");
        dst.insert("id", "id", "main");
        dst.insert("title", "title", "o");
        let mut src = AttrSnapshot::default();
        src.insert("class", "class", "tpl");
        src.insert("title", "title", "t");
        src.insert("role", "role", "button");

        merge_template_attributes(&mut dom, root, &mut dst, &src);
        assert_eq!(dst.get("class"), Some("tpl orig"));
        assert_eq!(dom.attr(root, "class"), Some("tpl orig"));
        assert_eq!(dst.get("title"), Some("t o"));
        assert_eq!(dst.get("role"), Some("button"));
        assert_eq!(dst.get("id"), Some("main"));
        assert_eq!(dom.attr(root, "id"), Some("main"));
    }
}
