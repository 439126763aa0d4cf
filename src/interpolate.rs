//! `{{expr}}` interpolation in text nodes and attribute values.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::runtime::Runtime;
use crate::scope::ScopeId;

lazy_static! {
    static ref INTERPOLATION_RE: Regex = Regex::new(r"(?s)\{\{(.*?)\}\}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Part {
    Text(String),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interpolation {
    pub parts: Vec<Part>,
}

impl Interpolation {
    /// Splits `text` into literal and expression parts. `None` when the
    /// text has no interpolation markers.
    pub fn parse(text: &str) -> Option<Interpolation> {
        if !INTERPOLATION_RE.is_match(text) {
            return None;
        }
        let mut parts = Vec::new();
        let mut last = 0;
        for cap in INTERPOLATION_RE.captures_iter(text) {
            let (Some(whole), Some(expr)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(Part::Text(text[last..whole.start()].to_string()));
            }
            parts.push(Part::Expression(expr.as_str().trim().to_string()));
            last = whole.end();
        }
        if last < text.len() {
            parts.push(Part::Text(text[last..].to_string()));
        }
        Some(Interpolation { parts })
    }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Expression(e) => Some(e.as_str()),
            Part::Text(_) => None,
        })
    }

    pub fn render(&self, rt: &mut Runtime, scope: ScopeId) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Expression(e) => out.push_str(&rt.eval(scope, e)?.to_display_string()),
            }
        }
        Ok(out)
    }
}

pub fn has_interpolation(text: &str) -> bool {
    INTERPOLATION_RE.is_match(text)
}
