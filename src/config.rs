//! Process-wide compiler switches.
//!
//! A `CompileConfig` is handed to the `Runtime` once; it is never mutated
//! afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result, ERR_PARSE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileConfig {
    /// Match `<!-- directive: name expr -->` comments.
    pub comment_directives: bool,
    /// Match class-list tokens against directive names.
    pub class_directives: bool,
    /// Annotate linked nodes with scope classes and transclusion comments.
    pub debug_info: bool,
    /// Assign bound controller properties before the controller constructor runs.
    pub pre_assign_bindings: bool,
    /// Missing attributes for non-optional bindings are fatal.
    pub strict_bindings: bool,
    /// Maximum re-deliveries of change notifications per digest.
    pub on_changes_ttl: u32,
    /// Maximum dirty-checking passes per digest.
    pub digest_ttl: u32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            comment_directives: true,
            class_directives: true,
            debug_info: false,
            pre_assign_bindings: false,
            strict_bindings: false,
            on_changes_ttl: 10,
            digest_ttl: 10,
        }
    }
}

impl CompileConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            CompileError::new(ERR_PARSE, &format!("Failed to parse compiler config: {}", e))
        })
    }
}
