//! Compiler and linker errors.
//!
//! Every fatal condition carries a stable code, a human message and the
//! guarantee the compiler upholds by refusing to continue.

use serde::Serialize;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_BAD_NAME: &str = "E-BADNAME";
pub const ERR_BAD_RESTRICT: &str = "E-BADRESTRICT";
pub const ERR_BAD_BINDING: &str = "E-ISCP";
pub const ERR_BAD_REQUIRE: &str = "E-BADREQ";
pub const ERR_NO_CONTROLLER: &str = "E-NOCTRL";
pub const ERR_MULTI_DIRECTIVE: &str = "E-MULTIDIR";
pub const ERR_UNTERMINATED: &str = "E-UTERDIR";
pub const ERR_TEMPLATE_ROOT: &str = "E-TPLRT";
pub const ERR_TEMPLATE_LOAD: &str = "E-TPLOAD";
pub const ERR_CONTROLLER_REQUIRED: &str = "E-CTREQ";
pub const ERR_NON_ASSIGNABLE: &str = "E-NONASSIGN";
pub const ERR_MISSING_ATTR: &str = "E-MISSINGATTR";
pub const ERR_REQUIRED_SLOT: &str = "E-REQSLOT";
pub const ERR_NO_SLOT: &str = "E-NOSLOT";
pub const ERR_ORPHAN: &str = "E-ORPHAN";
pub const ERR_MULTI_LINK: &str = "E-MULTILINK";
pub const ERR_INFINITE_DIGEST: &str = "E-INFDIG";
pub const ERR_INFINITE_CHANGES: &str = "E-INFCHNG";
pub const ERR_EXPRESSION: &str = "E-EXPR";
pub const ERR_PARSE: &str = "E-PARSE";
pub const ERR_HOOK: &str = "E-HOOK";

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_BAD_NAME => "Directive names are lower-camel-case identifiers.",
        ERR_BAD_RESTRICT => "Restrictions only use the letters E, A, C and M.",
        ERR_BAD_BINDING => "Bindings use one of the @, =, <, & modes.",
        ERR_BAD_REQUIRE => "Require entries name a directive controller.",
        ERR_NO_CONTROLLER => "Bound controller properties need a controller.",
        ERR_MULTI_DIRECTIVE => {
            "A node has at most one template, one transclusion and one new or isolated scope."
        }
        ERR_UNTERMINATED => "Every multi-element range has a matching end marker.",
        ERR_TEMPLATE_ROOT => "Replacing templates have exactly one root element.",
        ERR_TEMPLATE_LOAD => "Remote templates are linked only once they load.",
        ERR_CONTROLLER_REQUIRED => "Required controllers exist before they are used.",
        ERR_NON_ASSIGNABLE => "Two-way bindings only write to assignable expressions.",
        ERR_MISSING_ATTR => "Strict bindings are always backed by an attribute.",
        ERR_REQUIRED_SLOT => "Required transclusion slots receive content.",
        ERR_NO_SLOT => "Transclusion slots are declared before they are used.",
        ERR_ORPHAN => "Transclusion markers live inside a transcluding directive.",
        ERR_MULTI_LINK => "A tree node is linked at most once.",
        ERR_INFINITE_DIGEST => "Watchers stabilize within the digest ceiling.",
        ERR_INFINITE_CHANGES => "Change notifications stabilize within the configured ceiling.",
        ERR_EXPRESSION => "Binding expressions parse and evaluate.",
        ERR_PARSE => "Templates are well-formed markup.",
        ERR_HOOK => "Hook failures are isolated to the hook that raised them.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Error, PartialEq)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct CompileError {
    pub code: String,
    pub message: String,
    pub guarantee: String,
    /// Serialized start tag of the offending node, when there is one.
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompileError {
    pub fn new(code: &str, message: &str) -> Self {
        Self::with_details(code, message, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompileError {
            code: code.to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            context,
            hints,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Error raised from inside a user hook.
    pub fn hook(message: impl Into<String>) -> Self {
        Self::new(ERR_HOOK, &message.into())
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = CompileError::new(ERR_TEMPLATE_ROOT, "Template must have exactly one root element.");
        assert_eq!(
            err.to_string(),
            "[E-TPLRT] Template must have exactly one root element."
        );
        assert_eq!(err.guarantee, "Replacing templates have exactly one root element.");
    }

    #[test]
    fn test_context_and_hints() {
        let err = CompileError::new(ERR_MULTI_DIRECTIVE, "conflict")
            .with_context("<div a b>")
            .with_hint("remove one");
        assert!(err.is(ERR_MULTI_DIRECTIVE));
        assert_eq!(err.context.as_deref(), Some("<div a b>"));
        assert_eq!(err.hints, vec!["remove one".to_string()]);
    }
}
