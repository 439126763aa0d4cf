//! Directives every registry starts with.

use crate::compiler::{CompileContext, LinkOptions};
use crate::dom::NodeId;
use crate::error::{CompileError, Result, ERR_ORPHAN};
use crate::linker::LinkContext;
use crate::registry::{DirectiveRegistry, DirectiveSpec, LinkFns};
use crate::runtime::Runtime;
use crate::scope::ScopeId;

pub(crate) fn register_builtins(registry: &mut DirectiveRegistry) {
    let transclude = DirectiveSpec::new().restrict("EAC").compile(compile_transclude);
    if let Err(err) = registry.register("transclude", transclude) {
        tracing::error!(code = %err.code, "failed to register built-in directive: {}", err.message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSCLUDE MARKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Insertion point for the content of the nearest transcluding directive.
/// Whatever the marker itself contains is fallback content, linked only
/// when nothing (or only whitespace) is transcluded into it.
fn compile_transclude(ctx: &mut CompileContext<'_>) -> Result<Option<LinkFns>> {
    let contents = ctx.rt.dom.children(ctx.node).to_vec();
    let fallback = ctx.rt.compile(&contents)?;
    ctx.rt.dom.empty(ctx.node);

    Ok(Some(LinkFns::post(move |ctx: &mut LinkContext<'_>| {
        let Some(transclude) = ctx.transclude.clone() else {
            return Err(CompileError::new(
                ERR_ORPHAN,
                &format!(
                    "Illegal use of transclude directive in the template! No parent directive that requires a transclusion found. Element: {}",
                    ctx.rt.dom.start_tag(ctx.node)
                ),
            ));
        };

        let slot = requested_slot(ctx);
        let node = ctx.node;
        let scope = ctx.scope;
        let mut blank_scope: Option<ScopeId> = None;
        transclude.transclude(
            ctx.rt,
            None,
            slot.as_deref(),
            &mut |rt: &mut Runtime, clone: &[NodeId], clone_scope: ScopeId| {
                if clone.iter().any(|n| !rt.dom.is_blank(*n)) {
                    for n in clone {
                        rt.dom.append_child(node, *n);
                    }
                } else {
                    blank_scope = Some(clone_scope);
                }
            },
        )?;

        let unfilled = slot.as_deref().is_some_and(|s| !transclude.is_slot_filled(s));
        if let Some(unused) = blank_scope {
            ctx.rt.destroy_scope(unused);
        }
        if blank_scope.is_some() || unfilled {
            tracing::trace!(slot = ?slot, "using fallback content");
            fallback.link_with(
                ctx.rt,
                scope,
                Some(&mut |rt: &mut Runtime, clone: &[NodeId], _: ScopeId| {
                    for n in clone {
                        rt.dom.append_child(node, *n);
                    }
                }),
                LinkOptions::default(),
            )?;
        }
        Ok(())
    })))
}

/// Slot named by `transclude="slot"` or `transclude-slot="slot"`. A value
/// repeating the attribute's own name (`transclude="transclude"`) is a bare
/// boolean attribute.
fn requested_slot(ctx: &LinkContext<'_>) -> Option<String> {
    let own = ctx.attr("transclude").filter(|value| {
        !value.is_empty() && ctx.attrs.dom_name("transclude").as_deref() != Some(value.as_str())
    });
    own.or_else(|| ctx.attr("transcludeSlot").filter(|value| !value.is_empty()))
}
