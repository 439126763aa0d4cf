//! Transclusion: moving a directive's original content (or the whole
//! element) aside at compile time and re-instantiating it on demand.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::compiler::{LinkFunction, LinkOptions};
use crate::dom::NodeId;
use crate::error::{CompileError, Result, ERR_NO_SLOT};
use crate::runtime::Runtime;
use crate::scope::ScopeId;

/// Compiled content set aside by a transcluding directive.
pub(crate) struct TranscludePlan {
    pub(crate) default: LinkFunction,
    /// Declared slots; `None` when nothing matched an optional slot.
    pub(crate) slots: BTreeMap<String, Option<LinkFunction>>,
}

impl TranscludePlan {
    pub(crate) fn new(default: LinkFunction) -> Self {
        Self {
            default,
            slots: BTreeMap::new(),
        }
    }
}

/// A plan bound to the scope it was captured in.
struct BoundTransclude {
    scope: ScopeId,
    plan: Rc<TranscludePlan>,
    parent: Option<TranscludeFn>,
}

/// Callable handed to link functions of transcluding directives.
#[derive(Clone)]
pub struct TranscludeFn {
    bound: Rc<BoundTransclude>,
    /// Scope whose destruction also destroys default transclusion scopes.
    containing: Option<ScopeId>,
}

impl TranscludeFn {
    pub(crate) fn bind(scope: ScopeId, plan: Rc<TranscludePlan>, parent: Option<TranscludeFn>) -> Self {
        Self {
            bound: Rc::new(BoundTransclude {
                scope,
                plan,
                parent,
            }),
            containing: None,
        }
    }

    pub(crate) fn with_containing(&self, scope: ScopeId) -> Self {
        Self {
            bound: self.bound.clone(),
            containing: Some(scope),
        }
    }

    /// Scope the transcluded content inherits from by default.
    pub fn captured_scope(&self) -> ScopeId {
        self.bound.scope
    }

    /// Clones and links the transcluded content.
    ///
    /// Without an explicit `scope`, a fresh child of the captured scope is
    /// created; it is destroyed with the containing directive's scope and
    /// with the clone's root nodes. `attach` receives the clone before it is
    /// linked. An optional slot that was never filled yields no nodes.
    pub fn transclude(
        &self,
        rt: &mut Runtime,
        scope: Option<ScopeId>,
        slot: Option<&str>,
        attach: &mut dyn FnMut(&mut Runtime, &[NodeId], ScopeId),
    ) -> Result<Vec<NodeId>> {
        let link = match slot {
            None => self.bound.plan.default.clone(),
            Some(name) => match self.bound.plan.slots.get(name) {
                Some(Some(link)) => link.clone(),
                Some(None) => return Ok(Vec::new()),
                None => {
                    return Err(CompileError::new(
                        ERR_NO_SLOT,
                        &format!(
                            "No parent directive that requires a transclusion with slot name \"{}\".",
                            name
                        ),
                    ))
                }
            },
        };

        let (scope, owned) = match scope {
            Some(s) => (s, false),
            None => {
                let s = rt.scopes.new_child(self.bound.scope, false);
                if let Some(containing) = self.containing {
                    rt.scopes
                        .on_destroy(containing, Box::new(move |rt: &mut Runtime| rt.destroy_scope(s)));
                }
                (s, true)
            }
        };

        let options = LinkOptions {
            parent_bound_transclude: self.bound.parent.clone(),
        };
        let nodes = link.link_with(
            rt,
            scope,
            Some(&mut |rt: &mut Runtime, clone: &[NodeId], scope: ScopeId| {
                if owned {
                    for node in clone {
                        rt.own_scope(*node, scope);
                    }
                }
                attach(rt, clone, scope);
            }),
            options,
        )?;
        Ok(nodes)
    }

    /// True when `name` is a declared slot that received content.
    pub fn is_slot_filled(&self, name: &str) -> bool {
        matches!(self.bound.plan.slots.get(name), Some(Some(_)))
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.bound.plan.slots.contains_key(name)
    }
}

impl std::fmt::Debug for TranscludeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscludeFn")
            .field("scope", &self.bound.scope)
            .field("slots", &self.bound.plan.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
