//! Dirty checking.
//!
//! A digest drains the async queue and evaluates every watcher of every live
//! scope (parents first) until nothing changes. Binding changes recorded on
//! the way are then delivered to `on_changes`, which may dirty the model
//! again; that outer loop is bounded by `on_changes_ttl`.

use crate::controller::{ControllerId, Hook, SimpleChange};
use crate::error::{CompileError, Result, ERR_INFINITE_CHANGES, ERR_INFINITE_DIGEST};
use crate::runtime::Runtime;
use crate::scope::WatchSource;
use crate::value::Value;

impl Runtime {
    pub fn digest(&mut self) -> Result<()> {
        let mut rounds = 0;
        loop {
            self.digest_watchers()?;
            if self.pending_changes.is_empty() {
                return Ok(());
            }
            rounds += 1;
            if rounds >= self.config.on_changes_ttl {
                self.pending_changes.clear();
                return Err(CompileError::new(
                    ERR_INFINITE_CHANGES,
                    &format!(
                        "{} on_changes() iterations reached. Aborting!",
                        self.config.on_changes_ttl
                    ),
                ));
            }
            self.flush_changes();
        }
    }

    fn digest_watchers(&mut self) -> Result<()> {
        let mut ttl = self.config.digest_ttl;
        loop {
            while let Some(task) = self.async_queue.pop_front() {
                if let Err(err) = task(self) {
                    self.report(&err);
                }
            }

            let mut dirty = false;
            let root = self.scopes.root();
            for scope in self.scopes.walk(root) {
                for watch_id in self.scopes.watcher_ids(scope) {
                    if self.scopes.is_destroyed(scope) {
                        break;
                    }
                    if self.run_watcher(scope, watch_id) {
                        dirty = true;
                    }
                }
                let checks = if self.scopes.is_destroyed(scope) {
                    Vec::new()
                } else {
                    self.scopes.scope(scope).check_hooks.clone()
                };
                for controller in checks {
                    self.call_hook(controller, Hook::Check);
                }
            }

            if !dirty && self.async_queue.is_empty() {
                return Ok(());
            }
            ttl = ttl.saturating_sub(1);
            if ttl == 0 {
                return Err(CompileError::new(
                    ERR_INFINITE_DIGEST,
                    &format!(
                        "{} digest() iterations reached. Aborting!",
                        self.config.digest_ttl
                    ),
                ));
            }
        }
    }

    /// Evaluates one watcher; true when its value changed.
    fn run_watcher(&mut self, scope: crate::scope::ScopeId, watch_id: u64) -> bool {
        let Some(watcher) = self.scopes.watcher(scope, watch_id) else {
            return false;
        };
        let source = watcher.source.clone();
        let listener = watcher.listener.clone();
        let last = watcher.last.clone();

        let value = match source {
            WatchSource::Expression(expr) => self.eval(scope, &expr),
            WatchSource::Native(f) => f(self, scope),
        };
        let value = match value {
            Ok(v) => v,
            Err(err) => {
                self.report(&err);
                return false;
            }
        };
        if last.as_ref() == Some(&value) {
            return false;
        }
        if let Some(w) = self.scopes.watcher_mut(scope, watch_id) {
            w.last = Some(value.clone());
        }
        if let Some(listener) = listener {
            if let Err(err) = listener(self, &value, last.as_ref()) {
                self.report(&err);
            }
        }
        true
    }

    /// Queues a binding change for `controller`. Several changes of one
    /// property within a digest keep the first previous value.
    pub(crate) fn record_change(
        &mut self,
        controller: ControllerId,
        key: &str,
        current: Value,
        previous: Value,
    ) {
        if current == previous {
            return;
        }
        let changes = self.pending_changes.entry(controller).or_default();
        let previous = changes
            .get(key)
            .map(|c| c.previous_value.clone())
            .unwrap_or(previous);
        changes.insert(key.to_string(), SimpleChange::new(previous, current));
    }

    fn flush_changes(&mut self) {
        let pending = std::mem::take(&mut self.pending_changes);
        for (controller, changes) in pending {
            self.call_hook(controller, Hook::Changes(changes));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::error::{ERR_INFINITE_DIGEST, ERR_EXPRESSION};
    use crate::registry::DirectiveRegistry;
    use crate::runtime::Runtime;
    use crate::scope::WatchSource;
    use crate::value::Value;

    #[test]
    fn test_listener_sees_previous_value() {
        let mut rt = Runtime::new(DirectiveRegistry::new());
        let root = rt.root_scope();
        rt.scopes.set(root, "name", "a");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        rt.scopes.watch(
            root,
            WatchSource::Expression("name".into()),
            Some(Rc::new(move |_: &mut Runtime, new: &Value, old: Option<&Value>| {
                log.borrow_mut().push((new.clone(), old.cloned()));
                Ok(())
            })),
        );
        rt.digest().unwrap();
        rt.scopes.set(root, "name", "b");
        rt.digest().unwrap();
        rt.digest().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![
                (Value::str("a"), None),
                (Value::str("b"), Some(Value::str("a"))),
            ]
        );
    }

    #[test]
    fn test_unstable_watch_hits_ttl() {
        let mut rt = Runtime::new(DirectiveRegistry::new());
        let root = rt.root_scope();
        rt.scopes.set(root, "n", 0);
        rt.scopes.watch(
            root,
            WatchSource::Expression("n".into()),
            Some(Rc::new(|rt: &mut Runtime, _: &Value, _: Option<&Value>| {
                let root = rt.root_scope();
                rt.eval(root, "n = n + 1")?;
                Ok(())
            })),
        );
        let err = rt.digest().unwrap_err();
        assert_eq!(err.code, ERR_INFINITE_DIGEST);
    }

    #[test]
    fn test_async_queue_runs_in_digest() {
        let mut rt = Runtime::new(DirectiveRegistry::new());
        rt.eval_async(Box::new(|rt| {
            let root = rt.root_scope();
            rt.scopes.set(root, "ran", true);
            Ok(())
        }));
        let root = rt.root_scope();
        assert!(rt.scopes.get(root, "ran").is_undefined());
        rt.digest().unwrap();
        assert_eq!(rt.scopes.get(root, "ran"), Value::Bool(true));
    }

    #[test]
    fn test_watch_errors_are_reported() {
        let reporter = Rc::new(crate::diagnostics::CollectingReporter::new());
        let mut rt = Runtime::new(DirectiveRegistry::new()).with_reporter(reporter.clone());
        let root = rt.root_scope();
        rt.scopes.watch(root, WatchSource::Expression("a +".into()), None);
        rt.digest().unwrap();
        assert_eq!(reporter.faults()[0].code, ERR_EXPRESSION);
    }
}
