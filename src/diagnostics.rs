//! Fault reporting for hook failures that must not abort linking.

use std::cell::RefCell;

use crate::error::CompileError;

/// Receives errors raised by observers, link functions and lifecycle hooks.
pub trait FaultReporter {
    fn report(&self, error: &CompileError);
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl FaultReporter for TracingReporter {
    fn report(&self, error: &CompileError) {
        tracing::error!(code = %error.code, context = ?error.context, "{}", error.message);
    }
}

/// Keeps every reported fault, for tests and embedders that inspect them.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    faults: RefCell<Vec<CompileError>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<CompileError> {
        self.faults.borrow().clone()
    }

    pub fn take(&self) -> Vec<CompileError> {
        std::mem::take(&mut *self.faults.borrow_mut())
    }
}

impl FaultReporter for CollectingReporter {
    fn report(&self, error: &CompileError) {
        tracing::debug!(code = %error.code, "collected fault: {}", error.message);
        self.faults.borrow_mut().push(error.clone());
    }
}
