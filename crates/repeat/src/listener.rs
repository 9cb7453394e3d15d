//! Hooks around repeat-template iterations.
//!
//! `open` and `before` are called in registration order; `after`, `on_error`
//! and `close` in reverse order, so listeners nest like scopes.

use forgebatch_core::{BatchError, RepeatStatus};

use crate::context::IterationContext;

pub trait RepeatListener: Send + Sync {
    fn open(&self, _context: &IterationContext) {}

    fn before(&self, _context: &IterationContext) {}

    fn after(&self, _context: &IterationContext, _result: RepeatStatus) {}

    fn on_error(&self, _context: &IterationContext, _error: &BatchError) {}

    fn close(&self, _context: &IterationContext) {}
}
