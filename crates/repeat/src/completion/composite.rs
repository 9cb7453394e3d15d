use std::fmt;
use std::sync::Arc;

use forgebatch_core::{BatchError, RepeatStatus};

use super::CompletionPolicy;
use crate::context::IterationContext;

const MEMBERS_KEY: &str = "completion.composite.members";

/// Stops as soon as any member policy wants to stop.
///
/// Each member gets its own context, started against the same parent as the
/// composite, and every member sees every `update`. An empty composite never
/// completes on its own; the loop has to be ended by marking the context
/// complete.
#[derive(Clone, Default)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl fmt::Debug for CompositeCompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeCompletionPolicy")
            .field("policies", &self.policies.len())
            .finish()
    }
}

impl CompositeCompletionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy<P: CompletionPolicy + 'static>(mut self, policy: P) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn with_shared_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn members(&self, context: &IterationContext) -> Arc<Vec<Arc<IterationContext>>> {
        context
            .attribute::<Vec<Arc<IterationContext>>>(MEMBERS_KEY)
            .unwrap_or_default()
    }

    fn pairs<'a>(
        &'a self,
        members: &'a [Arc<IterationContext>],
    ) -> impl Iterator<Item = (&'a Arc<dyn CompletionPolicy>, &'a Arc<IterationContext>)> {
        self.policies.iter().zip(members.iter())
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn start(&self, parent: Option<&Arc<IterationContext>>) -> Arc<IterationContext> {
        let context = IterationContext::start(parent);
        let members: Vec<_> = self.policies.iter().map(|p| p.start(parent)).collect();

        let to_close = members.clone();
        // A fresh context is never closed, so registration cannot fail here.
        let _ = context.register_cleanup(MEMBERS_KEY, move || {
            to_close
                .iter()
                .map(|member| member.close())
                .fold(Ok(()), |acc: Result<(), BatchError>, r| acc.and(r))
        });
        context.set_attribute(MEMBERS_KEY, members);
        context
    }

    fn is_complete(&self, context: &IterationContext) -> bool {
        let members = self.members(context);
        self.pairs(&members).any(|(p, ctx)| p.is_complete(ctx))
    }

    fn is_complete_with(&self, context: &IterationContext, result: RepeatStatus) -> bool {
        let members = self.members(context);
        self.pairs(&members)
            .any(|(p, ctx)| p.is_complete_with(ctx, result))
    }

    fn update(&self, context: &IterationContext) {
        let members = self.members(context);
        for (policy, ctx) in self.pairs(&members) {
            policy.update(ctx);
        }
    }
}
