//! Request-scoped actor context.
//!
//! Every authenticated request runs inside a task-local [`RequestContext`]
//! carrying the request id and the acting user. The repository layer reads
//! it to stamp `created_by`/`updated_by` audit columns without threading
//! the actor through every call signature, and the error boundary reads it
//! for log correlation.

use std::future::Future;

use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<Uuid>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Run `fut` with `ctx` installed as the task-local request context.
pub async fn with_context<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST_CONTEXT.scope(ctx, fut).await
}

/// Snapshot of the current context. Outside a request scope (startup,
/// background jobs) this returns an empty context rather than panicking.
pub fn current_actor() -> RequestContext {
    REQUEST_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_visible_inside_the_scope() {
        let user = Uuid::new_v4();
        let ctx = RequestContext::new("req-1").with_user(user);
        with_context(ctx, async move {
            let actor = current_actor();
            assert_eq!(actor.request_id, "req-1");
            assert_eq!(actor.user_id, Some(user));
        })
        .await;
    }

    #[tokio::test]
    async fn context_is_empty_outside_any_scope() {
        let actor = current_actor();
        assert_eq!(actor.request_id, "");
        assert_eq!(actor.user_id, None);
    }

    #[tokio::test]
    async fn nested_scopes_shadow_the_outer_context() {
        let outer = RequestContext::new("outer");
        let inner = RequestContext::new("inner");
        with_context(outer, async move {
            with_context(inner, async {
                assert_eq!(current_actor().request_id, "inner");
            })
            .await;
            assert_eq!(current_actor().request_id, "outer");
        })
        .await;
    }
}
