//! Handler trait and utilities

use crate::context::Context;
use crate::error::SharedError;
use std::sync::Arc;

/// A middleware or terminal handler operating on a request [`Context`].
///
/// Handlers are synchronous and run inline on the thread that owns the
/// request. A handler continues the chain by calling [`Context::next`] (to do
/// work after the downstream handlers finish) or simply by returning, and
/// stops it with [`Context::abort`].
pub trait Handler: Send + Sync {
    /// Handle the request
    fn handle(&self, ctx: &mut Context);
}

impl<F> Handler for F
where
    F: Fn(&mut Context) + Send + Sync,
{
    fn handle(&self, ctx: &mut Context) {
        self(ctx)
    }
}

/// Shared, type-erased handler
pub type BoxedHandler = Arc<dyn Handler>;

/// Operation re-executed by the retry recovery action
pub type RetryOperation =
    Arc<dyn Fn(&mut Context) -> Result<(), SharedError> + Send + Sync + 'static>;

/// Box a closure into a [`BoxedHandler`]
pub fn handler_fn<F>(f: F) -> BoxedHandler
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    Arc::new(f)
}
