//! Step handler trait

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{StepContext, StepError};

/// Result of a handler invocation
pub type StepResult = Result<Value, StepError>;

/// Invoke or compensate logic of a step
///
/// Handlers must be idempotent with respect to
/// [`StepContext::idempotency_key`]: after a crash the same attempt may be
/// delivered again.
///
/// # Example
///
/// ```ignore
/// struct ReserveInventory;
///
/// #[async_trait]
/// impl StepHandler for ReserveInventory {
///     async fn call(&self, ctx: StepContext) -> StepResult {
///         let order: Order = ctx.input_as()?;
///         let id = inventory::reserve(&order.sku, order.qty).await?;
///         Ok(json!({ "reservation_id": id }))
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn call(&self, ctx: StepContext) -> StepResult;
}

/// Shared handler reference
pub type Handler = Arc<dyn StepHandler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn call(&self, ctx: StepContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Build a handler from an async closure
///
/// ```ignore
/// let invoke = handler_fn(|ctx| async move {
///     let x = ctx.input()["x"].as_i64().unwrap_or(0);
///     Ok(json!({ "doubled": x * 2 }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
