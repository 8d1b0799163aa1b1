//! Step execution context

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Services, StepError};
use crate::transaction::{HandlerType, IdempotencyKey};

/// Context provided to step handlers during execution
///
/// The context provides:
/// - The transaction input and the outputs of previously completed steps
/// - The idempotency key of this invocation
/// - Information about the current attempt
/// - Cancellation detection (step timeout, transaction timeout, cancel)
/// - Access to shared services registered on the orchestrator
///
/// # Example
///
/// ```ignore
/// async fn charge(ctx: StepContext) -> Result<Value, StepError> {
///     let order: Order = ctx.input_as()?;
///     let reservation: Reservation = ctx.output_as("reserve_inventory")?;
///     let payments = ctx.require_service::<PaymentGateway>()?;
///
///     tokio::select! {
///         receipt = payments.charge(ctx.idempotency_key().to_string(), order.total) => {
///             Ok(serde_json::to_value(receipt?)?)
///         }
///         _ = ctx.cancelled() => Err(StepError::permanent("cancelled")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StepContext {
    key: IdempotencyKey,

    /// Current attempt number (1-based) of this handler
    pub attempt: u32,

    /// Retries allowed after the first attempt
    pub max_retries: u32,

    input: Arc<Value>,
    outputs: Arc<BTreeMap<String, Value>>,
    metadata: Arc<Value>,
    services: Services,
    cancellation: CancellationToken,
}

impl StepContext {
    /// Create a new step context
    pub fn new(key: IdempotencyKey, attempt: u32, max_retries: u32) -> Self {
        Self {
            key,
            attempt,
            max_retries,
            input: Arc::new(Value::Null),
            outputs: Arc::new(BTreeMap::new()),
            metadata: Arc::new(Value::Null),
            services: Services::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, input: Arc<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_outputs(mut self, outputs: Arc<BTreeMap<String, Value>>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.key.workflow_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.key.transaction_id
    }

    pub fn step_id(&self) -> &str {
        &self.key.step_id
    }

    /// Whether this is the invoke or the compensate handler
    pub fn action(&self) -> HandlerType {
        self.key.action
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Transaction input
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Deserialize the transaction input
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(T::deserialize(self.input.as_ref())?)
    }

    /// Output of a completed step
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Deserialize the output of a completed step
    pub fn output_as<T: DeserializeOwned>(&self, step_id: &str) -> Result<T, StepError> {
        let value = self.output(step_id).ok_or_else(|| {
            StepError::permanent(format!("no output recorded for step {step_id}"))
                .with_type("MISSING_OUTPUT")
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Outputs of every completed step
    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Output of this step's own invoke handler, available while compensating
    pub fn invoke_output(&self) -> Option<&Value> {
        self.outputs.get(&self.key.step_id)
    }

    /// Caller-supplied transaction metadata
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Look up a shared service
    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }

    /// Look up a shared service, failing the attempt permanently when absent
    pub fn require_service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, StepError> {
        self.service::<T>().ok_or_else(|| {
            StepError::permanent(format!(
                "service {} is not registered",
                std::any::type_name::<T>()
            ))
            .with_type("MISSING_SERVICE")
        })
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the attempt is cancelled or times out
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => return Err(StepError::permanent("cancelled")),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last attempt the retry policy allows
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reservation {
        sku: String,
        qty: u32,
    }

    fn context(attempt: u32, max_retries: u32) -> StepContext {
        StepContext::new(
            IdempotencyKey::new("order", "tx-1", "charge", HandlerType::Invoke),
            attempt,
            max_retries,
        )
    }

    #[test]
    fn test_step_context_creation() {
        let ctx = context(1, 2);

        assert_eq!(ctx.workflow_id(), "order");
        assert_eq!(ctx.transaction_id(), "tx-1");
        assert_eq!(ctx.step_id(), "charge");
        assert_eq!(ctx.action(), HandlerType::Invoke);
        assert_eq!(ctx.idempotency_key().to_string(), "order:tx-1:charge:invoke");
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        assert!(context(3, 2).is_last_attempt());
        assert!(context(1, 0).is_last_attempt());
    }

    #[test]
    fn test_outputs() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "reserve".to_string(),
            serde_json::json!({"sku": "A-1", "qty": 2}),
        );
        let ctx = context(1, 0).with_outputs(Arc::new(outputs));

        let reservation: Reservation = ctx.output_as("reserve").unwrap();
        assert_eq!(
            reservation,
            Reservation {
                sku: "A-1".to_string(),
                qty: 2
            }
        );

        let missing = ctx.output_as::<Reservation>("ship").unwrap_err();
        assert!(missing.permanent);
        assert_eq!(missing.error_type.as_deref(), Some("MISSING_OUTPUT"));
    }

    #[test]
    fn test_invoke_output_while_compensating() {
        let mut outputs = BTreeMap::new();
        outputs.insert("charge".to_string(), serde_json::json!({"auth": "au-7"}));
        let ctx = StepContext::new(
            IdempotencyKey::new("order", "tx-1", "charge", HandlerType::Compensate),
            1,
            0,
        )
        .with_outputs(Arc::new(outputs));

        assert_eq!(ctx.invoke_output(), Some(&serde_json::json!({"auth": "au-7"})));
        assert!(context(1, 0).invoke_output().is_none());
    }

    #[test]
    fn test_input_as_rejects_bad_payload() {
        let ctx = context(1, 0).with_input(Arc::new(serde_json::json!({"sku": 5})));
        let err = ctx.input_as::<Reservation>().unwrap_err();
        assert!(err.permanent);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let ctx = context(1, 0).with_cancellation(token.clone());

        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }

    #[test]
    fn test_services() {
        struct Gateway(&'static str);

        let ctx = context(1, 0).with_services(Services::new().with(Gateway("stripe")));
        assert_eq!(ctx.service::<Gateway>().unwrap().0, "stripe");
        assert!(ctx.require_service::<String>().is_err());
    }
}
