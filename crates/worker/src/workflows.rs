// Workflows served by this worker
// Decision: Side effects go through a shared Ledger service so handlers stay stateless

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use sagaflow_durable::prelude::*;
use sagaflow_durable::{DefinitionError, RegistryError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const ORDER_PLACEMENT: &str = "order_placement";

/// Payments above this amount are declined
const CREDIT_LIMIT_CENTS: u64 = 1_000_000;

/// Input of the order placement workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
}

/// Errors from ledger operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("payment of {amount_cents} cents declined")]
    Declined { amount_cents: u64 },
}

impl From<LedgerError> for StepError {
    fn from(e: LedgerError) -> Self {
        let kind = match &e {
            LedgerError::InsufficientStock { .. } => "insufficient_stock",
            LedgerError::Declined { .. } => "payment_declined",
        };
        StepError::permanent(e.to_string()).with_type(kind)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    stock: HashMap<String, u32>,
    reservations: HashMap<String, (String, u32)>,
    authorizations: HashMap<String, u64>,
    shipments: HashMap<String, String>,
}

/// Bookkeeping for inventory, payments and shipments
///
/// Every operation is keyed by the idempotency key of the step calling it,
/// so a re-invoked step finds its earlier effect instead of repeating it.
#[derive(Debug, Default)]
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add stock for a SKU
    pub fn with_stock(self, sku: impl Into<String>, quantity: u32) -> Self {
        *self.state.lock().stock.entry(sku.into()).or_default() += quantity;
        self
    }

    pub fn available(&self, sku: &str) -> u32 {
        self.state.lock().stock.get(sku).copied().unwrap_or(0)
    }

    pub fn open_authorizations(&self) -> usize {
        self.state.lock().authorizations.len()
    }

    pub fn open_shipments(&self) -> usize {
        self.state.lock().shipments.len()
    }

    pub fn reserve(&self, key: &str, sku: &str, quantity: u32) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        if state.reservations.contains_key(key) {
            return Ok(());
        }
        let available = state.stock.get(sku).copied().unwrap_or(0);
        if available < quantity {
            return Err(LedgerError::InsufficientStock {
                sku: sku.to_string(),
                requested: quantity,
                available,
            });
        }
        state.stock.insert(sku.to_string(), available - quantity);
        state
            .reservations
            .insert(key.to_string(), (sku.to_string(), quantity));
        Ok(())
    }

    pub fn release(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some((sku, quantity)) = state.reservations.remove(key) {
            *state.stock.entry(sku).or_default() += quantity;
        }
    }

    pub fn authorize(&self, key: &str, amount_cents: u64) -> Result<(), LedgerError> {
        if amount_cents > CREDIT_LIMIT_CENTS {
            return Err(LedgerError::Declined { amount_cents });
        }
        self.state
            .lock()
            .authorizations
            .insert(key.to_string(), amount_cents);
        Ok(())
    }

    pub fn void(&self, key: &str) {
        self.state.lock().authorizations.remove(key);
    }

    pub fn ship(&self, key: &str, order_id: &str) {
        self.state
            .lock()
            .shipments
            .insert(key.to_string(), order_id.to_string());
    }

    pub fn cancel_shipment(&self, key: &str) {
        self.state.lock().shipments.remove(key);
    }
}

/// Key of the invoke call a compensation undoes
fn invoke_key(ctx: &StepContext) -> String {
    let key = ctx.idempotency_key();
    IdempotencyKey::new(
        key.workflow_id.clone(),
        key.transaction_id.clone(),
        key.step_id.clone(),
        HandlerType::Invoke,
    )
    .to_string()
}

/// Reserve stock, authorize payment in parallel, then ship
pub fn order_placement() -> Result<WorkflowDefinition, DefinitionError> {
    let reserve_inventory = StepDefinition::new(
        "reserve_inventory",
        handler_fn(|ctx| async move {
            let order: OrderRequest = ctx.input_as()?;
            let ledger = ctx.require_service::<Ledger>()?;
            let key = ctx.idempotency_key().to_string();
            ledger.reserve(&key, &order.sku, order.quantity)?;
            Ok(json!({ "reservation_id": key, "sku": order.sku, "quantity": order.quantity }))
        }),
    )
    .with_compensation(handler_fn(|ctx| async move {
        let ledger = ctx.require_service::<Ledger>()?;
        // A timed-out reserve left no output but may still have taken stock
        let reservation_id = ctx
            .invoke_output()
            .and_then(|output| output["reservation_id"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| invoke_key(&ctx));
        ledger.release(&reservation_id);
        Ok(json!({ "released": reservation_id }))
    }));

    let authorize_payment = StepDefinition::new(
        "authorize_payment",
        handler_fn(|ctx| async move {
            let order: OrderRequest = ctx.input_as()?;
            let ledger = ctx.require_service::<Ledger>()?;
            let key = ctx.idempotency_key().to_string();
            ledger.authorize(&key, order.amount_cents)?;
            Ok(json!({ "authorization_id": Uuid::now_v7().to_string(), "amount_cents": order.amount_cents }))
        }),
    )
    .with_compensation(handler_fn(|ctx| async move {
        let ledger = ctx.require_service::<Ledger>()?;
        ledger.void(&invoke_key(&ctx));
        Ok(json!({ "voided": true }))
    }))
    .with_retry(
        RetryPolicy::exponential()
            .with_max_retries(3)
            .with_interval(Duration::from_millis(500)),
    );

    let create_shipment = StepDefinition::new(
        "create_shipment",
        handler_fn(|ctx| async move {
            let order: OrderRequest = ctx.input_as()?;
            let ledger = ctx.require_service::<Ledger>()?;
            ledger.ship(&ctx.idempotency_key().to_string(), &order.order_id);
            Ok(json!({ "shipment_id": format!("shp-{}", order.order_id) }))
        }),
    )
    .with_compensation(handler_fn(|ctx| async move {
        let ledger = ctx.require_service::<Ledger>()?;
        ledger.cancel_shipment(&invoke_key(&ctx));
        Ok(json!({ "cancelled": true }))
    }))
    .with_timeout(Duration::from_secs(30))
    .depends_on(["reserve_inventory", "authorize_payment"]);

    WorkflowBuilder::new(ORDER_PLACEMENT)
        .step(reserve_inventory)
        .step(authorize_payment)
        .step(create_shipment)
        .result_from(ResultSelector::fields([
            ("reservation_id", OutputRef::at("reserve_inventory", "/reservation_id")),
            ("authorization_id", OutputRef::at("authorize_payment", "/authorization_id")),
            ("shipment_id", OutputRef::at("create_shipment", "/shipment_id")),
        ]))
        .timeout(Duration::from_secs(300))
        .retention_time(Duration::from_secs(24 * 60 * 60))
        .build()
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Register every workflow this worker serves
pub fn register_workflows(registry: &mut WorkflowRegistry) -> Result<(), RegisterError> {
    registry.register(order_placement()?)?;
    info!(workflows = registry.len(), "registered workflows");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn orchestrator(ledger: Arc<Ledger>) -> WorkflowOrchestrator {
        let mut registry = WorkflowRegistry::new();
        register_workflows(&mut registry).unwrap();
        WorkflowOrchestrator::new(registry, Arc::new(InMemoryCheckpointStorage::new()))
            .with_services(Services::new().with_arc(ledger))
    }

    fn order(quantity: u32, amount_cents: u64) -> serde_json::Value {
        serde_json::to_value(OrderRequest {
            order_id: "ord-1".to_string(),
            sku: "SKU-1".to_string(),
            quantity,
            amount_cents,
        })
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_order_placement_succeeds() {
        let ledger = Arc::new(Ledger::new().with_stock("SKU-1", 5));
        let orchestrator = orchestrator(Arc::clone(&ledger));

        let result = orchestrator
            .run(ORDER_PLACEMENT, RunOptions::new(order(2, 4_999)))
            .await
            .unwrap();

        assert_eq!(result.state(), TransactionState::Done);
        let output = result.result.unwrap();
        assert_eq!(output["shipment_id"], json!("shp-ord-1"));
        assert!(output["reservation_id"].as_str().unwrap().ends_with(":reserve_inventory:invoke"));
        assert_eq!(ledger.available("SKU-1"), 3);
        assert_eq!(ledger.open_authorizations(), 1);
        assert_eq!(ledger.open_shipments(), 1);
    }

    #[tokio::test]
    async fn test_declined_payment_releases_stock() {
        let ledger = Arc::new(Ledger::new().with_stock("SKU-1", 5));
        let orchestrator = orchestrator(Arc::clone(&ledger));

        let result = orchestrator
            .run(ORDER_PLACEMENT, RunOptions::new(order(2, CREDIT_LIMIT_CENTS + 1)))
            .await
            .unwrap();

        assert_eq!(result.state(), TransactionState::Reverted);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].action, "authorize_payment");
        assert_eq!(
            result.errors[0].error.error_type.as_deref(),
            Some("payment_declined")
        );
        assert_eq!(ledger.available("SKU-1"), 5);
        assert_eq!(ledger.open_shipments(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_stock_voids_payment() {
        let ledger = Arc::new(Ledger::new().with_stock("SKU-1", 1));
        let orchestrator = orchestrator(Arc::clone(&ledger));

        let result = orchestrator
            .run(ORDER_PLACEMENT, RunOptions::new(order(3, 100)))
            .await
            .unwrap();

        assert_eq!(result.state(), TransactionState::Reverted);
        assert_eq!(ledger.available("SKU-1"), 1);
        assert_eq!(ledger.open_authorizations(), 0);
    }

    #[test]
    fn test_ledger_reserve_is_idempotent() {
        let ledger = Ledger::new().with_stock("SKU-1", 3);
        ledger.reserve("k", "SKU-1", 2).unwrap();
        ledger.reserve("k", "SKU-1", 2).unwrap();
        assert_eq!(ledger.available("SKU-1"), 1);

        ledger.release("k");
        ledger.release("k");
        assert_eq!(ledger.available("SKU-1"), 3);
    }
}
