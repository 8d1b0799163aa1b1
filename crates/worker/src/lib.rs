pub mod config;
pub mod telemetry;
pub mod workflows;

// Re-export main types
pub use config::WorkerConfig;
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use workflows::{order_placement, register_workflows, Ledger, OrderRequest, ORDER_PLACEMENT};
