pub mod audit;
pub mod engine;
pub mod guard;
pub mod poller;


pub use audit::AuditSweep;
pub use engine::{BulkRetryItem, BulkRetryReport, ReconcileOutcome, ReconcileReport, ReconciliationEngine};
pub use guard::InFlightRegistry;
pub use poller::{Poller, TaskHandle, TickSummary};
