pub mod admission;
pub mod engine;
pub mod flow_ledger;
pub mod interlocks;
pub mod reconciler;
pub mod suggestions;

pub use admission::AdmissionQueue;
pub use engine::IrrigationEngine;
pub use flow_ledger::FlowLedger;
pub use interlocks::InterlockGate;
pub use reconciler::{Reconciler, ReconcilerHandle};
pub use suggestions::SuggestionAnalyzer;
