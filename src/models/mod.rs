pub mod flow;
pub mod interlock;
pub mod queue;
pub mod suggestion;
pub mod telemetry;

pub use flow::*;
pub use interlock::*;
pub use queue::*;
pub use suggestion::*;
pub use telemetry::*;
