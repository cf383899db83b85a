//! Scheduling side of Sluice.
//!
//! Compiles pipelines into execution graphs, keeps the agent pool sized and
//! drives jobs through their lifecycle.

pub mod agents;
pub mod bus;
pub mod config;
pub mod dag;
pub mod lifecycle;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use agents::{AgentRegistry, AgentSlot, ZoneStats};
pub use bus::BroadcastEventBus;
pub use config::{PoolConfig, SchedulerConfig};
pub use dag::{EdgeKind, ExecutionGraph, GraphCompiler, GraphNode, GraphSnapshot};
pub use lifecycle::JobLifecycle;
pub use pool::{PoolManager, ReconcileReport};
pub use queue::{QueueManager, QueuedDispatch};
pub use scheduler::{JobScheduler, NodeOutcome, SchedulerPorts};
