//! Agent activity streaming and tracing
//!
//! - [`types`] - the closed event and trace vocabularies
//! - [`bus`] - tokio broadcast pub/sub with per-run emitters
//! - [`sinks`] - fire-and-forget tracer/analytics traits and stock impls

mod bus;
mod sinks;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter};
pub use sinks::{
    Analytics, CollectingAnalytics, CollectingTracer, NullAnalytics, NullTracer, TraceLog, Tracer,
};
pub use types::{AgentEvent, AgentEventKind, TraceEvent, TraceKind};
