//! Observability for virtbench.
//!
//! - [`observer`]: the event handle threaded through the engine
//! - [`logging`]: tracing subscriber setup

pub mod logging;
pub mod observer;

pub use logging::{LogFormat, LogLevel, LoggingBuilder, LoggingConfig};
pub use observer::{
    BenchmarkObserver, CompositeObserver, NullObserver, RetryEvent, SharedObserver,
    TracingObserver,
};
