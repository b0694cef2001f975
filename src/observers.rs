//! Exporters for the counter service's activity statistics.
//!
//! The service keeps its own diagnostics in [`ServiceStats`](crate::stats::ServiceStats).
//! Observers turn a [`StatsSnapshot`](crate::snapshot::StatsSnapshot) into
//! something a monitoring stack can scrape.
//!
//! # Feature Flags
//!
//! - `prometheus` - Enables this module and [`prometheus`](self::prometheus)
//! - `full` - Enables every optional observer
//!
//! # Example
//!
//! ```rust,ignore
//! use contatori_store::observers::prometheus::PrometheusObserver;
//!
//! let observer = PrometheusObserver::new().with_namespace("myapp");
//! let body = observer.render(&counter.stats())?;
//! ```

mod error;

pub use error::{ObserverError, Result};

pub mod prometheus;
