//! # Ripple Reactive
//!
//! A dependency-tracked scheduling primitive for live queries.
//!
//! A [`Rerunner`] owns one computation and re-invokes it whenever any
//! [`Resource`] the computation tracked during its last pass is invalidated,
//! pacing re-runs to a minimum interval. The computation reports back through
//! [`RunnerError`]: it can ask to be retried without losing its dependency
//! set, or halt the runner for good.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use futures_util::future::BoxFuture;
//! use ripple_reactive::{Computation, Rerunner, Resource, RunContext, RunnerError};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let resource = Resource::new();
//!
//! let tracked = resource.clone();
//! let computation: Computation = Arc::new(
//!     move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
//!         let tracked = tracked.clone();
//!         Box::pin(async move {
//!             run.track(&tracked);
//!             // read the data guarded by `tracked`, publish the result
//!             Ok(())
//!         })
//!     },
//! );
//!
//! let runner = Rerunner::new(
//!     &CancellationToken::new(),
//!     computation,
//!     Duration::from_secs(5),
//! );
//!
//! resource.invalidate(); // schedules a re-run
//! runner.rerun_immediately(); // bypasses the pacing interval once
//! runner.stop();
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod rerunner;
pub mod resource;

pub use rerunner::{Computation, Rerunner, RunContext, RunnerError};
pub use resource::Resource;
