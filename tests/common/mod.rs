//! Common test infrastructure
//!
//! Every test gets an isolated scheduler database in its own temp dir.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{counting_handler, hourly_spec, TestScheduler};
//!
//! #[tokio::test]
//! async fn test_runs() {
//!     let harness = TestScheduler::new(common::fast_settings());
//!     let (handler, count) = counting_handler();
//!     harness.register(&hourly_spec("job"), handler).await;
//!     harness.scheduler.start().unwrap();
//! }
//! ```

mod fixtures;
mod harness;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use harness::*;
