//! # quiesce-core
//!
//! Synchronization engine for driving an application's UI from a separate
//! test process.
//!
//! A UI test has to know when the application under test has settled. This
//! crate tracks everything that can keep an application's UI in flux, blocks
//! driver requests until all of it has gone quiet, and then runs the request
//! on the application's UI thread. A TCP bridge carries the requests between
//! the driver process and the application process.
//!
//! ## Modules
//!
//! - [`idling`] - Registry of named idling resources, plus stock resources
//! - [`tracker`] - Tracking of ad-hoc in-flight application activity
//! - [`poller`] - Bounded polling of boolean conditions
//! - [`ui_thread`] - The designated UI thread and its event loop
//! - [`synchronizer`] - Runs work on the UI thread once the app is idle
//! - [`engine`] - Process-scoped bundle of the above
//! - [`bridge`] - Distant objects across the process boundary
//! - [`config`] - Persistent settings shared by both processes
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use quiesce_core::config::SyncConfig;
//! use quiesce_core::engine::SyncEngine;
//! use quiesce_core::idling::CountingResource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::start(SyncConfig::default())?;
//!
//! // The app marks its network layer busy while requests are in flight.
//! let network = Arc::new(CountingResource::new("network"));
//! engine.register_idling_resource(&network);
//! let request = network.busy();
//! # drop(request);
//!
//! // The driver side waits for quiescence, then reads UI state.
//! let title = engine
//!     .synchronize_and_run(|| "Inbox".to_string(), Duration::from_secs(10))
//!     .await?;
//! assert_eq!(title, "Inbox");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod engine;
pub mod idling;
pub mod poller;
pub mod synchronizer;
pub mod tracker;
pub mod ui_thread;
