//! # epmapd
//!
//! Local single-instance endpoint mapper.
//!
//! Processes register `(interface, protocol sequence, object) -> endpoint`
//! bindings and resolve them through a small fixed-frame protocol carried
//! over a well-known local address (a Unix domain socket, or a named pipe on
//! Windows). At most one server runs per runtime directory: a starting
//! process that finds a live instance notifies it and yields.
//!
//! ## Architecture
//!
//! - **Control plane** (stdout): one JSON status line after startup
//! - **Data plane** (socket/pipe): one request and one reply per connection
//!
//! ## Example
//!
//! ```no_run
//! use epmapd::lifecycle::{start, Startup};
//! use epmapd::monitor::IdleExit;
//! use epmapd::ServiceConfig;
//!
//! # async fn run() -> epmapd::Result<()> {
//! match start(ServiceConfig::load()?).await? {
//!     Startup::Leader(service) => {
//!         let mut monitor = IdleExit::new(service.state().clone());
//!         service.run_until_exit(&mut monitor).await?;
//!     }
//!     Startup::AlreadyRunning => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod map;
pub mod monitor;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod transport;

pub use client::EpmapClient;
pub use config::ServiceConfig;
pub use error::{EpmapError, Result};
pub use lifecycle::{Coordinator, RunningService, Startup};
pub use map::{EndpointMap, InterfaceId, MapEntry, MapKey, ObjectId};
