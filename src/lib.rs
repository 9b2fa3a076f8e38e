//! # Switchboard
//!
//! Request/response messaging between independent process groups over a
//! shared Redis Stream with consumer-group semantics.
//!
//! ## Architecture
//!
//! ```text
//! caller ── send_to_group ──> Redis Stream ──> Dispatcher ──> Worker ──> on_request
//!    ▲                                                                      │
//!    └───────── mailbox <── Worker <── Dispatcher <── reply entry <─────────┘
//! ```
//!
//! A [`Switchboard`] joins a named group on a stream. Sending registers a
//! mailbox in the local correlation [`ledger`], publishes the request entry,
//! and blocks (bounded) on the mailbox. On the receiving side a dispatcher
//! claims the entry to a load-balanced worker, whose `on_request` handler
//! answers with [`Switchboard::fulfill_request`] or
//! [`Switchboard::reject_request`]; the reply travels back the same way and
//! wakes the caller with a [`Response`].
//!
//! ## Modules
//!
//! - [`entry`]: the immutable stream entry value type
//! - [`commands`]: the Redis command facade
//! - [`ledger`]: the correlation table and mailboxes
//! - [`worker`] / [`dispatcher`]: the periodic consumer and routing tasks
//! - [`switchboard`]: the coordinator facade

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod response;
pub mod shutdown;
pub mod switchboard;
pub mod worker;

// Re-export the public surface at crate root
pub use config::SwitchboardConfig;
pub use entry::{Entry, Status};
pub use error::SwitchboardError;
pub use handlers::{ErrorHandler, RequestHandler};
pub use response::{Reason, Response};
pub use switchboard::Switchboard;
