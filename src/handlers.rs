//! User callback traits.
//!
//! A [`RequestHandler`] services requests arriving for the coordinator's
//! group; it is expected to answer with `fulfill_request` or
//! `reject_request` on the coordinator it receives. An [`ErrorHandler`]
//! observes failures from inside worker ticks. Both are stored as
//! `Arc<dyn …>` and must be safe to share across tasks.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use serde_json::json;
//! use switchboard::{Entry, RequestHandler, Switchboard, SwitchboardError};
//!
//! struct Pong;
//!
//! #[async_trait]
//! impl RequestHandler for Pong {
//!     async fn call(
//!         &self,
//!         board: &Switchboard,
//!         request: Entry,
//!     ) -> Result<(), SwitchboardError> {
//!         board.fulfill_request(&request, json!("pong")).await
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::SwitchboardError;
use crate::switchboard::Switchboard;

/// Services one inbound request entry.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn call(&self, board: &Switchboard, request: Entry) -> Result<(), SwitchboardError>;
}

/// Observes errors raised inside worker ticks and request handlers.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn call(&self, error: &SwitchboardError);
}
