//! Outcome of a request.
//!
//! [`Response`] is the value `send_to_group` resolves to: either the
//! responding group fulfilled the request with some content, or the request
//! was rejected. A rejection carries a [`Reason`] distinguishing content the
//! responder sent deliberately from local failures such as a timeout.

use std::fmt;

use serde_json::Value;

use crate::error::SwitchboardError;

/// Why a request was rejected.
#[derive(Debug)]
pub enum Reason {
    /// The responding group rejected the request with this content.
    Content(Value),

    /// The request failed locally before a usable reply arrived.
    Error(SwitchboardError),
}

impl Reason {
    /// True if the rejection is the caller's own bounded wait expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Error(err) if err.is_timeout())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content(value) => write!(f, "{value}"),
            Self::Error(err) => write!(f, "{err}"),
        }
    }
}

/// The result of a round trip through the stream.
#[derive(Debug)]
pub enum Response {
    Fulfilled(Value),
    Rejected(Reason),
}

impl Response {
    /// A fulfilled response carrying the reply content.
    pub fn fulfilled(value: Value) -> Self {
        Self::Fulfilled(value)
    }

    /// A rejection carrying content the responder sent.
    pub fn rejected(content: Value) -> Self {
        Self::Rejected(Reason::Content(content))
    }

    /// A rejection caused by a local failure.
    pub fn rejected_with(error: SwitchboardError) -> Self {
        Self::Rejected(Reason::Error(error))
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The fulfilled content, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Fulfilled(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Self::Fulfilled(_) => None,
            Self::Rejected(reason) => Some(reason),
        }
    }
}
