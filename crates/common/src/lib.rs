//! Common crate
//!
//! Shared types and error handling for Igloo.
//!
//! # Example
//! ```rust
//! use igloo_common::{Error, RequestId};
//! let id = RequestId::new("query-1", 0, 7);
//! assert_eq!(id.to_string(), "query-1.0.7");
//! let err = Error::execution("source unavailable");
//! assert!(err.to_string().contains("source unavailable"));
//! ```

pub mod error;
pub mod request;

pub use error::{Error, Result};
pub use request::RequestId;
