//! Connector dispatch
//!
//! Runs atomic requests against data source connectors on a bounded worker
//! pool. Each request becomes a work item that translates its command, opens
//! a connector execution and streams batches to a [`ResultsReceiver`]. Sources
//! that are not ready are retried on a timer, and consumers can pause, resume,
//! cancel or close a request at any point.
//!
//! # Example
//! ```rust,no_run
//! use igloo_dispatch::{ChannelReceiver, ConnectorManager, Settings};
//!
//! # async fn run() -> Result<(), igloo_dispatch::DispatchError> {
//! let manager = ConnectorManager::new(Settings::default())?;
//! let (receiver, deliveries) = ChannelReceiver::new();
//! // manager.execute_request(request, receiver).await?;
//! # let _ = (manager, receiver, deliveries);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod manager;
pub mod receiver;
pub mod request;
pub mod scheduler;
mod work_item;

pub use batch::ResultBatch;
pub use crate::config::{AdmissionPolicy, FlowControl, NotReadyPolicy, Settings};
pub use error::DispatchError;
pub use manager::ConnectorManager;
pub use receiver::{ChannelReceiver, Delivery, DeliveryStream, ResultsReceiver};
pub use request::{AtomicRequest, RequestCommand};
pub use work_item::WorkItemState;
