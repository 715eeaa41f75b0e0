//! The request/response correlation core of an asynchronous document database driver.
//!
//! Every operation goes through [`driver::Driver::submit`], which validates it, checks a connection out of the
//! [`pool::ConnectionPool`], registers it with the [`store::PendingRequestStore`] and waits for exactly one
//! resolution: the server's reply, a timeout issued by the [`reaper::Reaper`], or the loss of the connection.
//!
//! ## Requests
//! * [`frame::RequestId`], correlates a reply with the request it answers.
//! * [`operation::Operation`], what is being asked of the server.
//! * [`store::PendingRequestStore`], the single place where a request is resolved.
//!
//! ## Writes
//! * [`safe_write::SafeWriteCoordinator`], chains a confirmation behind a write.
//! * [`safe_write::SafeWriteResult`], the server's verdict on an acknowledged write.
//!
//! ## Wire format
//! * [`codec::CodecBuilder`], implement this to speak a different wire format.

// Accidentally printing would break the json log output of an application using the driver
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod codec;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod frame;
pub mod operation;
pub mod pool;
pub mod reaper;
pub mod safe_write;
pub mod store;
pub mod tcp;
pub mod validation;

pub use config::DriverConfig;
pub use driver::{Driver, Reply};
pub use error::{DriverError, ValidationError};
