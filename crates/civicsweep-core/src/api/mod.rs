//! Remote service access.
//!
//! This module provides the `NetworkGateway`, through which every call to
//! the CivicSweep service is made, and the `Transport` trait it sends
//! requests over. `HttpTransport` is the `reqwest` implementation.
//!
//! Failures are typed as `ApiError` and classified as network (retry later)
//! or logical (the service said no) for the retry queue.

pub mod error;
pub mod gateway;
pub mod transport;

pub use error::{ApiError, FailureKind};
pub use gateway::{CallOptions, DataSource, Fetched, NetworkGateway};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
