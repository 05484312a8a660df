//! `pledge` is a promise-based HTTP client: requests go through a
//! bounded-concurrency dispatch engine that multiplexes transfers over a
//! single driver, and callers hold [`Promise`] handles that settle with a
//! [`Response`] or an [`Error`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use pledge::{Client, Resolution};
//!
//! let client = Client::new()
//!     .with_base_url("https://api.example.com")
//!     .with_retry(2, Duration::from_millis(200), [429, 502, 503, 504])
//!     .with_max_concurrent(8);
//!
//! let lookup = client
//!     .get("/v1/items")
//!     .query_pair("page", "1")
//!     .send()
//!     .then(|response| {
//!         let names: Vec<String> = response.json()?;
//!         Ok(Resolution::Value(names))
//!     });
//!
//! let names = lookup.wait(Some(Duration::from_secs(5)))?;
//! println!("{} items", names.len());
//! # Ok::<(), pledge::Error>(())
//! ```
//!
//! Promises compose with [`Promise::all`], [`Promise::any`],
//! [`Promise::race`], and [`Promise::all_settled`]; [`Client::concurrent`]
//! keys a batch of requests and aggregates them against this client's
//! engine. Retries are restricted to idempotent methods and re-enter the
//! admission queue with an exponential-backoff floor, so a caller only ever
//! observes the outcome of the final attempt.

mod client;
mod core;
mod driver;
mod engine;
mod promise;
mod response;

pub(crate) use crate::core::error;
pub(crate) use crate::core::format;
pub(crate) use crate::core::metrics;
pub(crate) use crate::core::options;
pub(crate) use crate::core::policy;
pub(crate) use crate::core::pool;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::util;

pub use crate::client::{Client, RequestBuilder};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{build_url, content_type, format_headers, format_params, merge_headers};
pub use crate::core::metrics::MetricsSnapshot;
pub use crate::core::options::Options;
pub use crate::core::policy::{PublicAddressPolicy, UrlPolicy};
pub use crate::driver::{
    MultiplexDriver, TransferConfig, TransferDriver, TransferFailure, TransferHandle,
    TransferOutcome, WireResponse,
};
pub use crate::engine::middleware::{
    middleware_fn, reject_error_statuses, Middleware, Next, RequestDescriptor,
};
pub use crate::promise::{Deferred, Promise, PromiseState, Resolution, SettledOutcome};
pub use crate::response::Response;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, Deferred, Error, ErrorKind, MetricsSnapshot, Options, Promise, PromiseState,
        Resolution, Response, SettledOutcome,
    };
}

#[cfg(test)]
mod tests;
