mod multiplex;

use std::any::Any;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;

pub use self::multiplex::MultiplexDriver;

/// Everything a driver needs to run one transfer: the resolved request plus
/// the per-client transport options forwarded verbatim.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub verify_tls: bool,
    pub proxy: Option<String>,
    pub http2: bool,
    pub tcp_keep_alive: bool,
}

#[derive(Clone, Debug)]
pub struct WireResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Debug)]
pub struct TransferFailure {
    pub message: String,
}

/// One completed transfer, keyed by the handle's identity.
#[derive(Debug)]
pub struct TransferOutcome {
    pub transfer_id: u64,
    pub result: Result<WireResponse, TransferFailure>,
}

/// A reusable transfer slot owned by one driver. Identity is the small
/// integer assigned at allocation; the engine keys its active set on it.
pub trait TransferHandle: Send {
    fn transfer_id(&self) -> u64;

    /// Loads the request the next admission will run.
    fn configure(&mut self, config: TransferConfig);

    /// Clears configured request state (headers, auth, body). Connection
    /// state survives a reset; that is what makes pooling worthwhile.
    fn reset(&mut self);

    /// Releases every resource the handle owns. A closed handle must not be
    /// admitted again.
    fn close(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The multiplexed transfer engine the dispatcher drives. Behavioral
/// contract:
///
/// - `admit` takes ownership of a configured handle and starts its transfer;
///   the handle stays owned by the driver until `reclaim`.
/// - `perform` does one unit of immediate work and returns `true` while
///   calling again right away could make further progress.
/// - `wait_ready` blocks until a completion is available or the timeout
///   elapses, whichever is first.
/// - `drain` hands back every completion observed so far, at most once each.
/// - `reclaim` returns the handle for a completed transfer to the caller.
pub trait TransferDriver: Send {
    fn allocate(&mut self) -> Box<dyn TransferHandle>;

    fn admit(&mut self, handle: Box<dyn TransferHandle>) -> Result<(), Error>;

    fn perform(&mut self) -> bool;

    fn wait_ready(&mut self, timeout: Duration);

    fn drain(&mut self) -> Vec<TransferOutcome>;

    fn reclaim(&mut self, transfer_id: u64) -> Option<Box<dyn TransferHandle>>;

    fn close(&mut self);
}
