use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tracing::{debug, warn};

use crate::driver::{TransferConfig, TransferDriver, TransferOutcome};
use crate::error::Error;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::options::Options;
use crate::pool::HandlePool;
use crate::promise::{Deferred, Promise, TickFn};
use crate::response::Response;
use crate::retry::{AttemptOutcome, RetryPolicy};
use crate::util::{host_key, lock_unpoisoned};

const DRIVER_WAIT_BOUND: Duration = Duration::from_millis(1);

/// A request after resolution against the client options: absolute url,
/// wire-ready headers, serialized body, 1-based attempt counter.
#[derive(Clone, Debug)]
pub(crate) struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) attempt: usize,
}

struct ActiveEntry {
    deferred: Deferred<Response>,
    request: PreparedRequest,
    host: String,
}

struct QueuedEntry {
    deferred: Deferred<Response>,
    request: PreparedRequest,
    enqueued_at: Instant,
    not_before: Instant,
}

/// Settlements collected while the state lock is held and delivered after
/// it is released, so promise handlers can re-enter the engine.
type Settlements = Vec<(Deferred<Response>, Result<Response, Error>)>;

struct EngineState {
    driver: Box<dyn TransferDriver>,
    pool: HandlePool,
    active: HashMap<u64, ActiveEntry>,
    queue: VecDeque<QueuedEntry>,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
    options: Options,
    metrics: ClientMetrics,
}

pub(crate) struct Engine {
    state: Arc<Mutex<EngineState>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Engine {
    pub(crate) fn new(
        driver: Box<dyn TransferDriver>,
        options: &Options,
        metrics: ClientMetrics,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                driver,
                pool: HandlePool::new(options.max_pool_size()),
                active: HashMap::new(),
                queue: VecDeque::new(),
                max_concurrent: options.max_concurrent().max(1),
                retry_policy: RetryPolicy::from_options(options),
                options: options.clone(),
                metrics,
            })),
        }
    }

    /// The pump handed to promises created by this engine. Holds the state
    /// weakly so an orphaned promise cannot keep a torn-down engine alive.
    pub(crate) fn tick_fn(&self) -> TickFn {
        let state = Arc::downgrade(&self.state);
        Arc::new(move || {
            if let Some(state) = state.upgrade() {
                run_tick(&state);
            }
        })
    }

    /// Admits the request when a slot is free, queues it otherwise, and
    /// returns the caller-visible promise.
    pub(crate) fn submit(&self, request: PreparedRequest) -> Promise<Response> {
        let deferred = Deferred::with_tick(Some(self.tick_fn()));
        let promise = deferred.promise();
        let mut settlements = Settlements::new();
        {
            let mut state = lock_unpoisoned(&self.state);
            state.metrics.record_submitted();
            if state.active.len() < state.max_concurrent {
                start_transfer(&mut state, deferred, request, &mut settlements);
            } else {
                debug!(url = %request.url, "concurrency cap reached, queueing request");
                let now = Instant::now();
                state.queue.push_back(QueuedEntry {
                    deferred,
                    request,
                    enqueued_at: now,
                    not_before: now,
                });
            }
        }
        deliver(settlements);
        promise
    }

    /// One unit of forward progress: admit, drive the transfer engine until
    /// it goes quiet, demux completions, admit again.
    pub(crate) fn tick(&self) {
        run_tick(&self.state);
    }

    /// Ticks until nothing is active or queued, or until the wall-clock
    /// budget runs out. Yields on the driver readiness primitive while
    /// transfers are in flight rather than spinning.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            run_tick(&self.state);

            let (outstanding, in_flight) = {
                let state = lock_unpoisoned(&self.state);
                (state.active.len() + state.queue.len(), state.active.len())
            };
            if outstanding == 0 {
                return;
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return;
            }

            if in_flight > 0 {
                let mut state = lock_unpoisoned(&self.state);
                state.driver.wait_ready(DRIVER_WAIT_BOUND);
            } else {
                thread::sleep(DRIVER_WAIT_BOUND);
            }
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        let state = lock_unpoisoned(&self.state);
        !state.active.is_empty() || !state.queue.is_empty()
    }

    pub(crate) fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.state).active.len()
    }

    pub(crate) fn queued_count(&self) -> usize {
        lock_unpoisoned(&self.state).queue.len()
    }

    pub(crate) fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = lock_unpoisoned(&self.state);
        state
            .metrics
            .snapshot(state.active.len() as u64, state.queue.len() as u64)
    }
}

fn run_tick(state: &Arc<Mutex<EngineState>>) {
    let mut settlements = Settlements::new();
    {
        let mut guard = lock_unpoisoned(state);
        admit_eligible(&mut guard, &mut settlements);
        while guard.driver.perform() {}
        for outcome in guard.driver.drain() {
            complete_transfer(&mut guard, outcome, &mut settlements);
        }
        admit_eligible(&mut guard, &mut settlements);
    }
    deliver(settlements);
}

fn deliver(settlements: Settlements) {
    for (deferred, outcome) in settlements {
        match outcome {
            Ok(response) => deferred.resolve(response),
            Err(error) => deferred.reject(error),
        }
    }
}

/// FIFO admission, except that entries whose `not_before` has not elapsed
/// are stepped over and stay in order for a later tick.
fn admit_eligible(state: &mut EngineState, settlements: &mut Settlements) {
    let now = Instant::now();
    let mut index = 0;
    while index < state.queue.len() {
        if state.active.len() >= state.max_concurrent {
            break;
        }
        if state.queue[index].not_before <= now {
            if let Some(entry) = state.queue.remove(index) {
                debug!(
                    url = %entry.request.url,
                    queued_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "admitting queued request"
                );
                start_transfer(state, entry.deferred, entry.request, settlements);
            }
        } else {
            index += 1;
        }
    }
}

fn start_transfer(
    state: &mut EngineState,
    deferred: Deferred<Response>,
    request: PreparedRequest,
    settlements: &mut Settlements,
) {
    let parsed: Uri = match request.url.parse() {
        Ok(uri) => uri,
        Err(_) => {
            state.metrics.record_failure();
            settlements.push((
                deferred,
                Err(Error::InvalidUrl {
                    url: request.url.clone(),
                }),
            ));
            return;
        }
    };
    let Some(host) = host_key(&parsed) else {
        state.metrics.record_failure();
        settlements.push((
            deferred,
            Err(Error::InvalidUrl {
                url: request.url.clone(),
            }),
        ));
        return;
    };

    let mut handle = match state.pool.acquire(&host) {
        Some(handle) => handle,
        None => state.driver.allocate(),
    };
    handle.configure(TransferConfig {
        method: request.method.clone(),
        url: request.url.clone(),
        headers: request.headers.clone(),
        body: request.body.clone(),
        connect_timeout: state.options.connect_timeout(),
        read_timeout: state.options.read_timeout(),
        follow_redirects: state.options.follow_redirects(),
        max_redirects: state.options.max_redirects(),
        verify_tls: state.options.verify_tls(),
        proxy: state.options.proxy().map(ToOwned::to_owned),
        http2: state.options.http2(),
        tcp_keep_alive: state.options.tcp_keep_alive(),
    });

    let transfer_id = handle.transfer_id();
    match state.driver.admit(handle) {
        Ok(()) => {
            state.active.insert(
                transfer_id,
                ActiveEntry {
                    deferred,
                    request,
                    host,
                },
            );
        }
        Err(error) => {
            state.metrics.record_failure();
            settlements.push((deferred, Err(error)));
        }
    }
}

fn complete_transfer(
    state: &mut EngineState,
    outcome: TransferOutcome,
    settlements: &mut Settlements,
) {
    let Some(entry) = state.active.remove(&outcome.transfer_id) else {
        warn!(
            transfer_id = outcome.transfer_id,
            "completion for unknown transfer, skipping"
        );
        return;
    };
    if let Some(handle) = state.driver.reclaim(outcome.transfer_id) {
        state.pool.release(handle, &entry.host);
    }

    let ActiveEntry {
        deferred, request, ..
    } = entry;

    match outcome.result {
        Ok(wire) => {
            let attempt_outcome = AttemptOutcome::Response {
                status: wire.status,
                headers: &wire.headers,
            };
            match state
                .retry_policy
                .assess(request.attempt, &request.method, &attempt_outcome)
            {
                Some(delay) => schedule_retry(state, deferred, request, delay),
                None => {
                    let response = Response::new(
                        wire.status,
                        wire.headers,
                        wire.body,
                        request.url,
                        request.method,
                    );
                    state.metrics.record_success();
                    settlements.push((deferred, Ok(response)));
                }
            }
        }
        Err(failure) => {
            match state.retry_policy.assess(
                request.attempt,
                &request.method,
                &AttemptOutcome::TransportError,
            ) {
                Some(delay) => schedule_retry(state, deferred, request, delay),
                None => {
                    state.metrics.record_failure();
                    settlements.push((
                        deferred,
                        Err(Error::Transport {
                            method: request.method,
                            url: request.url,
                            message: failure.message,
                        }),
                    ));
                }
            }
        }
    }
}

/// Re-queues the request with its original deferred and an admission floor,
/// so the retry delay never blocks the engine.
fn schedule_retry(
    state: &mut EngineState,
    deferred: Deferred<Response>,
    mut request: PreparedRequest,
    delay: Duration,
) {
    request.attempt += 1;
    state.metrics.record_retry();
    debug!(
        url = %request.url,
        attempt = request.attempt,
        delay_ms = delay.as_millis() as u64,
        "scheduling retry"
    );
    let now = Instant::now();
    state.queue.push_back(QueuedEntry {
        deferred,
        request,
        enqueued_at: now,
        not_before: now + delay,
    });
}

impl Drop for EngineState {
    fn drop(&mut self) {
        let transfer_ids: Vec<u64> = self.active.keys().copied().collect();
        for transfer_id in transfer_ids {
            if let Some(mut handle) = self.driver.reclaim(transfer_id) {
                handle.close();
            }
        }
        self.active.clear();
        self.pool.close_all();
        self.driver.close();
        // Queued deferreds are left pending on teardown; see DESIGN.md.
    }
}
