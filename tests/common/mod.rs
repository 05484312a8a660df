#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use pledge::{
    TransferConfig, TransferDriver, TransferFailure, TransferHandle, TransferOutcome, WireResponse,
};

/// One scripted reply, matched by request path and consumed in order; the
/// last reply for a path repeats once the script runs dry.
#[derive(Clone)]
pub struct ScriptedReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub hold: Duration,
    pub transport_error: Option<String>,
}

impl ScriptedReply {
    pub fn ok(body: &str) -> Self {
        Self::status_with_body(200, body)
    }

    pub fn status(status: u16) -> Self {
        Self::status_with_body(status, "")
    }

    pub fn status_with_body(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_owned(),
            hold: Duration::ZERO,
            transport_error: None,
        }
    }

    pub fn transport_error(message: &str) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: String::new(),
            hold: Duration::ZERO,
            transport_error: Some(message.to_owned()),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    fn into_result(self) -> Result<WireResponse, TransferFailure> {
        if let Some(message) = self.transport_error {
            return Err(TransferFailure { message });
        }
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name: HeaderName = name.parse().expect("scripted header name");
            let value = HeaderValue::from_str(value).expect("scripted header value");
            headers.append(name, value);
        }
        Ok(WireResponse {
            status: StatusCode::from_u16(self.status).expect("scripted status code"),
            headers,
            body: Bytes::from(self.body),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ObservedAttempt {
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
struct MockLog {
    attempts: Vec<ObservedAttempt>,
    high_water: usize,
    allocated: usize,
    closed_handles: usize,
}

struct MockState {
    routes: HashMap<String, Vec<ScriptedReply>>,
    fallback: ScriptedReply,
    log: MockLog,
}

/// Shared script and observation log. Every driver built by
/// [`MockScript::factory`] consumes the same script, so a client rebuilt by
/// a `with_*` method keeps serving the same scripted exchange.
#[derive(Clone)]
pub struct MockScript {
    state: Arc<Mutex<MockState>>,
}

impl MockScript {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                routes: HashMap::new(),
                fallback: ScriptedReply::ok(""),
                log: MockLog::default(),
            })),
        }
    }

    pub fn route(&self, path: &str, replies: Vec<ScriptedReply>) {
        let mut state = self.state.lock().expect("lock mock state");
        state.routes.insert(path.to_owned(), replies);
    }

    pub fn fallback(&self, reply: ScriptedReply) {
        self.state.lock().expect("lock mock state").fallback = reply;
    }

    pub fn factory(
        &self,
    ) -> impl Fn() -> Box<dyn TransferDriver> + Send + Sync + 'static {
        let state = Arc::clone(&self.state);
        move || {
            Box::new(MockDriver {
                state: Arc::clone(&state),
                running: Vec::new(),
                parked: HashMap::new(),
                completed: Vec::new(),
                next_id: 1,
            }) as Box<dyn TransferDriver>
        }
    }

    pub fn attempts(&self) -> Vec<ObservedAttempt> {
        self.state.lock().expect("lock mock state").log.attempts.clone()
    }

    pub fn attempt_count(&self, path: &str) -> usize {
        self.attempts()
            .iter()
            .filter(|attempt| attempt.path == path)
            .count()
    }

    pub fn high_water(&self) -> usize {
        self.state.lock().expect("lock mock state").log.high_water
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().expect("lock mock state").log.allocated
    }

    pub fn closed_handles(&self) -> usize {
        self.state.lock().expect("lock mock state").log.closed_handles
    }
}

fn path_of(url: &str) -> String {
    let after_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    let path = match after_scheme.find('/') {
        Some(index) => &after_scheme[index..],
        None => "/",
    };
    match path.find('?') {
        Some(index) => path[..index].to_owned(),
        None => path.to_owned(),
    }
}

struct MockHandle {
    id: u64,
    config: Option<TransferConfig>,
    state: Arc<Mutex<MockState>>,
}

impl TransferHandle for MockHandle {
    fn transfer_id(&self) -> u64 {
        self.id
    }

    fn configure(&mut self, config: TransferConfig) {
        self.config = Some(config);
    }

    fn reset(&mut self) {
        self.config = None;
    }

    fn close(&mut self) {
        self.state.lock().expect("lock mock state").log.closed_handles += 1;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct RunningTransfer {
    transfer_id: u64,
    ready_at: Instant,
    result: Result<WireResponse, TransferFailure>,
}

struct MockDriver {
    state: Arc<Mutex<MockState>>,
    running: Vec<RunningTransfer>,
    parked: HashMap<u64, Box<dyn TransferHandle>>,
    completed: Vec<TransferOutcome>,
    next_id: u64,
}

impl TransferDriver for MockDriver {
    fn allocate(&mut self) -> Box<dyn TransferHandle> {
        let id = self.next_id;
        self.next_id += 1;
        self.state.lock().expect("lock mock state").log.allocated += 1;
        Box::new(MockHandle {
            id,
            config: None,
            state: Arc::clone(&self.state),
        })
    }

    fn admit(&mut self, mut handle: Box<dyn TransferHandle>) -> Result<(), pledge::Error> {
        let transfer_id = handle.transfer_id();
        let config = handle
            .as_any_mut()
            .downcast_mut::<MockHandle>()
            .and_then(|mock| mock.config.clone())
            .expect("mock handle admitted without configuration");

        let path = path_of(&config.url);
        let reply = {
            let mut state = self.state.lock().expect("lock mock state");
            let scripted = match state.routes.get_mut(&path) {
                Some(replies) if replies.len() > 1 => Some(replies.remove(0)),
                Some(replies) => replies.first().cloned(),
                None => None,
            };
            let reply = scripted.unwrap_or_else(|| state.fallback.clone());
            state.log.attempts.push(ObservedAttempt {
                method: config.method.to_string(),
                url: config.url.clone(),
                path,
                headers: config
                    .headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_owned(),
                            value.to_str().unwrap_or_default().to_owned(),
                        )
                    })
                    .collect(),
                body: config
                    .body
                    .as_ref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
                at: Instant::now(),
            });
            reply
        };

        self.running.push(RunningTransfer {
            transfer_id,
            ready_at: Instant::now() + reply.hold,
            result: reply.into_result(),
        });
        let in_flight = self.running.len();
        {
            let mut state = self.state.lock().expect("lock mock state");
            if in_flight > state.log.high_water {
                state.log.high_water = in_flight;
            }
        }
        self.parked.insert(transfer_id, handle);
        Ok(())
    }

    fn perform(&mut self) -> bool {
        let now = Instant::now();
        let mut progressed = false;
        let mut index = 0;
        while index < self.running.len() {
            if self.running[index].ready_at <= now {
                let transfer = self.running.remove(index);
                self.completed.push(TransferOutcome {
                    transfer_id: transfer.transfer_id,
                    result: transfer.result,
                });
                progressed = true;
            } else {
                index += 1;
            }
        }
        progressed
    }

    fn wait_ready(&mut self, timeout: Duration) {
        if !self.completed.is_empty() {
            return;
        }
        let now = Instant::now();
        let next_ready = self.running.iter().map(|transfer| transfer.ready_at).min();
        match next_ready {
            Some(ready_at) if ready_at > now => {
                std::thread::sleep((ready_at - now).min(timeout));
            }
            Some(_) => {}
            None => std::thread::sleep(timeout),
        }
    }

    fn drain(&mut self) -> Vec<TransferOutcome> {
        self.perform();
        std::mem::take(&mut self.completed)
    }

    fn reclaim(&mut self, transfer_id: u64) -> Option<Box<dyn TransferHandle>> {
        self.parked.remove(&transfer_id)
    }

    fn close(&mut self) {
        for (_, mut handle) in self.parked.drain() {
            handle.close();
        }
        self.running.clear();
        self.completed.clear();
    }
}
