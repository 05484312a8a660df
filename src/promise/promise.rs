use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Driver pump invoked while blocking in [`Promise::wait`], so waiting on a
/// promise advances the engine that will eventually settle it.
pub(crate) type TickFn = Arc<dyn Fn() + Send + Sync>;

const WAIT_SPIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a `then`/`catch` handler hands back: either an immediate value or a
/// promise the derived promise should adopt (transparent unwrapping).
pub enum Resolution<T> {
    Value(T),
    Pending(Promise<T>),
}

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

pub(crate) enum Settlement<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T: Clone> Clone for Settlement<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fulfilled(value) => Self::Fulfilled(value.clone()),
            Self::Rejected(error) => Self::Rejected(error.clone()),
        }
    }
}

type Handler<T> = Box<dyn FnOnce(Settlement<T>) + Send>;

struct Shared<T> {
    state: State<T>,
    handlers: Vec<Handler<T>>,
    tick: Option<TickFn>,
}

/// A settable-once future. The state moves from pending to fulfilled or
/// rejected exactly once; handlers registered before settlement run in
/// registration order at the settle event, handlers registered afterwards
/// run synchronously during registration.
pub struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub(crate) fn pending(tick: Option<TickFn>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: State::Pending,
                handlers: Vec::new(),
                tick,
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: State::Fulfilled(value),
                handlers: Vec::new(),
                tick: None,
            })),
        }
    }

    pub fn rejected(error: Error) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: State::Rejected(error),
                handlers: Vec::new(),
                tick: None,
            })),
        }
    }

    pub fn state(&self) -> PromiseState {
        match lock_unpoisoned(&self.shared).state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == PromiseState::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == PromiseState::Rejected
    }

    pub(crate) fn tick_fn(&self) -> Option<TickFn> {
        lock_unpoisoned(&self.shared).tick.clone()
    }

    pub(crate) fn set_tick(&self, tick: Option<TickFn>) {
        lock_unpoisoned(&self.shared).tick = tick;
    }

    /// Settles the promise. Only the first call takes effect; handlers are
    /// invoked after the state lock is released so they may freely create
    /// or settle other promises.
    pub(crate) fn settle(&self, settlement: Settlement<T>) {
        let handlers = {
            let mut shared = lock_unpoisoned(&self.shared);
            if !matches!(shared.state, State::Pending) {
                return;
            }
            shared.state = match &settlement {
                Settlement::Fulfilled(value) => State::Fulfilled(value.clone()),
                Settlement::Rejected(error) => State::Rejected(error.clone()),
            };
            std::mem::take(&mut shared.handlers)
        };

        for handler in handlers {
            handler(settlement.clone());
        }
    }

    /// Registers a settlement observer. Runs synchronously right away when
    /// the promise is already settled.
    pub(crate) fn subscribe<F>(&self, handler: F)
    where
        F: FnOnce(Settlement<T>) + Send + 'static,
    {
        let settlement = {
            let mut shared = lock_unpoisoned(&self.shared);
            match &shared.state {
                State::Pending => {
                    shared.handlers.push(Box::new(handler));
                    return;
                }
                State::Fulfilled(value) => Settlement::Fulfilled(value.clone()),
                State::Rejected(error) => Settlement::Rejected(error.clone()),
            }
        };
        handler(settlement);
    }

    /// Forwards this promise's eventual settlement into `target`.
    pub(crate) fn pipe_into(&self, target: Promise<T>) {
        self.subscribe(move |settlement| target.settle(settlement));
    }

    /// Chains a fulfillment handler. The derived promise fulfills with the
    /// handler's value, adopts a returned promise, or rejects with the
    /// handler's error; a rejection of this promise passes through.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U>, Error> + Send + 'static,
    {
        let derived = Promise::pending(self.tick_fn());
        let downstream = derived.clone();
        self.subscribe(move |settlement| match settlement {
            Settlement::Fulfilled(value) => match on_fulfilled(value) {
                Ok(Resolution::Value(next)) => downstream.settle(Settlement::Fulfilled(next)),
                Ok(Resolution::Pending(promise)) => promise.pipe_into(downstream),
                Err(error) => downstream.settle(Settlement::Rejected(error)),
            },
            Settlement::Rejected(error) => downstream.settle(Settlement::Rejected(error)),
        });
        derived
    }

    /// Chains a rejection handler; fulfillment passes through untouched.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Result<Resolution<T>, Error> + Send + 'static,
    {
        let derived = Promise::pending(self.tick_fn());
        let downstream = derived.clone();
        self.subscribe(move |settlement| match settlement {
            Settlement::Fulfilled(value) => downstream.settle(Settlement::Fulfilled(value)),
            Settlement::Rejected(error) => match on_rejected(error) {
                Ok(Resolution::Value(next)) => downstream.settle(Settlement::Fulfilled(next)),
                Ok(Resolution::Pending(promise)) => promise.pipe_into(downstream),
                Err(error) => downstream.settle(Settlement::Rejected(error)),
            },
        });
        derived
    }

    /// Runs `on_finally` on either settlement and forwards the original
    /// outcome unchanged, unless `on_finally` itself fails, in which case
    /// its error replaces the outcome.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let derived = Promise::pending(self.tick_fn());
        let downstream = derived.clone();
        self.subscribe(move |settlement| match on_finally() {
            Ok(()) => downstream.settle(settlement),
            Err(error) => downstream.settle(Settlement::Rejected(error)),
        });
        derived
    }

    /// Blocks until settlement or until the timeout elapses. While waiting,
    /// the bound driver tick is pumped when present; otherwise the wait
    /// spins on state with a short sleep.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Error> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let tick = self.tick_fn();

        loop {
            {
                let shared = lock_unpoisoned(&self.shared);
                match &shared.state {
                    State::Fulfilled(value) => return Ok(value.clone()),
                    State::Rejected(error) => return Err(error.clone()),
                    State::Pending => {}
                }
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(Error::WaitTimeout {
                    timeout_ms: timeout.unwrap_or_default().as_millis(),
                });
            }

            if let Some(tick) = &tick {
                tick();
            }
            thread::sleep(WAIT_SPIN_INTERVAL);
        }
    }
}
