use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::promise::{Promise, Resolution, Settlement, TickFn};
use crate::util::lock_unpoisoned;

/// Uniform per-input record produced by [`Promise::all_settled`].
#[derive(Clone, Debug)]
pub enum SettledOutcome<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> SettledOutcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

fn first_tick<T>(promises: &[Promise<T>]) -> Option<TickFn>
where
    T: Clone + Send + 'static,
{
    promises.iter().find_map(Promise::tick_fn)
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Fulfills with every input's value in input order once all inputs
    /// fulfill; rejects the instant any input rejects. An empty input
    /// fulfills with an empty collection.
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let result: Promise<Vec<T>> = Promise::pending(first_tick(&promises));
        if promises.is_empty() {
            result.settle(Settlement::Fulfilled(Vec::new()));
            return result;
        }

        let count = promises.len();
        let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; count]));
        let remaining = Arc::new(AtomicUsize::new(count));

        for (index, promise) in promises.iter().enumerate() {
            let result = result.clone();
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            promise.subscribe(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    lock_unpoisoned(&slots)[index] = Some(value);
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        let values: Option<Vec<T>> =
                            lock_unpoisoned(&slots).iter_mut().map(Option::take).collect();
                        if let Some(values) = values {
                            result.settle(Settlement::Fulfilled(values));
                        }
                    }
                }
                Settlement::Rejected(error) => {
                    result.settle(Settlement::Rejected(error));
                }
            });
        }
        result
    }

    /// Fulfills once every input settles, with one outcome record per input
    /// in input order. Never rejects.
    pub fn all_settled(promises: Vec<Promise<T>>) -> Promise<Vec<SettledOutcome<T>>> {
        let result: Promise<Vec<SettledOutcome<T>>> = Promise::pending(first_tick(&promises));
        if promises.is_empty() {
            result.settle(Settlement::Fulfilled(Vec::new()));
            return result;
        }

        let count = promises.len();
        let slots: Arc<Mutex<Vec<Option<SettledOutcome<T>>>>> =
            Arc::new(Mutex::new(vec![None; count]));
        let remaining = Arc::new(AtomicUsize::new(count));

        for (index, promise) in promises.iter().enumerate() {
            let result = result.clone();
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            promise.subscribe(move |settlement| {
                let outcome = match settlement {
                    Settlement::Fulfilled(value) => SettledOutcome::Fulfilled(value),
                    Settlement::Rejected(error) => SettledOutcome::Rejected(error),
                };
                lock_unpoisoned(&slots)[index] = Some(outcome);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let outcomes: Option<Vec<SettledOutcome<T>>> =
                        lock_unpoisoned(&slots).iter_mut().map(Option::take).collect();
                    if let Some(outcomes) = outcomes {
                        result.settle(Settlement::Fulfilled(outcomes));
                    }
                }
            });
        }
        result
    }

    /// Fulfills with the first fulfilled input; rejects with an aggregate
    /// error only when every input rejects. An empty input rejects.
    pub fn any(promises: Vec<Promise<T>>) -> Promise<T> {
        let result = Promise::pending(first_tick(&promises));
        if promises.is_empty() {
            result.settle(Settlement::Rejected(Error::Aggregate {
                reasons: Vec::new(),
            }));
            return result;
        }

        let count = promises.len();
        let reasons: Arc<Mutex<Vec<Option<Error>>>> = Arc::new(Mutex::new(vec![None; count]));
        let remaining = Arc::new(AtomicUsize::new(count));

        for (index, promise) in promises.iter().enumerate() {
            let result = result.clone();
            let reasons = Arc::clone(&reasons);
            let remaining = Arc::clone(&remaining);
            promise.subscribe(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    result.settle(Settlement::Fulfilled(value));
                }
                Settlement::Rejected(error) => {
                    lock_unpoisoned(&reasons)[index] = Some(error);
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        let collected: Vec<Error> = lock_unpoisoned(&reasons)
                            .iter_mut()
                            .filter_map(Option::take)
                            .collect();
                        result.settle(Settlement::Rejected(Error::Aggregate {
                            reasons: collected,
                        }));
                    }
                }
            });
        }
        result
    }

    /// Settles with the first settlement, fulfilled or rejected. An empty
    /// input stays pending.
    pub fn race(promises: Vec<Promise<T>>) -> Promise<T> {
        let result = Promise::pending(first_tick(&promises));
        for promise in &promises {
            let result = result.clone();
            promise.subscribe(move |settlement| result.settle(settlement));
        }
        result
    }

    /// Fulfills with `value` after `duration` has elapsed.
    pub fn delay(duration: Duration, value: T) -> Promise<T> {
        let result = Promise::pending(None);
        let target = result.clone();
        thread::spawn(move || {
            thread::sleep(duration);
            target.settle(Settlement::Fulfilled(value));
        });
        result
    }

    /// Runs `operation` immediately and captures its outcome as a promise:
    /// a value fulfills, a returned promise is adopted, an error rejects.
    pub fn try_with<F>(operation: F) -> Promise<T>
    where
        F: FnOnce() -> Result<Resolution<T>, Error>,
    {
        match operation() {
            Ok(Resolution::Value(value)) => Promise::resolved(value),
            Ok(Resolution::Pending(promise)) => promise,
            Err(error) => Promise::rejected(error),
        }
    }
}
