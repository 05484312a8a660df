mod combinators;
mod deferred;
mod promise;

pub use self::combinators::SettledOutcome;
pub use self::deferred::Deferred;
pub use self::promise::{Promise, PromiseState, Resolution};

pub(crate) use self::promise::{Settlement, TickFn};
