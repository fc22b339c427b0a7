mod availability;
mod config;
mod engine;
mod error;
mod logger;
mod notifier;
mod params;
mod protocol;
mod sanitizer;
mod scheduler;
mod session;
mod transport;
mod types;
mod writes;

pub use availability::MAX_ERRORS;
pub use config::{EngineConfig, BASE_TICK, SET_WAIT};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, PartialFailure, Result, ValidationError};
pub use logger::MessageLogMode;
pub use notifier::{SensorsCallback, StatusCallback, SubscriptionId};
pub use params::{BaseParam, ParamKey, MAX_ZONES};
pub use protocol::{WriteTarget, DEFAULT_BASE_URL};
pub use sanitizer::ZERO_TOLERANCE;
pub use scheduler::{BACKOFF_FACTOR, ERROR_BACKOFF_THRESHOLD};
pub use transport::{Clock, HttpResponse, HttpTransport, SystemClock, Transport};
pub use types::*;
pub use writes::{PendingWrite, DEFAULT_MAX_RETRIES};
