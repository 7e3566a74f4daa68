use std::error::Error as StdError;
use std::fmt;
use std::sync::OnceLock;

mod event_target;
mod fake_server;
mod fake_xhr;
mod server_with_clock;
mod virtual_clock;

pub use event_target::{Event, EventPayload, EventTarget, HandleEvent, Listener, ListenerOptions};
pub use fake_server::{FakeServer, Reply, Responder};
pub use fake_xhr::{Body, FakeXhr, ReadyState, RESPONSE_BODY_CHUNK_SIZE};
pub use server_with_clock::ServerWithClock;
pub use virtual_clock::{AmbientScheduler, PendingTimer, TimerId, VirtualClock};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidState { operation: String, detail: String },
    InvalidListener(String),
    InvalidArgument(String),
    DuplicateInstallation(String),
    Timer(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, detail } => {
                write!(f, "invalid state for {operation}: {detail}")
            }
            Self::InvalidListener(msg) => write!(f, "invalid listener: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::DuplicateInstallation(msg) => {
                write!(f, "duplicate clock installation: {msg}")
            }
            Self::Timer(msg) => write!(f, "timer error: {msg}"),
        }
    }
}

impl StdError for Error {}

static BINARY_PAYLOADS: OnceLock<bool> = OnceLock::new();

// Probed once per process; a construction failure means "unsupported",
// never an error. Consumers branch on this before using Body::Binary.
pub fn binary_payloads_supported() -> bool {
    *BINARY_PAYLOADS.get_or_init(|| {
        std::panic::catch_unwind(|| {
            let blob = Body::binary(&[]);
            let _ = blob.as_bytes();
            let _ = Body::text("").into_binary();
            true
        })
        .unwrap_or(false)
    })
}
