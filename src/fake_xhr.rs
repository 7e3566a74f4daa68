use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::event_target::{Event, EventTarget, Listener, ListenerOptions};
use crate::virtual_clock::{AmbientScheduler, TimerId};
use crate::{Error, Result};

pub const RESPONSE_BODY_CHUNK_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

impl ReadyState {
    pub fn code(self) -> u8 {
        match self {
            Self::Unsent => 0,
            Self::Opened => 1,
            Self::HeadersReceived => 2,
            Self::Loading => 3,
            Self::Done => 4,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsent => "UNSENT",
            Self::Opened => "OPENED",
            Self::HeadersReceived => "HEADERS_RECEIVED",
            Self::Loading => "LOADING",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

// Response and request payloads are opaque: the crate moves them around
// and reports their length, never parses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

impl Body {
    pub fn text(value: &str) -> Self {
        Self::Text(value.to_string())
    }

    pub fn binary(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }

    pub fn unit_len(&self) -> usize {
        match self {
            Self::Text(value) => value.chars().count(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unit_len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(value) => value.as_bytes(),
            Self::Binary(bytes) => bytes.as_slice(),
        }
    }

    pub fn into_binary(self) -> Vec<u8> {
        match self {
            Self::Text(value) => value.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    fn empty_like(&self) -> Body {
        match self {
            Self::Text(_) => Self::Text(String::new()),
            Self::Binary(_) => Self::Binary(Vec::new()),
        }
    }

    fn chunks(&self, chunk_size: usize) -> Vec<Body> {
        match self {
            Self::Text(value) => {
                let chars: Vec<char> = value.chars().collect();
                chars
                    .chunks(chunk_size)
                    .map(|chunk| Self::Text(chunk.iter().collect()))
                    .collect()
            }
            Self::Binary(bytes) => bytes
                .chunks(chunk_size)
                .map(|chunk| Self::Binary(chunk.to_vec()))
                .collect(),
        }
    }

    fn extend(&mut self, chunk: &Body) {
        match (self, chunk) {
            (Self::Text(value), Self::Text(chunk)) => value.push_str(chunk),
            (Self::Binary(bytes), Self::Binary(chunk)) => bytes.extend_from_slice(chunk),
            (this, chunk) => *this = chunk.clone(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TerminalKind {
    Load,
    Timeout,
    Abort,
}

struct XhrState {
    ready_state: ReadyState,
    method: String,
    url: String,
    is_async: bool,
    request_headers: Vec<(String, String)>,
    request_body: Option<Body>,
    sent: bool,
    status: u16,
    status_text: String,
    response_headers: Vec<(String, String)>,
    response_body: Body,
    timeout_ms: i64,
    sent_at_ms: Option<i64>,
    timeout_timer: Option<TimerId>,
    timed_out: bool,
    aborted: bool,
    terminal_fired: bool,
}

impl XhrState {
    fn unsent() -> Self {
        Self {
            ready_state: ReadyState::Unsent,
            method: String::new(),
            url: String::new(),
            is_async: true,
            request_headers: Vec::new(),
            request_body: None,
            sent: false,
            status: 0,
            status_text: String::new(),
            response_headers: Vec::new(),
            response_body: Body::Text(String::new()),
            timeout_ms: 0,
            sent_at_ms: None,
            timeout_timer: None,
            timed_out: false,
            aborted: false,
            terminal_fired: false,
        }
    }
}

type XhrHandler = Rc<dyn Fn(&FakeXhr)>;
pub(crate) type SendHook = Rc<dyn Fn(&Rc<FakeXhr>) -> Result<()>>;

#[derive(Default)]
struct XhrHandlers {
    ready_state_change: Option<XhrHandler>,
    load: Option<XhrHandler>,
    timeout: Option<XhrHandler>,
    abort: Option<XhrHandler>,
}

pub struct FakeXhr {
    events: EventTarget,
    scheduler: AmbientScheduler,
    state: RefCell<XhrState>,
    handlers: RefCell<XhrHandlers>,
    send_hook: RefCell<Option<SendHook>>,
    self_weak: RefCell<Weak<FakeXhr>>,
}

impl FakeXhr {
    pub fn create(scheduler: &AmbientScheduler) -> Rc<Self> {
        let xhr = Rc::new(Self {
            events: EventTarget::new(),
            scheduler: scheduler.clone(),
            state: RefCell::new(XhrState::unsent()),
            handlers: RefCell::new(XhrHandlers::default()),
            send_hook: RefCell::new(None),
            self_weak: RefCell::new(Weak::new()),
        });
        *xhr.self_weak.borrow_mut() = Rc::downgrade(&xhr);
        xhr
    }

    pub fn events(&self) -> &EventTarget {
        &self.events
    }

    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Result<()> {
        self.events.add_event_listener(event_type, listener)
    }

    pub fn add_event_listener_with_options(
        &self,
        event_type: &str,
        listener: &Listener,
        options: ListenerOptions,
    ) -> Result<()> {
        self.events
            .add_event_listener_with_options(event_type, listener, options)
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) {
        self.events.remove_event_listener(event_type, listener);
    }

    pub fn dispatch_event(&self, event: &Event) -> Result<bool> {
        self.events.dispatch_event(event)
    }

    pub fn open(&self, method: &str, url: &str) -> Result<()> {
        self.open_with_async(method, url, true)
    }

    // Reopening is allowed from any state and starts a fresh lifecycle.
    pub fn open_with_async(&self, method: &str, url: &str, is_async: bool) -> Result<()> {
        if method.is_empty() {
            return Err(Error::InvalidArgument(
                "open requires a non-empty method".into(),
            ));
        }
        if url.is_empty() {
            return Err(Error::InvalidArgument("open requires a non-empty url".into()));
        }
        self.cancel_timeout_timer();
        {
            let mut state = self.state.borrow_mut();
            *state = XhrState::unsent();
            state.ready_state = ReadyState::Opened;
            state.method = method.to_string();
            state.url = url.to_string();
            state.is_async = is_async;
        }
        self.ready_state_change()
    }

    pub fn set_request_header(&self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "set_request_header requires a non-empty name".into(),
            ));
        }
        let mut state = self.state.borrow_mut();
        if state.ready_state != ReadyState::Opened || state.sent {
            return Err(invalid_state("set_request_header", &state));
        }
        if let Some(entry) = state
            .request_headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            entry.1 = format!("{}, {value}", entry.1);
        } else {
            state.request_headers.push((name.to_string(), value.to_string()));
        }
        Ok(())
    }

    pub fn set_timeout_ms(&self, timeout_ms: i64) -> Result<()> {
        if timeout_ms < 0 {
            return Err(Error::InvalidArgument(
                "timeout must be non-negative milliseconds".into(),
            ));
        }
        self.state.borrow_mut().timeout_ms = timeout_ms;
        Ok(())
    }

    pub fn send(&self, body: Option<Body>) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.ready_state != ReadyState::Opened || state.sent {
                return Err(invalid_state("send", &state));
            }
            state.sent = true;
            state.request_body = body;
            if let Some(now_ms) = self.scheduler.now_ms() {
                state.sent_at_ms = Some(now_ms);
            }
        }
        self.ready_state_change()?;
        self.events
            .dispatch_event(&Event::progress("loadstart", 0, 0))?;
        self.schedule_timeout_timer();
        let hook = self.send_hook.borrow().clone();
        if let Some(hook) = hook {
            if let Some(this) = self.self_weak.borrow().upgrade() {
                // A tracking server resolves synchronous requests in here,
                // before send returns.
                hook(&this)?;
            }
        }
        Ok(())
    }

    pub fn respond(&self, status: u16, headers: &[(&str, &str)], body: Body) -> Result<()> {
        if self.resolution_suppressed() {
            return Ok(());
        }
        self.set_response_headers(status, headers)?;
        self.deliver_body(body)
    }

    pub fn set_response_headers(&self, status: u16, headers: &[(&str, &str)]) -> Result<()> {
        if status == 0 {
            return Err(Error::InvalidArgument(
                "respond requires a positive status code".into(),
            ));
        }
        {
            let mut state = self.state.borrow_mut();
            if state.ready_state != ReadyState::Opened || !state.sent {
                return Err(invalid_state("respond", &state));
            }
            state.status = status;
            state.status_text = status_text_for(status).to_string();
            state.response_headers = headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            state.ready_state = ReadyState::HeadersReceived;
        }
        self.ready_state_change()
    }

    fn deliver_body(&self, body: Body) -> Result<()> {
        let total = body.unit_len() as u64;
        {
            let mut state = self.state.borrow_mut();
            if state.ready_state != ReadyState::HeadersReceived {
                return Err(invalid_state("deliver_body", &state));
            }
            state.response_body = body.empty_like();
            state.ready_state = ReadyState::Loading;
        }
        let chunks = body.chunks(RESPONSE_BODY_CHUNK_SIZE);
        for chunk in &chunks {
            self.state.borrow_mut().response_body.extend(chunk);
            self.ready_state_change()?;
            let loaded = self.state.borrow().response_body.unit_len() as u64;
            self.events
                .dispatch_event(&Event::progress("progress", loaded, total))?;
        }
        if chunks.is_empty() {
            // LOADING is observable even for an empty body.
            self.ready_state_change()?;
        }
        self.finish(TerminalKind::Load)
    }

    pub fn trigger_timeout(&self) -> Result<()> {
        let pending = {
            let state = self.state.borrow();
            state.sent && !state.terminal_fired
        };
        if !pending {
            return Ok(());
        }
        self.finish(TerminalKind::Timeout)
    }

    pub fn abort(&self) -> Result<()> {
        let pending = {
            let mut state = self.state.borrow_mut();
            state.aborted = true;
            let pending = state.sent && !state.terminal_fired;
            if !pending {
                // Nothing in flight: fall back to UNSENT without events;
                // the request must be reopened before reuse.
                state.ready_state = ReadyState::Unsent;
                state.sent = false;
            }
            pending
        };
        if !pending {
            return Ok(());
        }
        self.finish(TerminalKind::Abort)
    }

    // Exactly one terminal event (load, timeout, or abort) per lifecycle.
    fn finish(&self, kind: TerminalKind) -> Result<()> {
        let loaded = {
            let mut state = self.state.borrow_mut();
            if state.terminal_fired {
                return Ok(());
            }
            state.terminal_fired = true;
            match kind {
                TerminalKind::Timeout => state.timed_out = true,
                TerminalKind::Abort => state.aborted = true,
                TerminalKind::Load => {}
            }
            state.ready_state = ReadyState::Done;
            state.response_body.unit_len() as u64
        };
        self.cancel_timeout_timer();
        self.ready_state_change()?;
        match kind {
            TerminalKind::Load => {
                self.events
                    .dispatch_event(&Event::progress("load", loaded, loaded))?;
                self.run_handler(|handlers| handlers.load.clone());
                self.events
                    .dispatch_event(&Event::progress("loadend", loaded, loaded))?;
            }
            TerminalKind::Timeout => {
                self.events.dispatch_event(&Event::new("timeout"))?;
                self.run_handler(|handlers| handlers.timeout.clone());
                self.events
                    .dispatch_event(&Event::progress("loadend", 0, 0))?;
            }
            TerminalKind::Abort => {
                self.events.dispatch_event(&Event::new("abort"))?;
                self.run_handler(|handlers| handlers.abort.clone());
                self.events
                    .dispatch_event(&Event::progress("loadend", 0, 0))?;
            }
        }
        Ok(())
    }

    fn resolution_suppressed(&self) -> bool {
        let state = self.state.borrow();
        state.timed_out || state.aborted
    }

    fn ready_state_change(&self) -> Result<()> {
        self.events.dispatch_event(&Event::new("readystatechange"))?;
        self.run_handler(|handlers| handlers.ready_state_change.clone());
        Ok(())
    }

    fn run_handler(&self, pick: impl Fn(&XhrHandlers) -> Option<XhrHandler>) {
        let handler = pick(&self.handlers.borrow());
        if let Some(handler) = handler {
            handler(self);
        }
    }

    fn schedule_timeout_timer(&self) {
        let timeout_ms = {
            let state = self.state.borrow();
            if !state.sent || state.terminal_fired || state.timeout_ms <= 0 {
                return;
            }
            state.timeout_ms
        };
        let Some(clock) = self.scheduler.installed_clock() else {
            return;
        };
        let weak: Weak<FakeXhr> = self.self_weak.borrow().clone();
        let timer_id = clock.set_timeout(
            move || {
                if let Some(xhr) = weak.upgrade() {
                    let _ = xhr.trigger_timeout();
                }
            },
            timeout_ms,
        );
        self.state.borrow_mut().timeout_timer = Some(timer_id);
    }

    fn cancel_timeout_timer(&self) {
        let timer = self.state.borrow_mut().timeout_timer.take();
        if let Some(timer_id) = timer {
            if let Some(clock) = self.scheduler.installed_clock() {
                clock.clear_timer(timer_id);
            }
        }
    }

    pub(crate) fn set_send_hook(&self, hook: Option<SendHook>) {
        *self.send_hook.borrow_mut() = hook;
    }

    pub fn set_on_ready_state_change(&self, handler: impl Fn(&FakeXhr) + 'static) {
        self.handlers.borrow_mut().ready_state_change = Some(Rc::new(handler));
    }

    pub fn set_on_load(&self, handler: impl Fn(&FakeXhr) + 'static) {
        self.handlers.borrow_mut().load = Some(Rc::new(handler));
    }

    pub fn set_on_timeout(&self, handler: impl Fn(&FakeXhr) + 'static) {
        self.handlers.borrow_mut().timeout = Some(Rc::new(handler));
    }

    pub fn set_on_abort(&self, handler: impl Fn(&FakeXhr) + 'static) {
        self.handlers.borrow_mut().abort = Some(Rc::new(handler));
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.borrow().ready_state
    }

    pub fn method(&self) -> String {
        self.state.borrow().method.clone()
    }

    pub fn url(&self) -> String {
        self.state.borrow().url.clone()
    }

    pub fn is_async(&self) -> bool {
        self.state.borrow().is_async
    }

    pub fn sent(&self) -> bool {
        self.state.borrow().sent
    }

    pub fn status(&self) -> u16 {
        self.state.borrow().status
    }

    pub fn status_text(&self) -> String {
        self.state.borrow().status_text.clone()
    }

    pub fn response_text(&self) -> String {
        match &self.state.borrow().response_body {
            Body::Text(value) => value.clone(),
            Body::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn response_body(&self) -> Body {
        self.state.borrow().response_body.clone()
    }

    pub fn response_header(&self, name: &str) -> Option<String> {
        self.state
            .borrow()
            .response_headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    pub fn all_response_headers(&self) -> String {
        self.state
            .borrow()
            .response_headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect()
    }

    pub fn request_header(&self, name: &str) -> Option<String> {
        self.state
            .borrow()
            .request_headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    pub fn request_body(&self) -> Option<Body> {
        self.state.borrow().request_body.clone()
    }

    pub fn timeout_ms(&self) -> i64 {
        self.state.borrow().timeout_ms
    }

    pub fn sent_at_ms(&self) -> Option<i64> {
        self.state.borrow().sent_at_ms
    }

    pub fn timed_out(&self) -> bool {
        self.state.borrow().timed_out
    }

    pub fn aborted(&self) -> bool {
        self.state.borrow().aborted
    }
}

fn invalid_state(operation: &str, state: &XhrState) -> Error {
    Error::InvalidState {
        operation: operation.to_string(),
        detail: format!("ready_state={} sent={}", state.ready_state, state.sent),
    }
}

fn status_text_for(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
