use std::cell::RefCell;
use std::rc::Rc;

use fancy_regex::Regex;

use crate::fake_xhr::{Body, FakeXhr, ReadyState};
use crate::{Error, Result};

pub type Responder = Rc<dyn Fn(&Rc<FakeXhr>) -> Result<()>>;

#[derive(Clone)]
pub enum Reply {
    Fixed {
        status: u16,
        headers: Vec<(String, String)>,
        body: Body,
    },
    Dynamic(Responder),
}

impl Reply {
    pub fn text(body: &str) -> Self {
        Self::Fixed {
            status: 200,
            headers: Vec::new(),
            body: Body::text(body),
        }
    }

    pub fn with_status(status: u16, headers: &[(&str, &str)], body: Body) -> Self {
        Self::Fixed {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body,
        }
    }

    pub fn dynamic(responder: impl Fn(&Rc<FakeXhr>) -> Result<()> + 'static) -> Self {
        Self::Dynamic(Rc::new(responder))
    }
}

enum UrlMatcher {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl UrlMatcher {
    fn matches(&self, url: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == url,
            Self::Pattern(regex) => regex.is_match(url).unwrap_or(false),
        }
    }
}

struct Route {
    method: Option<String>,
    url: UrlMatcher,
    reply: Reply,
}

impl Route {
    fn matches(&self, method: &str, url: &str) -> bool {
        let method_matches = self
            .method
            .as_deref()
            .map(|expected| expected.eq_ignore_ascii_case(method))
            .unwrap_or(true);
        method_matches && self.url.matches(url)
    }
}

#[derive(Default)]
struct ServerState {
    requests: Vec<Rc<FakeXhr>>,
    queue: Vec<Rc<FakeXhr>>,
    routes: Vec<Route>,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Rc<RefCell<ServerState>>,
}

impl FakeServer {
    pub fn create() -> Self {
        Self {
            state: Rc::new(RefCell::new(ServerState::default())),
        }
    }

    pub fn add_request(&self, request: &Rc<FakeXhr>) {
        self.state.borrow_mut().requests.push(Rc::clone(request));
        let state = Rc::downgrade(&self.state);
        request.set_send_hook(Some(Rc::new(move |request: &Rc<FakeXhr>| {
            let Some(state) = state.upgrade() else {
                return Ok(());
            };
            if request.is_async() {
                state.borrow_mut().queue.push(Rc::clone(request));
                Ok(())
            } else {
                // Synchronous requests resolve before send returns.
                let reply = find_reply(&state, request);
                apply_reply(reply, request)
            }
        })));
    }

    pub fn respond_with(&self, reply: Reply) {
        self.push_route(None, UrlMatcher::Any, reply);
    }

    pub fn respond_with_url(&self, url: &str, reply: Reply) {
        self.push_route(None, UrlMatcher::Exact(url.to_string()), reply);
    }

    pub fn respond_with_pattern(&self, pattern: &str, reply: Reply) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|err| {
            Error::InvalidArgument(format!("invalid url pattern {pattern:?}: {err}"))
        })?;
        self.push_route(None, UrlMatcher::Pattern(regex), reply);
        Ok(())
    }

    pub fn respond_with_method(&self, method: &str, url: &str, reply: Reply) {
        self.push_route(
            Some(method.to_string()),
            UrlMatcher::Exact(url.to_string()),
            reply,
        );
    }

    pub fn respond(&self) -> Result<usize> {
        // Requests sent while responses run are queued for the next call.
        let queued: Vec<Rc<FakeXhr>> = std::mem::take(&mut self.state.borrow_mut().queue);
        let mut resolved = 0usize;
        for request in queued {
            if request.aborted() || request.timed_out() {
                continue;
            }
            if request.ready_state() == ReadyState::Done || !request.sent() {
                continue;
            }
            let reply = find_reply(&self.state, &request);
            apply_reply(reply, &request)?;
            resolved += 1;
        }
        Ok(resolved)
    }

    pub fn request_count(&self) -> usize {
        self.state.borrow().requests.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn requests(&self) -> Vec<Rc<FakeXhr>> {
        self.state.borrow().requests.clone()
    }

    pub fn restore(&self) {
        let requests = {
            let mut state = self.state.borrow_mut();
            state.queue.clear();
            state.routes.clear();
            std::mem::take(&mut state.requests)
        };
        for request in requests {
            request.set_send_hook(None);
        }
    }

    fn push_route(&self, method: Option<String>, url: UrlMatcher, reply: Reply) {
        self.state.borrow_mut().routes.push(Route { method, url, reply });
    }
}

fn find_reply(state: &RefCell<ServerState>, request: &Rc<FakeXhr>) -> Option<Reply> {
    let state = state.borrow();
    let method = request.method();
    let url = request.url();
    // Later registrations shadow earlier ones.
    state
        .routes
        .iter()
        .rev()
        .find(|route| route.matches(&method, &url))
        .map(|route| route.reply.clone())
}

fn apply_reply(reply: Option<Reply>, request: &Rc<FakeXhr>) -> Result<()> {
    match reply {
        Some(Reply::Fixed {
            status,
            headers,
            body,
        }) => {
            let headers: Vec<(&str, &str)> = headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            request.respond(status, &headers, body)
        }
        Some(Reply::Dynamic(responder)) => responder(request),
        None => request.respond(404, &[], Body::text("")),
    }
}
