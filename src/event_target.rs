use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    None,
    Progress { loaded: u64, total: u64 },
    Custom { detail: String },
}

#[derive(Debug)]
pub struct Event {
    event_type: String,
    default_prevented: Cell<bool>,
    payload: EventPayload,
}

impl Event {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            default_prevented: Cell::new(false),
            payload: EventPayload::None,
        }
    }

    pub fn progress(event_type: &str, loaded: u64, total: u64) -> Self {
        Self {
            event_type: event_type.to_string(),
            default_prevented: Cell::new(false),
            payload: EventPayload::Progress { loaded, total },
        }
    }

    pub fn custom(event_type: &str, detail: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            default_prevented: Cell::new(false),
            payload: EventPayload::Custom {
                detail: detail.to_string(),
            },
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }

    pub fn loaded(&self) -> u64 {
        match self.payload {
            EventPayload::Progress { loaded, .. } => loaded,
            _ => 0,
        }
    }

    pub fn total(&self) -> u64 {
        match self.payload {
            EventPayload::Progress { total, .. } => total,
            _ => 0,
        }
    }

    pub fn length_computable(&self) -> bool {
        matches!(self.payload, EventPayload::Progress { total, .. } if total > 0)
    }

    pub fn detail(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Custom { detail } => Some(detail.as_str()),
            _ => None,
        }
    }
}

pub trait HandleEvent {
    fn handle_event(&self, event: &Event);
}

enum ListenerKind {
    Callback(Box<dyn Fn(&Event)>),
    Handler(Box<dyn HandleEvent>),
    Inert,
}

// Identity is handle identity: two clones of the same Listener compare
// equal, two separately constructed listeners never do.
#[derive(Clone)]
pub struct Listener {
    kind: Rc<ListenerKind>,
}

impl Listener {
    pub fn callback(callback: impl Fn(&Event) + 'static) -> Self {
        Self {
            kind: Rc::new(ListenerKind::Callback(Box::new(callback))),
        }
    }

    pub fn handler(handler: impl HandleEvent + 'static) -> Self {
        Self {
            kind: Rc::new(ListenerKind::Handler(Box::new(handler))),
        }
    }

    pub fn inert() -> Self {
        Self {
            kind: Rc::new(ListenerKind::Inert),
        }
    }

    pub fn same(&self, other: &Listener) -> bool {
        Rc::ptr_eq(&self.kind, &other.kind)
    }

    fn invoke(&self, event: &Event) -> Result<()> {
        match &*self.kind {
            ListenerKind::Callback(callback) => {
                callback(event);
                Ok(())
            }
            ListenerKind::Handler(handler) => {
                handler.handle_event(event);
                Ok(())
            }
            ListenerKind::Inert => Err(Error::InvalidListener(format!(
                "listener for {:?} has no invocation capability",
                event.event_type()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub capture: bool,
    pub once: bool,
    pub passive: bool,
}

struct Registration {
    listener: Listener,
    options: ListenerOptions,
}

#[derive(Default)]
pub struct EventTarget {
    listeners: RefCell<HashMap<String, Vec<Registration>>>,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Result<()> {
        self.add_event_listener_with_options(event_type, listener, ListenerOptions::default())
    }

    pub fn add_event_listener_with_options(
        &self,
        event_type: &str,
        listener: &Listener,
        options: ListenerOptions,
    ) -> Result<()> {
        if event_type.is_empty() {
            return Err(Error::InvalidArgument(
                "event type must be a non-empty string".into(),
            ));
        }
        let mut listeners = self.listeners.borrow_mut();
        let entries = listeners.entry(event_type.to_string()).or_default();
        // The first registration for a (listener, capture) pair wins; a
        // re-registration cannot retroactively change its options.
        let duplicate = entries
            .iter()
            .any(|entry| entry.listener.same(listener) && entry.options.capture == options.capture);
        if duplicate {
            return Ok(());
        }
        entries.push(Registration {
            listener: listener.clone(),
            options,
        });
        Ok(())
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) {
        let mut listeners = self.listeners.borrow_mut();
        let Some(entries) = listeners.get_mut(event_type) else {
            return;
        };
        if let Some(pos) = entries.iter().position(|entry| entry.listener.same(listener)) {
            entries.remove(pos);
            if entries.is_empty() {
                listeners.remove(event_type);
            }
        }
    }

    pub fn dispatch_event(&self, event: &Event) -> Result<bool> {
        let snapshot: Vec<(Listener, ListenerOptions)> = self
            .listeners
            .borrow()
            .get(event.event_type())
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| (entry.listener.clone(), entry.options))
                    .collect()
            })
            .unwrap_or_default();

        for (listener, options) in snapshot {
            if options.once {
                // Removed before invocation so re-entrant dispatch cannot
                // re-trigger it and re-registration inside the listener
                // survives to the next dispatch.
                self.remove_once_registration(event.event_type(), &listener, options.capture);
            }
            stacker::maybe_grow(32 * 1024, 1024 * 1024, || listener.invoke(event))?;
        }
        Ok(event.default_prevented())
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .borrow()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove_once_registration(&self, event_type: &str, listener: &Listener, capture: bool) {
        let mut listeners = self.listeners.borrow_mut();
        let Some(entries) = listeners.get_mut(event_type) else {
            return;
        };
        if let Some(pos) = entries.iter().position(|entry| {
            entry.listener.same(listener) && entry.options.once && entry.options.capture == capture
        }) {
            entries.remove(pos);
            if entries.is_empty() {
                listeners.remove(event_type);
            }
        }
    }
}
