use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::fake_server::{FakeServer, Reply};
use crate::fake_xhr::FakeXhr;
use crate::virtual_clock::{AmbientScheduler, VirtualClock};
use crate::Result;

// Wraps a FakeServer so that responding also advances the virtual clock
// far enough to fire every timer the code under test scheduled while the
// request was in flight.
pub struct ServerWithClock {
    server: FakeServer,
    scheduler: AmbientScheduler,
    clock: RefCell<Option<VirtualClock>>,
    owns_clock: Cell<bool>,
    observing: Cell<bool>,
    longest_timeout: Rc<Cell<i64>>,
}

impl ServerWithClock {
    pub fn create(scheduler: &AmbientScheduler) -> Self {
        Self {
            server: FakeServer::create(),
            scheduler: scheduler.clone(),
            clock: RefCell::new(None),
            owns_clock: Cell::new(false),
            observing: Cell::new(false),
            longest_timeout: Rc::new(Cell::new(0)),
        }
    }

    pub fn add_request(&self, request: &Rc<FakeXhr>) -> Result<()> {
        if request.is_async() {
            self.attach_clock()?;
        }
        self.server.add_request(request);
        Ok(())
    }

    pub fn respond(&self) -> Result<usize> {
        let resolved = self.server.respond()?;
        let clock = self.clock.borrow().clone();
        if let Some(clock) = clock {
            // A single tick by everything observed since the last cycle;
            // the counter resets so later cycles never replay it.
            let advance_ms = self.longest_timeout.replace(0);
            clock.tick(advance_ms)?;
        }
        Ok(resolved)
    }

    pub fn respond_with(&self, reply: Reply) {
        self.server.respond_with(reply);
    }

    pub fn respond_with_url(&self, url: &str, reply: Reply) {
        self.server.respond_with_url(url, reply);
    }

    pub fn respond_with_pattern(&self, pattern: &str, reply: Reply) -> Result<()> {
        self.server.respond_with_pattern(pattern, reply)
    }

    pub fn respond_with_method(&self, method: &str, url: &str, reply: Reply) {
        self.server.respond_with_method(method, url, reply);
    }

    pub fn longest_timeout(&self) -> i64 {
        self.longest_timeout.get()
    }

    pub fn clock(&self) -> Option<VirtualClock> {
        self.clock.borrow().clone()
    }

    pub fn server(&self) -> &FakeServer {
        &self.server
    }

    pub fn restore(&self) {
        if let Some(clock) = self.clock.borrow_mut().take() {
            if self.observing.get() {
                clock.set_schedule_observer(None);
                self.observing.set(false);
            }
            if self.owns_clock.get() {
                self.scheduler.uninstall_clock();
                self.owns_clock.set(false);
            }
        }
        self.longest_timeout.set(0);
        self.server.restore();
    }

    fn attach_clock(&self) -> Result<()> {
        if self.clock.borrow().is_some() {
            return Ok(());
        }
        let clock = match self.scheduler.installed_clock() {
            // A pre-existing clock is adopted, never owned.
            Some(existing) => existing,
            None => {
                let installed = self.scheduler.install_clock()?;
                self.owns_clock.set(true);
                installed
            }
        };
        if !self.observing.get() {
            let longest = Rc::clone(&self.longest_timeout);
            clock.set_schedule_observer(Some(Rc::new(move |delay_ms| {
                longest.set(longest.get().max(delay_ms));
            })));
            self.observing.set(true);
        }
        *self.clock.borrow_mut() = Some(clock);
        Ok(())
    }
}
