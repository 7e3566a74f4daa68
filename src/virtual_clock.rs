use std::cell::RefCell;
use std::rc::Rc;

use crate::{Error, Result};

pub type TimerId = i64;

type TimerCallback = Rc<dyn Fn()>;
pub type ScheduleObserver = Rc<dyn Fn(i64)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: TimerId,
    pub due_at: i64,
    pub order: i64,
    pub interval_ms: Option<i64>,
}

struct ScheduledTimer {
    id: TimerId,
    due_at: i64,
    order: i64,
    interval_ms: Option<i64>,
    callback: TimerCallback,
}

struct ClockState {
    now_ms: i64,
    task_queue: Vec<ScheduledTimer>,
    next_timer_id: i64,
    next_order: i64,
    step_limit: usize,
    running_timer_id: Option<TimerId>,
    running_timer_canceled: bool,
    observer: Option<ScheduleObserver>,
    trace: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

#[derive(Clone)]
pub struct VirtualClock {
    state: Rc<RefCell<ClockState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ClockState {
                now_ms: 0,
                task_queue: Vec::new(),
                next_timer_id: 1,
                next_order: 0,
                step_limit: 10_000,
                running_timer_id: None,
                running_timer_canceled: false,
                observer: None,
                trace: false,
                trace_logs: Vec::new(),
                trace_log_limit: 10_000,
                trace_to_stderr: false,
            })),
        }
    }

    pub fn ptr_eq(&self, other: &VirtualClock) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub fn now_ms(&self) -> i64 {
        self.state.borrow().now_ms
    }

    pub fn set_timeout(&self, callback: impl Fn() + 'static, delay_ms: i64) -> TimerId {
        self.schedule(Rc::new(callback), delay_ms, None)
    }

    pub fn set_interval(&self, callback: impl Fn() + 'static, delay_ms: i64) -> TimerId {
        let delay_ms = delay_ms.max(0);
        self.schedule(Rc::new(callback), delay_ms, Some(delay_ms))
    }

    fn schedule(
        &self,
        callback: TimerCallback,
        delay_ms: i64,
        interval_ms: Option<i64>,
    ) -> TimerId {
        let delay_ms = delay_ms.max(0);
        let (id, due_at, observer) = {
            let mut state = self.state.borrow_mut();
            let id = state.next_timer_id;
            state.next_timer_id += 1;
            let order = state.next_order;
            state.next_order += 1;
            let due_at = state.now_ms.saturating_add(delay_ms);
            state.task_queue.push(ScheduledTimer {
                id,
                due_at,
                order,
                interval_ms,
                callback,
            });
            (id, due_at, state.observer.clone())
        };
        if let Some(observer) = observer {
            observer(delay_ms);
        }
        let interval_desc = interval_ms
            .map(|value| value.to_string())
            .unwrap_or_else(|| "none".into());
        self.trace_line(format!(
            "[timer] schedule id={id} due_at={due_at} interval_ms={interval_desc}"
        ));
        id
    }

    pub fn clear_timer(&self, timer_id: TimerId) -> bool {
        let existed = {
            let mut state = self.state.borrow_mut();
            let existed = state.running_timer_id == Some(timer_id)
                || state.task_queue.iter().any(|task| task.id == timer_id);
            if state.running_timer_id == Some(timer_id) {
                state.running_timer_canceled = true;
            }
            state.task_queue.retain(|task| task.id != timer_id);
            existed
        };
        self.trace_line(format!("[timer] clear id={timer_id} existed={existed}"));
        existed
    }

    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let mut timers = self
            .state
            .borrow()
            .task_queue
            .iter()
            .map(|task| PendingTimer {
                id: task.id,
                due_at: task.due_at,
                order: task.order,
                interval_ms: task.interval_ms,
            })
            .collect::<Vec<_>>();
        timers.sort_by_key(|timer| (timer.due_at, timer.order));
        timers
    }

    pub fn tick(&self, delta_ms: i64) -> Result<()> {
        if delta_ms < 0 {
            return Err(Error::Timer(
                "tick requires non-negative milliseconds".into(),
            ));
        }
        let from = {
            let mut state = self.state.borrow_mut();
            let from = state.now_ms;
            state.now_ms = state.now_ms.saturating_add(delta_ms);
            from
        };
        let ran = self.run_due_timers()?;
        self.trace_line(format!(
            "[timer] tick delta_ms={delta_ms} from={from} to={} ran_due={ran}",
            self.now_ms()
        ));
        Ok(())
    }

    pub fn set_step_limit(&self, max_steps: usize) -> Result<()> {
        if max_steps == 0 {
            return Err(Error::InvalidArgument(
                "set_step_limit requires at least 1 step".into(),
            ));
        }
        self.state.borrow_mut().step_limit = max_steps;
        Ok(())
    }

    pub fn set_schedule_observer(&self, observer: Option<ScheduleObserver>) {
        self.state.borrow_mut().observer = observer;
    }

    pub fn set_trace(&self, enabled: bool) {
        self.state.borrow_mut().trace = enabled;
    }

    pub fn set_trace_stderr(&self, enabled: bool) {
        self.state.borrow_mut().trace_to_stderr = enabled;
    }

    pub fn set_trace_log_limit(&self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::InvalidArgument(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        let mut state = self.state.borrow_mut();
        state.trace_log_limit = max_entries;
        while state.trace_logs.len() > state.trace_log_limit {
            state.trace_logs.remove(0);
        }
        Ok(())
    }

    pub fn take_trace_logs(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().trace_logs)
    }

    fn run_due_timers(&self) -> Result<usize> {
        let mut steps = 0usize;
        loop {
            let task = {
                let mut state = self.state.borrow_mut();
                let due_limit = state.now_ms;
                let Some(idx) = next_task_index(&state.task_queue, due_limit) else {
                    break;
                };
                steps += 1;
                if steps > state.step_limit {
                    return Err(step_limit_error(&state, steps));
                }
                let task = state.task_queue.remove(idx);
                state.running_timer_id = Some(task.id);
                state.running_timer_canceled = false;
                task
            };

            let interval_desc = task
                .interval_ms
                .map(|value| value.to_string())
                .unwrap_or_else(|| "none".into());
            self.trace_line(format!(
                "[timer] run id={} due_at={} interval_ms={} now_ms={}",
                task.id,
                task.due_at,
                interval_desc,
                self.now_ms()
            ));

            (task.callback)();

            let canceled = {
                let mut state = self.state.borrow_mut();
                let canceled = state.running_timer_canceled;
                state.running_timer_id = None;
                state.running_timer_canceled = false;
                canceled
            };

            if let Some(interval_ms) = task.interval_ms {
                if !canceled {
                    let due_at = task.due_at.saturating_add(interval_ms);
                    let mut state = self.state.borrow_mut();
                    let order = state.next_order;
                    state.next_order += 1;
                    state.task_queue.push(ScheduledTimer {
                        id: task.id,
                        due_at,
                        order,
                        interval_ms: Some(interval_ms),
                        callback: task.callback,
                    });
                }
            }
        }
        Ok(steps)
    }

    fn trace_line(&self, line: String) {
        let mut state = self.state.borrow_mut();
        if !state.trace {
            return;
        }
        if state.trace_to_stderr {
            eprintln!("{line}");
        }
        state.trace_logs.push(line);
        while state.trace_logs.len() > state.trace_log_limit {
            state.trace_logs.remove(0);
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

fn next_task_index(task_queue: &[ScheduledTimer], due_limit: i64) -> Option<usize> {
    task_queue
        .iter()
        .enumerate()
        .filter(|(_, task)| task.due_at <= due_limit)
        .min_by_key(|(_, task)| (task.due_at, task.order))
        .map(|(idx, _)| idx)
}

fn step_limit_error(state: &ClockState, steps: usize) -> Error {
    let next_task_desc = next_task_index(&state.task_queue, state.now_ms)
        .and_then(|idx| state.task_queue.get(idx))
        .map(|task| {
            let interval_desc = task
                .interval_ms
                .map(|value| value.to_string())
                .unwrap_or_else(|| "none".into());
            format!(
                "id={},due_at={},order={},interval_ms={}",
                task.id, task.due_at, task.order, interval_desc
            )
        })
        .unwrap_or_else(|| "none".into());

    Error::Timer(format!(
        "tick exceeded max timer steps (possible uncleared interval): limit={}, steps={steps}, now_ms={}, pending_timers={}, next_timer={}",
        state.step_limit,
        state.now_ms,
        state.task_queue.len(),
        next_task_desc
    ))
}

// The stand-in for the ambient setTimeout/setInterval registration
// functions: components observe and install clocks through an explicit
// handle instead of mutating process globals. Clones share one slot.
#[derive(Clone, Default)]
pub struct AmbientScheduler {
    installed: Rc<RefCell<Option<VirtualClock>>>,
}

impl AmbientScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_clock(&self) -> Result<VirtualClock> {
        let mut installed = self.installed.borrow_mut();
        if installed.is_some() {
            return Err(Error::DuplicateInstallation(
                "a virtual clock is already installed; adopt it instead".into(),
            ));
        }
        let clock = VirtualClock::new();
        *installed = Some(clock.clone());
        Ok(clock)
    }

    pub fn installed_clock(&self) -> Option<VirtualClock> {
        self.installed.borrow().clone()
    }

    pub fn uninstall_clock(&self) -> Option<VirtualClock> {
        self.installed.borrow_mut().take()
    }

    pub fn set_timeout(&self, callback: impl Fn() + 'static, delay_ms: i64) -> Result<TimerId> {
        match self.installed_clock() {
            Some(clock) => Ok(clock.set_timeout(callback, delay_ms)),
            None => Err(Error::Timer(
                "set_timeout requires an installed virtual clock".into(),
            )),
        }
    }

    pub fn set_interval(&self, callback: impl Fn() + 'static, delay_ms: i64) -> Result<TimerId> {
        match self.installed_clock() {
            Some(clock) => Ok(clock.set_interval(callback, delay_ms)),
            None => Err(Error::Timer(
                "set_interval requires an installed virtual clock".into(),
            )),
        }
    }

    pub fn clear_timer(&self, timer_id: TimerId) -> bool {
        self.installed_clock()
            .map(|clock| clock.clear_timer(timer_id))
            .unwrap_or(false)
    }

    pub fn now_ms(&self) -> Option<i64> {
        self.installed_clock().map(|clock| clock.now_ms())
    }
}
