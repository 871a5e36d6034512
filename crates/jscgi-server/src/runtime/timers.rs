//! Script timers
//!
//! `setTimeout`, `setInterval` and `setImmediate` are backed by tasks on the
//! worker's `LocalSet`. A timer task only sleeps and then posts its id on a
//! channel; the callback itself runs when the runtime pumps that channel,
//! with the context borrowed exactly once (see `ScriptRuntime::drive`).
//!
//! All scheduling functions must be called from within a `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

use boa_engine::object::JsObject;
use boa_engine::value::JsValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Identifier handed back to scripts by the scheduling functions.
pub type TimerId = u32;

/// Receiving end of timer expirations.
pub type FiredReceiver = mpsc::UnboundedReceiver<TimerId>;

struct Timer {
    callback: JsObject,
    args: Vec<JsValue>,
    repeating: bool,
    task: AbortHandle,
}

pub struct TimerQueue {
    next_id: Cell<TimerId>,
    timers: RefCell<HashMap<TimerId, Timer>>,
    fired: mpsc::UnboundedSender<TimerId>,
}

impl TimerQueue {
    pub fn new() -> (Self, FiredReceiver) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: Cell::new(1),
                timers: RefCell::new(HashMap::new()),
                fired,
            },
            rx,
        )
    }

    /// Schedules `callback` after `delay`, repeating every `delay` when
    /// `repeating` is set.
    pub fn schedule(
        &self,
        callback: JsObject,
        args: Vec<JsValue>,
        delay: Duration,
        repeating: bool,
    ) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1).max(1));

        let fired = self.fired.clone();
        let task = tokio::task::spawn_local(async move {
            if repeating {
                // Zero-period intervals would spin the event loop
                let period = delay.max(Duration::from_millis(1));
                loop {
                    tokio::time::sleep(period).await;
                    if fired.send(id).is_err() {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(delay).await;
                let _ = fired.send(id);
            }
        });

        self.timers.borrow_mut().insert(
            id,
            Timer {
                callback,
                args,
                repeating,
                task: task.abort_handle(),
            },
        );
        id
    }

    /// Cancels a timer. Unknown ids are ignored, like in browsers and Node.
    pub fn clear(&self, id: TimerId) -> bool {
        match self.timers.borrow_mut().remove(&id) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Claims an expired timer's callback.
    ///
    /// One-shot timers are removed; intervals stay registered. Returns `None`
    /// when the timer was cleared after its expiry was already posted.
    pub fn take_due(&self, id: TimerId) -> Option<(JsObject, Vec<JsValue>)> {
        let mut timers = self.timers.borrow_mut();
        let repeating = timers.get(&id)?.repeating;
        if repeating {
            let timer = timers.get(&id)?;
            Some((timer.callback.clone(), timer.args.clone()))
        } else {
            let timer = timers.remove(&id)?;
            Some((timer.callback, timer.args))
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        for (_, timer) in self.timers.borrow_mut().drain() {
            timer.task.abort();
        }
    }
}
