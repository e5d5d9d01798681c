//! Scheduler for timed events.
//!
//! Time is measured in CPU cycles. The executing core counts `downcount` down from the current
//! slice length; when it reaches zero (or the core otherwise yields), the slice is ended by
//! [`System::advance`], which runs every due event and starts the next slice, never longer than
//! the distance to the next event.

use std::sync::Arc;

use gekko::Cycles;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::state::Archive;
use crate::system::System;

/// An event callback. Receives the event's userdata and how late it is being run.
pub type Callback = fn(&mut System, u64, Cycles);

/// A registered kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(u32);

impl EventType {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The thread an event is being scheduled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromThread {
    /// The CPU thread. The event is inserted directly.
    Cpu,
    /// Any other thread. The event is queued and moved into the schedule at the start of the
    /// next slice, so it runs at a deterministic cycle.
    NonCpu,
    /// Whichever applies: events are inserted directly when on the CPU thread or when the CPU
    /// is not running.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Event {
    cycle: u64,
    /// Insertion order, to keep events scheduled for the same cycle in FIFO order.
    order: u64,
    ty: EventType,
    userdata: u64,
}

#[derive(Debug, Clone, Copy)]
struct RemoteEvent {
    cycles: u64,
    ty: EventType,
    userdata: u64,
}

/// Queue of events scheduled from other threads.
#[derive(Debug, Clone, Default)]
pub struct RemoteQueue(Arc<Mutex<Vec<RemoteEvent>>>);

impl RemoteQueue {
    /// Queues an event to run `cycles` after the start of the next slice.
    pub fn push(&self, cycles: u64, ty: EventType, userdata: u64) {
        self.0.lock().push(RemoteEvent {
            cycles,
            ty,
            userdata,
        });
    }

    fn take(&self) -> Vec<RemoteEvent> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// The event scheduler.
#[derive(Debug)]
pub struct Scheduler {
    types: IndexMap<String, Callback>,
    /// Pending events, sorted so that the next one is the last.
    events: Vec<Event>,
    next_order: u64,
    /// Cycles elapsed up to the start of the current slice.
    elapsed: u64,
    slice_length: i32,
    max_slice: i32,
    /// Whether events are being run, in which case the current time is exactly `elapsed`.
    advancing: bool,
    remote: RemoteQueue,
}

impl Scheduler {
    pub fn new(max_slice: u32) -> Self {
        let max_slice = max_slice.clamp(1, i32::MAX as u32) as i32;
        Self {
            types: IndexMap::new(),
            events: Vec::new(),
            next_order: 0,
            elapsed: 0,
            slice_length: 0,
            max_slice,
            advancing: false,
            remote: RemoteQueue::default(),
        }
    }

    /// Registers an event type. Registering a name twice returns the same type, with the
    /// callback replaced.
    pub fn register(&mut self, name: &str, callback: Callback) -> EventType {
        let (index, previous) = self.types.insert_full(name.to_owned(), callback);
        if previous.is_some() {
            tracing::debug!(name, "event type registered again");
        }

        EventType(index as u32)
    }

    /// Name of an event type.
    pub fn name(&self, ty: EventType) -> Option<&str> {
        self.types.get_index(ty.index()).map(|(name, _)| name.as_str())
    }

    fn callback(&self, ty: EventType) -> Option<Callback> {
        self.types.get_index(ty.index()).map(|(_, callback)| *callback)
    }

    /// Cycles elapsed up to the start of the current slice.
    #[inline(always)]
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    #[inline(always)]
    pub fn slice_length(&self) -> i32 {
        self.slice_length
    }

    #[inline(always)]
    pub fn is_advancing(&self) -> bool {
        self.advancing
    }

    /// Current time, given the downcount of the executing core.
    #[inline(always)]
    pub fn ticks(&self, downcount: i32) -> u64 {
        if self.advancing {
            self.elapsed
        } else {
            self.elapsed
                .wrapping_add_signed(self.slice_length as i64 - downcount as i64)
        }
    }

    /// A handle for scheduling events from other threads.
    pub fn remote(&self) -> RemoteQueue {
        self.remote.clone()
    }

    /// Inserts an event at an absolute cycle.
    pub fn insert(&mut self, cycle: u64, ty: EventType, userdata: u64) {
        let event = Event {
            cycle,
            order: self.next_order,
            ty,
            userdata,
        };
        self.next_order += 1;

        // descending, so the earliest event is at the end
        let index = self
            .events
            .partition_point(|e| (e.cycle, e.order) > (event.cycle, event.order));
        self.events.insert(index, event);
    }

    /// Removes every pending event of the given type.
    pub fn remove(&mut self, ty: EventType) {
        self.events.retain(|e| e.ty != ty);
    }

    /// Whether an event of the given type is pending.
    pub fn is_scheduled(&self, ty: EventType) -> bool {
        self.events.iter().any(|e| e.ty == ty)
    }

    /// Cycle of the next pending event.
    pub fn next_event(&self) -> Option<u64> {
        self.events.last().map(|e| e.cycle)
    }

    /// Moves events queued by other threads into the schedule.
    fn drain_remote(&mut self) {
        for event in self.remote.take() {
            self.insert(self.elapsed + event.cycles, event.ty, event.userdata);
        }
    }

    /// Shortens the current slice by `cycles`, as the executing core's downcount is being cut.
    #[inline(always)]
    fn shorten_slice(&mut self, cycles: i32) {
        self.slice_length -= cycles;
    }

    /// Sets the current slice length, as done when single stepping.
    #[inline(always)]
    pub fn set_slice_length(&mut self, length: i32) {
        self.slice_length = length;
    }

    /// Ends the current slice: accounts for the executed cycles and enters event processing.
    fn begin_advance(&mut self, downcount: i32) {
        let executed = self.slice_length as i64 - downcount as i64;
        self.elapsed = self.elapsed.wrapping_add_signed(executed);
        self.slice_length = self.max_slice;
        self.advancing = true;
    }

    fn pop_due(&mut self) -> Option<Event> {
        if self.events.last()?.cycle <= self.elapsed {
            self.events.pop()
        } else {
            None
        }
    }

    /// Leaves event processing and returns the length of the next slice.
    fn end_advance(&mut self) -> i32 {
        self.advancing = false;
        if let Some(next) = self.next_event() {
            let until = next.saturating_sub(self.elapsed);
            self.slice_length = until.min(self.max_slice as u64) as i32;
        }

        self.slice_length
    }

    pub fn do_state(&mut self, ar: &mut Archive) {
        ar.value(&mut self.elapsed);
        ar.value(&mut self.slice_length);
        ar.value(&mut self.next_order);

        let mut count = self.events.len() as u32;
        ar.value(&mut count);
        if ar.is_reading() {
            self.events.clear();
            self.events.resize(
                count as usize,
                Event {
                    cycle: 0,
                    order: 0,
                    ty: EventType(0),
                    userdata: 0,
                },
            );
        }

        for event in &mut self.events {
            ar.value(&mut event.cycle);
            ar.value(&mut event.order);
            ar.value(&mut event.ty.0);
            ar.value(&mut event.userdata);
        }

        if ar.is_reading() {
            let types = self.types.len() as u32;
            self.events.retain(|e| {
                let known = e.ty.0 < types;
                if !known {
                    tracing::warn!(ty = e.ty.0, "dropping event of unknown type from state");
                }
                known
            });
        }
    }
}

impl System {
    /// Current time, in CPU cycles.
    #[inline(always)]
    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks(self.cpu.downcount)
    }

    /// Registers an event type.
    pub fn register_event(&mut self, name: &str, callback: Callback) -> EventType {
        self.scheduler.register(name, callback)
    }

    /// Schedules an event to run `cycles` from now.
    pub fn schedule_event(&mut self, cycles: u64, ty: EventType, userdata: u64, from: FromThread) {
        let from_cpu = match from {
            FromThread::Cpu => true,
            FromThread::NonCpu => false,
            FromThread::Any => self.control.is_cpu_thread() || !self.control.is_running(),
        };

        if !from_cpu {
            self.scheduler.remote.push(cycles, ty, userdata);
            return;
        }

        let cycle = self.ticks() + cycles;
        if !self.scheduler.is_advancing() {
            self.force_exception_check(cycles);
        }

        self.scheduler.insert(cycle, ty, userdata);
    }

    /// Removes every pending event of the given type.
    pub fn remove_event(&mut self, ty: EventType) {
        self.scheduler.remove(ty);
    }

    /// Cuts the current slice so that it ends at most `cycles` from now.
    pub fn force_exception_check(&mut self, cycles: u64) {
        let cycles = cycles.min(i32::MAX as u64) as i32;
        if self.cpu.downcount > cycles {
            self.scheduler.shorten_slice(self.cpu.downcount - cycles);
            self.cpu.downcount = cycles;
        }
    }

    /// Ends the current slice, runs every due event and starts the next slice.
    pub fn advance(&mut self) {
        self.scheduler.drain_remote();
        self.scheduler.begin_advance(self.cpu.downcount);

        while let Some(event) = self.scheduler.pop_due() {
            let late = Cycles(self.scheduler.elapsed - event.cycle);
            match self.scheduler.callback(event.ty) {
                Some(callback) => callback(self, event.userdata, late),
                None => tracing::error!(ty = event.ty.0, "event of unknown type"),
            }
        }

        self.cpu.downcount = self.scheduler.end_advance();
        self.check_external_exceptions();
    }
}
