//! Run state of the CPU.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::ThreadId;

use strum::FromRepr;

/// What the CPU is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CpuState {
    Running   = 0,
    Stepping  = 1,
    PowerDown = 2,
}

/// Shared view of the CPU run state. Cloning it yields a handle to the same state, which can be
/// sent to other threads.
#[derive(Debug, Clone)]
pub struct RunState(Arc<AtomicU8>);

impl RunState {
    #[inline(always)]
    pub fn get(&self) -> CpuState {
        CpuState::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(CpuState::PowerDown)
    }

    #[inline(always)]
    pub fn set(&self, state: CpuState) {
        self.0.store(state as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.get() == CpuState::Running
    }

    /// Stops a running CPU at the next instruction or block boundary.
    pub fn request_break(&self) {
        _ = self.0.compare_exchange(
            CpuState::Running as u8,
            CpuState::Stepping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// CPU run control.
#[derive(Debug)]
pub struct Control {
    state: RunState,
    cpu_thread: Option<ThreadId>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            state: RunState(Arc::new(AtomicU8::new(CpuState::Stepping as u8))),
            cpu_thread: None,
        }
    }
}

impl Control {
    /// Marks the calling thread as the CPU thread.
    pub fn bind_cpu_thread(&mut self) {
        self.cpu_thread = Some(std::thread::current().id());
    }

    /// Whether the calling thread is the CPU thread.
    #[inline(always)]
    pub fn is_cpu_thread(&self) -> bool {
        self.cpu_thread == Some(std::thread::current().id())
    }

    #[inline(always)]
    pub fn state(&self) -> CpuState {
        self.state.get()
    }

    #[inline(always)]
    pub fn set_state(&self, state: CpuState) {
        self.state.set(state);
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    #[inline(always)]
    pub fn is_stepping(&self) -> bool {
        self.state() == CpuState::Stepping
    }

    /// Stops the CPU at the next instruction or block boundary.
    #[inline(always)]
    pub fn request_break(&self) {
        self.state.request_break();
    }

    /// A handle to the run state for other threads.
    pub fn run_state(&self) -> RunState {
        self.state.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn break_only_stops_running_cpu() {
        let control = Control::default();
        assert_eq!(control.state(), CpuState::Stepping);

        control.set_state(CpuState::PowerDown);
        control.request_break();
        assert_eq!(control.state(), CpuState::PowerDown);

        control.set_state(CpuState::Running);
        let handle = control.run_state();
        std::thread::spawn(move || handle.request_break())
            .join()
            .unwrap();
        assert_eq!(control.state(), CpuState::Stepping);
    }

    #[test]
    fn cpu_thread_binding() {
        let mut control = Control::default();
        assert!(!control.is_cpu_thread());
        control.bind_cpu_thread();
        assert!(control.is_cpu_thread());
    }
}
