//! Execution backends and the controller which selects between them.

use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::state::Archive;
use crate::system::System;

/// Trait for CPU execution backends.
pub trait CpuCore: Send {
    /// Prepares the backend to run.
    fn init(&mut self, _sys: &mut System) {}
    /// Releases anything the backend holds.
    fn shutdown(&mut self, _sys: &mut System) {}
    /// Executes exactly one instruction, then services any exception it raised.
    fn single_step(&mut self, sys: &mut System);
    /// Runs until the CPU stops running.
    fn run(&mut self, sys: &mut System);
    /// Human readable name of the backend.
    fn name(&self) -> &'static str;
    /// Transfers backend specific state.
    fn do_state(&mut self, _sys: &mut System, _ar: &mut Archive) {}
    /// Drops every compiled or cached block.
    fn clear_cache(&mut self) {}
}

/// Kinds of execution backends. The values are stable, as they are stored in configuration
/// files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
#[repr(u32)]
pub enum CpuCoreKind {
    Interpreter       = 0,
    Jit64             = 1,
    JitArm64          = 4,
    CachedInterpreter = 5,
}

impl From<u32> for CpuCoreKind {
    fn from(value: u32) -> Self {
        Self::from_repr(value).unwrap_or(Self::CachedInterpreter)
    }
}

impl From<CpuCoreKind> for u32 {
    fn from(value: CpuCoreKind) -> Self {
        value as u32
    }
}

impl CpuCoreKind {
    /// The backend used when none (or an unavailable one) is requested.
    pub const fn default_core() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::Jit64
        } else if cfg!(target_arch = "aarch64") {
            Self::JitArm64
        } else {
            Self::CachedInterpreter
        }
    }

    /// The JIT for the host architecture, if there is one.
    pub const fn host_jit() -> Option<Self> {
        match Self::default_core() {
            Self::CachedInterpreter | Self::Interpreter => None,
            jit => Some(jit),
        }
    }

    /// Every backend usable on this host, best first.
    pub fn available_cores() -> Vec<Self> {
        let mut cores = Vec::with_capacity(3);
        cores.extend(Self::host_jit());
        cores.push(Self::CachedInterpreter);
        cores.push(Self::Interpreter);
        cores
    }
}

/// The requested execution mode, independent of the backend actually running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreMode {
    Interpreter,
    Jit,
}

/// Creates execution backends.
pub trait CoreProvider: Send {
    /// The interpreter, which is always available.
    fn interpreter(&mut self) -> Box<dyn CpuCore>;
    /// A JIT family backend (anything but the interpreter), if available.
    fn create(&mut self, kind: CpuCoreKind) -> Option<Box<dyn CpuCore>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Interpreter,
    Jit,
    External,
}

/// Owns the execution backends and tracks which one is active.
pub struct Cores {
    provider: Box<dyn CoreProvider>,
    interpreter: Box<dyn CpuCore>,
    jit: Option<Box<dyn CpuCore>>,
    external: Option<Box<dyn CpuCore>>,
    active: Active,
    mode: CoreMode,
}

impl Cores {
    pub fn new(mut provider: Box<dyn CoreProvider>) -> Self {
        Self {
            interpreter: provider.interpreter(),
            provider,
            jit: None,
            external: None,
            active: Active::Interpreter,
            mode: CoreMode::Interpreter,
        }
    }

    /// Initializes the interpreter and the requested backend, falling back to the default one
    /// and then to the interpreter when it's not available.
    pub fn init(&mut self, sys: &mut System, requested: CpuCoreKind) {
        if let Some(mut previous) = self.jit.take() {
            previous.shutdown(sys);
        }

        self.interpreter.init(sys);

        if requested != CpuCoreKind::Interpreter {
            let jit = self.provider.create(requested).or_else(|| {
                let default = CpuCoreKind::default_core();
                tracing::warn!(
                    ?requested,
                    ?default,
                    "cpu core not available, falling back to default"
                );

                self.provider.create(default)
            });

            match jit {
                Some(mut jit) => {
                    jit.init(sys);
                    self.jit = Some(jit);
                }
                None => tracing::warn!("no JIT family core available, using the interpreter"),
            }
        }

        self.active = if self.jit.is_some() {
            Active::Jit
        } else {
            Active::Interpreter
        };

        self.mode = match self.active {
            Active::Interpreter => CoreMode::Interpreter,
            _ => CoreMode::Jit,
        };

        tracing::info!(core = self.active().name(), "cpu core initialized");
        self.active_mut().clear_cache();
    }

    /// Shuts every backend down.
    pub fn shutdown(&mut self, sys: &mut System) {
        self.inject(sys, None);

        if let Some(mut jit) = self.jit.take() {
            jit.shutdown(sys);
        }

        self.interpreter.shutdown(sys);
        self.active = Active::Interpreter;
    }

    /// The requested mode. Reports the interpreter while an external core is injected.
    pub fn mode(&self) -> CoreMode {
        if self.external.is_some() {
            CoreMode::Interpreter
        } else {
            self.mode
        }
    }

    /// Requests a mode. The change only applies while no external core is injected.
    pub fn set_mode(&mut self, mode: CoreMode) {
        if mode == self.mode {
            return;
        }

        self.mode = mode;
        if self.external.is_none() {
            self.apply_mode();
        }
    }

    fn apply_mode(&mut self) {
        self.active = match self.mode {
            CoreMode::Interpreter => Active::Interpreter,
            CoreMode::Jit if self.jit.is_some() => Active::Jit,
            CoreMode::Jit => Active::Interpreter,
        };

        tracing::debug!(mode = ?self.mode, core = self.active().name(), "cpu mode applied");

        // blocks compiled before the switch may be stale by now
        self.active_mut().clear_cache();
    }

    /// Injects an external core which overrides the selected one, or removes the injected core
    /// when `core` is `None`.
    pub fn inject(&mut self, sys: &mut System, core: Option<Box<dyn CpuCore>>) {
        if let Some(mut previous) = self.external.take() {
            previous.shutdown(sys);
            self.apply_mode();
        }

        if let Some(mut core) = core {
            core.init(sys);
            self.external = Some(core);
            self.active = Active::External;
        }
    }

    /// Whether an external core is injected.
    pub fn is_injected(&self) -> bool {
        self.external.is_some()
    }

    /// The active backend.
    pub fn active(&self) -> &dyn CpuCore {
        match (self.active, &self.jit, &self.external) {
            (Active::Jit, Some(jit), _) => jit.as_ref(),
            (Active::External, _, Some(external)) => external.as_ref(),
            _ => self.interpreter.as_ref(),
        }
    }

    /// The active backend.
    pub fn active_mut(&mut self) -> &mut dyn CpuCore {
        match (self.active, &mut self.jit, &mut self.external) {
            (Active::Jit, Some(jit), _) => jit.as_mut(),
            (Active::External, _, Some(external)) => external.as_mut(),
            _ => self.interpreter.as_mut(),
        }
    }

    /// Whether the interpreter is the active backend.
    pub fn is_interpreter_active(&self) -> bool {
        self.active == Active::Interpreter
    }
}
