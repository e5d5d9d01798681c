//! Execution backends for the Gekko/Broadway CPU core: the interpreter, the cached interpreter
//! and the block compiling JIT. They share the instruction semantics in [`ops`].

pub mod block;
pub mod cached;
pub mod interpreter;
pub mod jit;
pub mod ops;

use cpucore::cores::{CoreProvider, CpuCore, CpuCoreKind};

pub use cached::CachedInterpreter;
pub use interpreter::Interpreter;

/// Creates the backends of this crate.
#[derive(Debug, Clone, Default)]
pub struct Provider {
    pub jit: jit::Config,
}

impl Provider {
    pub fn new(jit: jit::Config) -> Self {
        Self { jit }
    }
}

impl CoreProvider for Provider {
    fn interpreter(&mut self) -> Box<dyn CpuCore> {
        Box::new(Interpreter::new())
    }

    fn create(&mut self, kind: CpuCoreKind) -> Option<Box<dyn CpuCore>> {
        match kind {
            CpuCoreKind::CachedInterpreter => Some(Box::new(CachedInterpreter::new())),
            kind if CpuCoreKind::host_jit() == Some(kind) => {
                Some(Box::new(jit::Core::new(kind, self.jit.clone())))
            }
            _ => None,
        }
    }
}
