//! Collaborators the CPU core notifies but does not own.

use gekko::Address;

/// The frontend hosting the emulator.
pub trait HostModule: Send {
    /// Called once per run loop, after the core stops running.
    fn update_disasm_dialog(&mut self) {}
}

/// A remote debugger (e.g. a GDB stub).
pub trait DebugServerModule: Send {
    fn is_active(&self) -> bool;
    /// Hands control over to the debugger after a breakpoint was hit.
    fn take_control(&mut self);
}

/// Script callbacks.
pub trait ScriptingModule: Send {
    /// An instruction breakpoint was reached.
    fn on_instruction_hit(&mut self, _pc: Address) {}
    /// A memory check was hit.
    fn on_memory_hit(&mut self, _addr: Address, _write: bool, _value: u64) {}
}

/// Symbol information about the running program.
pub trait SymbolsModule: Send {
    /// Name of the function containing `addr`.
    fn symbol(&self, addr: Address) -> Option<String>;
}

/// A host which does nothing.
#[derive(Debug, Default)]
pub struct NopHostModule;

impl HostModule for NopHostModule {}

/// A debug server which is never active.
#[derive(Debug, Default)]
pub struct NopDebugServerModule;

impl DebugServerModule for NopDebugServerModule {
    fn is_active(&self) -> bool {
        false
    }

    fn take_control(&mut self) {}
}

/// Scripting without any scripts.
#[derive(Debug, Default)]
pub struct NopScriptingModule;

impl ScriptingModule for NopScriptingModule {}

/// No symbols at all.
#[derive(Debug, Default)]
pub struct NopSymbolsModule;

impl SymbolsModule for NopSymbolsModule {
    fn symbol(&self, _: Address) -> Option<String> {
        None
    }
}

/// Collaborator modules.
pub struct Modules {
    pub host: Box<dyn HostModule>,
    pub debug_server: Box<dyn DebugServerModule>,
    pub scripting: Box<dyn ScriptingModule>,
    pub symbols: Box<dyn SymbolsModule>,
}

impl Default for Modules {
    fn default() -> Self {
        Self {
            host: Box::new(NopHostModule),
            debug_server: Box::new(NopDebugServerModule),
            scripting: Box::new(NopScriptingModule),
            symbols: Box::new(NopSymbolsModule),
        }
    }
}
