#![allow(dead_code)]

use cores::Provider;
use cpucore::modules::Modules;
use cpucore::system::Config;
use cpucore::system::control::CpuState;
use cpucore::{Address, PowerPc};
use cpucore::cores::CpuCoreKind;

/// Where test programs are loaded.
pub const CODE: u32 = 0x3100;
/// Where test programs keep their data.
pub const DATA: u32 = 0x4000;
/// `b .`
pub const HALT: u32 = 0x4800_0000;

/// Assembles a sequence of instructions.
macro_rules! ppc {
    ($($mnemonic:ident $($kind:ident($arg:expr))*);* $(;)?) => {
        {
            #[allow(unused_imports, dead_code)]
            use powerpc_asm::Argument;

            #[allow(dead_code)]
            fn u(value: u32) -> Argument {
                Argument::Unsigned(value)
            }

            #[allow(dead_code)]
            fn i(value: i32) -> Argument {
                Argument::Signed(value)
            }

            #[allow(dead_code)]
            fn gpr(index: u32) -> Argument {
                u(index)
            }

            #[allow(dead_code)]
            fn off(value: i32) -> Argument {
                i(value)
            }

            let mut sequence: Vec<u32> = vec![];
            $(
                #[allow(unused_mut, unused_assignments, unused_variables)]
                {
                    let mut index = 0;
                    let mut arguments = [Argument::None; 5];

                    $(
                        arguments[index] = $kind($arg);
                        index += 1;
                    )*

                    sequence.push(
                        powerpc_asm::assemble(stringify!($mnemonic), &arguments)
                            .expect("test instructions should assemble"),
                    );
                }
            )*

            sequence
        }
    };
}

pub(crate) use ppc;

/// `b offset`, relative to the branch.
pub fn b(offset: i32) -> u32 {
    0x4800_0000 | (offset as u32 & 0x03FF_FFFC)
}

/// `bl offset`, relative to the branch.
pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

/// `bc bo, bi, offset`, relative to the branch.
pub fn bc(bo: u32, bi: u32, offset: i32) -> u32 {
    0x4000_0000 | (bo << 21) | (bi << 16) | (offset as u32 & 0xFFFC)
}

/// `beq offset`
pub fn beq(offset: i32) -> u32 {
    bc(12, 2, offset)
}

/// `bne offset`
pub fn bne(offset: i32) -> u32 {
    bc(4, 2, offset)
}

/// `blr`
pub const BLR: u32 = 0x4E80_0020;
/// `isync`
pub const ISYNC: u32 = 0x4C00_012C;
/// `sc`
pub const SC: u32 = 0x4400_0002;

/// `cmpwi cr0, ra, simm`
pub fn cmpwi(ra: u32, simm: i16) -> u32 {
    0x2C00_0000 | (ra << 16) | simm as u16 as u32
}

/// `mtspr spr, rs`
pub fn mtspr(spr: u32, rs: u32) -> u32 {
    let spr = ((spr & 0x1F) << 5) | (spr >> 5);
    0x7C00_03A6 | (rs << 21) | (spr << 11)
}

/// A processor on the given backend, brought up and ready to run at [`CODE`].
pub fn powerpc(kind: CpuCoreKind) -> PowerPc {
    powerpc_with(kind, |_| ())
}

pub fn powerpc_with(kind: CpuCoreKind, f: impl FnOnce(&mut Config)) -> PowerPc {
    let mut config = Config {
        cpu_core: kind,
        ..Default::default()
    };
    f(&mut config);

    let mut ppc = PowerPc::new(config, Modules::default(), Box::new(Provider::default()));
    ppc.init();
    ppc.sys.cpu.pc = Address(CODE);

    ppc
}

/// Writes `code` at `addr`.
pub fn load(ppc: &mut PowerPc, addr: u32, code: &[u32]) {
    for (i, word) in code.iter().enumerate() {
        ppc.sys
            .mem
            .write(Address(addr + 4 * i as u32), &word.to_be_bytes());
    }
}

pub fn read_word(ppc: &PowerPc, addr: u32) -> u32 {
    let mut buf = [0; 4];
    ppc.sys.mem.read(Address(addr), &mut buf);
    u32::from_be_bytes(buf)
}

/// Runs for `cycles` cycles and checks the processor stopped cleanly.
pub fn run(ppc: &mut PowerPc, cycles: u64) {
    ppc.run_for(cycles);
    assert_eq!(ppc.sys.control.state(), CpuState::Stepping);
}

/// Every backend, interpreter first.
pub fn backends() -> Vec<CpuCoreKind> {
    let mut kinds = vec![CpuCoreKind::Interpreter, CpuCoreKind::CachedInterpreter];
    kinds.extend(CpuCoreKind::host_jit());
    kinds
}
