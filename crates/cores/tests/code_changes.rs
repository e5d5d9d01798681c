mod common;

use common::*;
use cpucore::Cycles;
use cpucore::cores::CpuCoreKind;
use cpucore::system::System;
use cpucore::system::scheduler::FromThread;
use gekko::Address;

/// `addi r3, r0, 42`
const PATCH: u32 = 0x3860_002A;

/// Runs the instruction at [`CODE`], then patches it with [`PATCH`] and runs it again.
fn patching_program(icbi: bool) -> Vec<u32> {
    let mut code = ppc! {
        addi gpr(3) gpr(0) i(1);
        addi gpr(12) gpr(12) i(1);
    };

    code.push(cmpwi(12, 2));
    code.push(beq(24));
    code.extend(ppc! {
        lwz gpr(4) off(0) gpr(10);
        stw gpr(4) off(0) gpr(11);
    });

    if icbi {
        code.extend(ppc! { icbi gpr(0) gpr(11) });
    } else {
        code.push(0x6000_0000);
    }

    code.push(ISYNC);
    code.push(b(-32));
    code.push(HALT);

    code
}

#[test]
fn invalidated_code_is_refetched() {
    for kind in backends() {
        let mut ppc = powerpc(kind);
        load(&mut ppc, CODE, &patching_program(true));
        load(&mut ppc, DATA, &[PATCH]);
        ppc.sys.cpu.gpr[10] = DATA;
        ppc.sys.cpu.gpr[11] = CODE;

        run(&mut ppc, 1000);
        assert_eq!(ppc.sys.cpu.gpr[12], 2, "{kind:?}");
        assert_eq!(ppc.sys.cpu.gpr[3], 42, "{kind:?}");
        assert_eq!(read_word(&ppc, CODE), PATCH, "{kind:?}");
        assert_eq!(ppc.sys.cpu.pc.value(), CODE + 36, "{kind:?}");
    }
}

#[test]
fn stale_code_without_invalidation() {
    // the instruction cache still holds the old line
    let mut ppc = powerpc(CpuCoreKind::Interpreter);
    ppc.sys.cpu.set_spr(gekko::Spr::Hid0, 1 << 15);
    load(&mut ppc, CODE, &patching_program(false));
    load(&mut ppc, DATA, &[PATCH]);
    ppc.sys.cpu.gpr[10] = DATA;
    ppc.sys.cpu.gpr[11] = CODE;

    run(&mut ppc, 1000);
    assert_eq!(ppc.sys.cpu.gpr[12], 2);
    assert_eq!(ppc.sys.cpu.gpr[3], 1);
}

#[test]
fn remote_invalidation() {
    for kind in backends() {
        let mut ppc = powerpc(kind);
        // addi r3, r0, 1; b 0
        let mut code = ppc! { addi gpr(3) gpr(0) i(1) };
        code.push(HALT);
        load(&mut ppc, CODE, &code);
        run(&mut ppc, 100);
        assert_eq!(ppc.sys.cpu.gpr[3], 1, "{kind:?}");

        // patched by someone else, who then invalidates the line
        load(&mut ppc, CODE, &[PATCH]);
        let remote = ppc.remote();
        std::thread::spawn(move || remote.invalidate_icache_line(Address(CODE)))
            .join()
            .unwrap();

        ppc.sys.cpu.pc = Address(CODE);
        run(&mut ppc, 100);
        assert_eq!(ppc.sys.cpu.gpr[3], 42, "{kind:?}");
    }
}

fn set_flag(sys: &mut System, userdata: u64, _: Cycles) {
    sys.mem
        .write(Address(userdata as u32), &1u32.to_be_bytes());
}

#[test]
fn volatile_read_loop_released_by_event() {
    for kind in backends() {
        let mut ppc = powerpc(kind);
        let flag = ppc.sys.register_event("SetFlag", set_flag);
        ppc.sys
            .schedule_event(3000, flag, DATA as u64, FromThread::Cpu);
        ppc.sys.cpu.gpr[10] = DATA;

        // wait until the flag is set
        let mut code = ppc! { lwz gpr(3) off(0) gpr(10) };
        code.push(cmpwi(3, 0));
        code.push(beq(-8));
        code.extend(ppc! { addi gpr(4) gpr(0) i(7) });
        code.push(HALT);
        load(&mut ppc, CODE, &code);

        run(&mut ppc, 10_000);
        assert_eq!(ppc.sys.cpu.gpr[3], 1, "{kind:?}");
        assert_eq!(ppc.sys.cpu.gpr[4], 7, "{kind:?}");
        assert_eq!(ppc.sys.cpu.pc.value(), CODE + 16, "{kind:?}");
    }
}

#[test]
fn idle_loop_takes_the_whole_slice() {
    let Some(kind) = CpuCoreKind::host_jit() else {
        return;
    };

    let mut ppc = powerpc(kind);
    load(&mut ppc, CODE, &[HALT]);

    let before = ppc.sys.ticks();
    run(&mut ppc, 50_000);
    assert!(ppc.sys.ticks() - before >= 50_000);
    assert_eq!(ppc.sys.cpu.pc.value(), CODE);
}
