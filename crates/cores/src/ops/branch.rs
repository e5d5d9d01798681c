use cpucore::system::System;
use gekko::disasm::Ins;
use gekko::{Address, InsExt, Spr};

/// Branch options, as encoded in field BO.
mod bo {
    /// Ignore the condition.
    pub const IGNORE_COND: u32 = 0x10;
    /// Branch when the condition bit is set, otherwise when it is clear.
    pub const COND_TRUE: u32 = 0x08;
    /// Do not decrement CTR.
    pub const KEEP_CTR: u32 = 0x04;
    /// Branch when the decremented CTR is zero, otherwise when it is not.
    pub const CTR_ZERO: u32 = 0x02;
}

/// Evaluates the condition of a conditional branch, decrementing CTR if requested.
fn condition(sys: &mut System, ins: Ins) -> bool {
    let options = ins.field_bo() as u32;

    let ctr_ok = if options & bo::KEEP_CTR == 0 {
        let ctr = sys.cpu.ctr().wrapping_sub(1);
        sys.cpu.set_spr(Spr::Ctr, ctr);
        (ctr == 0) == (options & bo::CTR_ZERO != 0)
    } else {
        true
    };

    let cond_ok = options & bo::IGNORE_COND != 0
        || sys.cpu.cr.bit(ins.cond_bit()) == (options & bo::COND_TRUE != 0);

    ctr_ok && cond_ok
}

#[inline(always)]
fn link(sys: &mut System, ins: Ins) {
    if ins.field_lk() {
        let ret = (sys.cpu.pc + 4u32).value();
        sys.cpu.set_spr(Spr::Lr, ret);
    }
}

pub fn b(sys: &mut System, ins: Ins) {
    let offset = ins.field_li() as i32;
    let target = if ins.field_aa() {
        offset as u32
    } else {
        sys.cpu.pc.value().wrapping_add_signed(offset)
    };

    link(sys, ins);
    sys.cpu.npc = Address(target);
}

pub fn bc(sys: &mut System, ins: Ins) {
    if !condition(sys, ins) {
        return;
    }

    let offset = ins.field_bd() as i32;
    let target = if ins.field_aa() {
        offset as u32
    } else {
        sys.cpu.pc.value().wrapping_add_signed(offset)
    };

    link(sys, ins);
    sys.cpu.npc = Address(target);
}

pub fn bclr(sys: &mut System, ins: Ins) {
    if !condition(sys, ins) {
        return;
    }

    // LR is read before the link updates it
    let target = sys.cpu.lr() & !3;
    link(sys, ins);
    sys.cpu.npc = Address(target);
}

pub fn bcctr(sys: &mut System, ins: Ins) {
    // the CTR is never decremented here, BO\[2\] being clear is an invalid form
    let options = ins.field_bo() as u32;
    let cond_ok = options & bo::IGNORE_COND != 0
        || sys.cpu.cr.bit(ins.cond_bit()) == (options & bo::COND_TRUE != 0);

    if !cond_ok {
        return;
    }

    let target = sys.cpu.ctr() & !3;
    link(sys, ins);
    sys.cpu.npc = Address(target);
}

#[cfg(test)]
mod test {
    use gekko::Spr;

    use crate::ops::test::{CODE, run, system};

    #[test]
    fn relative_and_link() {
        let mut sys = system();

        // bl +0x10
        run(&mut sys, &[0x4800_0011]);
        assert_eq!(sys.cpu.pc.value(), CODE + 0x10);
        assert_eq!(sys.cpu.lr(), CODE + 4);
    }

    #[test]
    fn decrementing_loop() {
        let mut sys = system();
        sys.cpu.set_spr(Spr::Ctr, 2);

        // bdnz -4
        run(&mut sys, &[0x6000_0000, 0x4200_FFFC]);
        assert_eq!(sys.cpu.ctr(), 1);
        assert_eq!(sys.cpu.pc.value(), CODE);

        sys.cpu.set_spr(Spr::Ctr, 1);
        run(&mut sys, &[0x6000_0000, 0x4200_FFFC]);
        assert_eq!(sys.cpu.ctr(), 0);
        assert_eq!(sys.cpu.pc.value(), CODE + 8);
    }

    #[test]
    fn conditional_on_cr() {
        let mut sys = system();
        sys.cpu.cr.set_field(0, gekko::regs::cr::EQ);

        // beq +8
        run(&mut sys, &[0x4182_0008]);
        assert_eq!(sys.cpu.pc.value(), CODE + 8);

        // bne +8
        run(&mut sys, &[0x4082_0008]);
        assert_eq!(sys.cpu.pc.value(), CODE + 4);
    }

    #[test]
    fn return_through_lr() {
        let mut sys = system();
        sys.cpu.set_spr(Spr::Lr, 0x8000_1237);

        // blrl
        run(&mut sys, &[0x4E80_0021]);
        assert_eq!(sys.cpu.pc.value(), 0x8000_1234);
        assert_eq!(sys.cpu.lr(), CODE + 4);
    }

    #[test]
    fn jump_through_ctr() {
        let mut sys = system();
        sys.cpu.set_spr(Spr::Ctr, 0x8000_2000);

        // bctr
        run(&mut sys, &[0x4E80_0420]);
        assert_eq!(sys.cpu.pc.value(), 0x8000_2000);
        assert_eq!(sys.cpu.ctr(), 0x8000_2000);
    }
}
