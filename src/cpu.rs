use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::interrupt::Signal;
use crate::mmu::{IF_JOYPAD, IF_SERIAL, IF_STAT, IF_TIMER, IF_VBLANK, INT_MASK, Mmu};
use crate::scheduler::{PRIORITY_READ, PRIORITY_WRITE, Scheduler, Unit};

// CPU flag bits, upper nibble of F.
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors, in service priority order.
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

/// The SM83 core, run as a cooperative task on the scheduler's `cpu` unit.
///
/// Execution starts at 0x0000: whatever is mapped there (a boot ROM when one
/// is loaded, the cartridge otherwise) is what runs first.
pub struct Cpu {
    sched: Scheduler,
    mmu: Rc<RefCell<Mmu>>,
    wake: Signal,
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub ime: bool,
    /// One-instruction delay latch used by EI.
    pub ime_pending: bool,
    /// Idle cycles folded into the next bus wait to save queue round-trips.
    extra_cycles: u32,
}

impl Cpu {
    pub fn new(sched: Scheduler, mmu: Rc<RefCell<Mmu>>) -> Self {
        let wake = mmu.borrow().interrupts.cpu_wake.clone();
        Self {
            sched,
            mmu,
            wake,
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            sp: 0,
            pc: 0,
            ime: false,
            ime_pending: false,
            extra_cycles: 0,
        }
    }

    fn bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    fn hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn af(&self) -> u16 {
        ((self.a as u16) << 8) | self.f as u16
    }

    fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        // The low nibble of F does not exist in hardware.
        self.f = val as u8 & 0xF0;
    }

    fn dummy(&mut self, cycles: u32) {
        self.extra_cycles += cycles;
    }

    async fn read_wait(&mut self, wait: u32) {
        let wait = wait + self.extra_cycles;
        self.extra_cycles = 0;
        self.sched.cycles(Unit::Cpu, PRIORITY_READ, wait).await;
    }

    async fn write_wait(&mut self, wait: u32) {
        let wait = wait + self.extra_cycles;
        self.extra_cycles = 0;
        self.sched.cycles(Unit::Cpu, PRIORITY_WRITE, wait).await;
    }

    fn bus_read(&mut self, addr: u16) -> u8 {
        self.mmu.borrow_mut().read8(addr)
    }

    fn bus_write(&mut self, addr: u16, val: u8) {
        self.mmu.borrow_mut().write8(addr, val);
    }

    async fn read8(&mut self, addr: u16) -> u8 {
        self.read_wait(4).await;
        self.bus_read(addr)
    }

    async fn write8(&mut self, addr: u16, val: u8) {
        self.write_wait(4).await;
        self.bus_write(addr, val);
    }

    async fn fetch8(&mut self) -> u8 {
        let pc = self.pc;
        self.pc = pc.wrapping_add(1);
        self.read8(pc).await
    }

    async fn fetch16(&mut self) -> u16 {
        let lo = self.fetch8().await as u16;
        let hi = self.fetch8().await as u16;
        (hi << 8) | lo
    }

    async fn push16(&mut self, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        // Internal pre-decrement cycle.
        self.dummy(4);
        self.write_wait(4).await;
        let sp = self.sp;
        self.bus_write(sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write_wait(4).await;
        let sp = self.sp;
        self.bus_write(sp, val as u8);
    }

    async fn pop16(&mut self) -> u16 {
        let sp = self.sp;
        self.sp = sp.wrapping_add(1);
        let lo = self.read8(sp).await as u16;
        let sp = self.sp;
        self.sp = sp.wrapping_add(1);
        let hi = self.read8(sp).await as u16;
        (hi << 8) | lo
    }

    /// Register operand by index; 6 is the (HL) memory slot and costs a bus
    /// access.
    async fn read_r(&mut self, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => {
                let hl = self.hl();
                self.read8(hl).await
            }
            _ => self.a,
        }
    }

    async fn write_r(&mut self, index: u8, val: u8) {
        match index {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let hl = self.hl();
                self.write8(hl, val).await;
            }
            _ => self.a = val,
        }
    }

    fn get_rr(&self, opcode: u8) -> u16 {
        match (opcode >> 4) & 0x03 {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn set_rr(&mut self, opcode: u8, val: u16) {
        match (opcode >> 4) & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    /// NZ / Z / NC / C condition from opcode bits 3-4.
    fn condition(&self, opcode: u8) -> bool {
        match (opcode >> 3) & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    fn alu(&mut self, op: u8, val: u8) {
        let a = self.a;
        match op {
            0 => {
                // ADD
                let result = a as u16 + val as u16;
                self.a = result as u8;
                self.f = (if self.a == 0 { FLAG_Z } else { 0 })
                    | (if (a & 0x0F) + (val & 0x0F) > 0x0F { FLAG_H } else { 0 })
                    | (if result > 0xFF { FLAG_C } else { 0 });
            }
            1 => {
                // ADC
                let carry = (self.f >> 4) & 1;
                let result = a as u16 + val as u16 + carry as u16;
                self.a = result as u8;
                self.f = (if self.a == 0 { FLAG_Z } else { 0 })
                    | (if (a & 0x0F) + (val & 0x0F) + carry > 0x0F { FLAG_H } else { 0 })
                    | (if result > 0xFF { FLAG_C } else { 0 });
            }
            2 => {
                // SUB
                let result = (a as u16).wrapping_sub(val as u16);
                self.a = result as u8;
                self.f = (if self.a == 0 { FLAG_Z } else { 0 })
                    | FLAG_N
                    | (if (a & 0x0F) < (val & 0x0F) { FLAG_H } else { 0 })
                    | (if result > 0xFF { FLAG_C } else { 0 });
            }
            3 => {
                // SBC
                let carry = (self.f >> 4) & 1;
                let result = (a as u16)
                    .wrapping_sub(val as u16)
                    .wrapping_sub(carry as u16);
                self.a = result as u8;
                let half_borrow = ((a & 0x0F) as i16 - (val & 0x0F) as i16 - carry as i16) < 0;
                self.f = (if self.a == 0 { FLAG_Z } else { 0 })
                    | FLAG_N
                    | (if half_borrow { FLAG_H } else { 0 })
                    | (if result > 0xFF { FLAG_C } else { 0 });
            }
            4 => {
                // AND
                self.a &= val;
                self.f = (if self.a == 0 { FLAG_Z } else { 0 }) | FLAG_H;
            }
            5 => {
                // XOR
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            6 => {
                // OR
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            _ => {
                // CP
                let result = (a as u16).wrapping_sub(val as u16);
                self.f = (if result as u8 == 0 { FLAG_Z } else { 0 })
                    | FLAG_N
                    | (if (a & 0x0F) < (val & 0x0F) { FLAG_H } else { 0 })
                    | (if result > 0xFF { FLAG_C } else { 0 });
            }
        }
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.hl();
        let result = hl as u32 + val as u32;
        self.set_hl(result as u16);
        self.f = (self.f & FLAG_Z)
            | (if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF { FLAG_H } else { 0 })
            | (if result > 0xFFFF { FLAG_C } else { 0 });
    }

    /// Shared by ADD SP,r8 and LD HL,SP+r8: 8-bit half-carry semantics on the
    /// low byte, Z and N cleared.
    fn sp_plus_offset(&mut self, offset: u8) -> u16 {
        let sp = self.sp;
        self.f = (if (sp & 0x0F) + (offset as u16 & 0x0F) > 0x0F { FLAG_H } else { 0 })
            | (if (sp & 0xFF) + offset as u16 > 0xFF { FLAG_C } else { 0 });
        sp.wrapping_add(offset as i8 as u16)
    }

    /// Decimal-adjust A after a BCD add or subtract.
    fn daa(&mut self) {
        let mut result = self.a as u16;
        let n = self.f & FLAG_N != 0;
        let h = self.f & FLAG_H != 0;
        let c = self.f & FLAG_C != 0;
        if n {
            if h {
                result = result.wrapping_sub(0x06);
                if !c {
                    result &= 0xFF;
                }
            }
            if c {
                result = result.wrapping_sub(0x60);
            }
        } else {
            if h || (result & 0x0F) >= 0x0A {
                result += 0x06;
            }
            if c || result >= 0xA0 {
                result += 0x60;
            }
        }
        self.a = result as u8;
        let carry = c || result > 0xFF;
        self.f = (if self.a == 0 { FLAG_Z } else { 0 })
            | (self.f & FLAG_N)
            | (if carry { FLAG_C } else { 0 });
    }

    /// CB-prefixed rotate/shift/swap by kind (bits 3-5 of the CB opcode).
    fn rotate_shift(&mut self, kind: u8, val: u8) -> u8 {
        let carry_in = (self.f >> 4) & 1;
        let (result, carry) = match kind {
            0 => (val.rotate_left(1), val & 0x80 != 0),  // RLC
            1 => (val.rotate_right(1), val & 0x01 != 0), // RRC
            2 => ((val << 1) | carry_in, val & 0x80 != 0), // RL
            3 => ((val >> 1) | (carry_in << 7), val & 0x01 != 0), // RR
            4 => (val << 1, val & 0x80 != 0),            // SLA
            5 => ((val >> 1) | (val & 0x80), val & 0x01 != 0), // SRA
            6 => (val.rotate_left(4), false),            // SWAP
            _ => (val >> 1, val & 0x01 != 0),            // SRL
        };
        self.f = (if result == 0 { FLAG_Z } else { 0 }) | (if carry { FLAG_C } else { 0 });
        result
    }

    fn pending_interrupts(&self) -> u8 {
        let mmu = self.mmu.borrow();
        mmu.if_reg & mmu.ie_reg & INT_MASK
    }

    /// Resolve the vector for the highest-priority pending interrupt and ack
    /// its IF bit. An empty `pending` is the cancelled-service case: the CPU
    /// jumps to 0x0000 and no flag is acknowledged.
    fn service_vector(&mut self, pending: u8) -> u16 {
        let (bit, vector) = if pending & IF_VBLANK != 0 {
            (IF_VBLANK, INTERRUPT_VBLANK)
        } else if pending & IF_STAT != 0 {
            (IF_STAT, INTERRUPT_STAT)
        } else if pending & IF_TIMER != 0 {
            (IF_TIMER, INTERRUPT_TIMER)
        } else if pending & IF_SERIAL != 0 {
            (IF_SERIAL, INTERRUPT_SERIAL)
        } else if pending & IF_JOYPAD != 0 {
            (IF_JOYPAD, INTERRUPT_JOYPAD)
        } else {
            return 0x0000;
        };
        self.mmu.borrow_mut().if_reg &= !bit;
        vector
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let mut halt_bug = false;

        // One idle M-cycle on reset.
        self.dummy(4);

        loop {
            // The core has one level of pipelining: reads land on the first
            // T-cycle of the new M-cycle, and interrupts are sampled on
            // T-cycle 2 of the final M-cycle of the previous instruction.
            if self.ime {
                self.read_wait(2).await;
                let pending = self.pending_interrupts();
                if pending != 0 {
                    self.ime = false;
                    self.ime_pending = false;

                    self.dummy(2); // realign to the 4-cycle clock
                    self.dummy(4); // discard the pipelined opcode read
                    self.dummy(4); // internal SP pre-decrement
                    self.sp = self.sp.wrapping_sub(1);
                    self.write_wait(4).await;
                    let sp = self.sp;
                    let hi = (self.pc >> 8) as u8;
                    self.bus_write(sp, hi);
                    self.sp = self.sp.wrapping_sub(1);
                    // A late-arriving interrupt can still replace (or cancel)
                    // the vector between the two pushed halves.
                    self.read_wait(2).await;
                    let pending = self.pending_interrupts();
                    self.write_wait(2).await;
                    let sp = self.sp;
                    let lo = self.pc as u8;
                    self.bus_write(sp, lo);

                    self.pc = self.service_vector(pending);
                    self.dummy(2); // back to T-cycle 2 for the opcode fetch
                }
            } else {
                self.dummy(2);
                self.ime = self.ime_pending;
            }

            self.read_wait(2).await;
            let opcode = self.bus_read(self.pc);
            if !halt_bug {
                self.pc = self.pc.wrapping_add(1);
            } else {
                halt_bug = false;
            }

            match opcode {
                0x00 => {} // NOP
                0x10 => return Err(Error::StopUnsupported(self.pc.wrapping_sub(1))),

                // LD (a16),SP
                0x08 => {
                    let addr = self.fetch16().await;
                    let sp = self.sp;
                    self.write8(addr, sp as u8).await;
                    self.write8(addr.wrapping_add(1), (sp >> 8) as u8).await;
                }

                // JR r8 / JR cc,r8
                0x18 => {
                    let offset = self.fetch8().await;
                    self.pc = self.pc.wrapping_add(offset as i8 as u16);
                    self.dummy(4);
                }
                0x20 | 0x28 | 0x30 | 0x38 => {
                    let offset = self.fetch8().await;
                    if self.condition(opcode) {
                        self.pc = self.pc.wrapping_add(offset as i8 as u16);
                        self.dummy(4);
                    }
                }

                // LD rr,d16
                0x01 | 0x11 | 0x21 | 0x31 => {
                    let val = self.fetch16().await;
                    self.set_rr(opcode, val);
                }

                // ADD HL,rr
                0x09 | 0x19 | 0x29 | 0x39 => {
                    let val = self.get_rr(opcode);
                    self.add_hl(val);
                    self.dummy(4);
                }

                // LD (rr),A with HL+/HL- forms
                0x02 | 0x12 | 0x22 | 0x32 => {
                    let addr = match opcode {
                        0x02 => self.bc(),
                        0x12 => self.de(),
                        _ => {
                            let hl = self.hl();
                            self.set_hl(if opcode == 0x22 {
                                hl.wrapping_add(1)
                            } else {
                                hl.wrapping_sub(1)
                            });
                            hl
                        }
                    };
                    let a = self.a;
                    self.write8(addr, a).await;
                }

                // LD A,(rr)
                0x0A | 0x1A | 0x2A | 0x3A => {
                    let addr = match opcode {
                        0x0A => self.bc(),
                        0x1A => self.de(),
                        _ => {
                            let hl = self.hl();
                            self.set_hl(if opcode == 0x2A {
                                hl.wrapping_add(1)
                            } else {
                                hl.wrapping_sub(1)
                            });
                            hl
                        }
                    };
                    self.a = self.read8(addr).await;
                }

                // INC rr / DEC rr
                0x03 | 0x13 | 0x23 | 0x33 => {
                    let val = self.get_rr(opcode).wrapping_add(1);
                    self.set_rr(opcode, val);
                    self.dummy(4);
                }
                0x0B | 0x1B | 0x2B | 0x3B => {
                    let val = self.get_rr(opcode).wrapping_sub(1);
                    self.set_rr(opcode, val);
                    self.dummy(4);
                }

                // INC r / DEC r
                0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                    let index = (opcode >> 3) & 0x07;
                    let val = self.read_r(index).await.wrapping_add(1);
                    self.write_r(index, val).await;
                    self.f = (self.f & FLAG_C)
                        | (if val == 0 { FLAG_Z } else { 0 })
                        | (if val & 0x0F == 0 { FLAG_H } else { 0 });
                }
                0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                    let index = (opcode >> 3) & 0x07;
                    let val = self.read_r(index).await.wrapping_sub(1);
                    self.write_r(index, val).await;
                    self.f = (self.f & FLAG_C)
                        | FLAG_N
                        | (if val == 0 { FLAG_Z } else { 0 })
                        | (if val & 0x0F == 0x0F { FLAG_H } else { 0 });
                }

                // LD r,d8
                0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                    let val = self.fetch8().await;
                    self.write_r((opcode >> 3) & 0x07, val).await;
                }

                // Accumulator rotates clear Z.
                0x07 => {
                    let carry = self.a >> 7;
                    self.a = (self.a << 1) | carry;
                    self.f = if carry != 0 { FLAG_C } else { 0 };
                }
                0x0F => {
                    let carry = self.a & 1;
                    self.a = (self.a >> 1) | (carry << 7);
                    self.f = if carry != 0 { FLAG_C } else { 0 };
                }
                0x17 => {
                    let carry_in = (self.f >> 4) & 1;
                    let carry = self.a >> 7;
                    self.a = (self.a << 1) | carry_in;
                    self.f = if carry != 0 { FLAG_C } else { 0 };
                }
                0x1F => {
                    let carry_in = (self.f >> 4) & 1;
                    let carry = self.a & 1;
                    self.a = (self.a >> 1) | (carry_in << 7);
                    self.f = if carry != 0 { FLAG_C } else { 0 };
                }

                0x27 => self.daa(),

                0x2F => {
                    // CPL
                    self.a = !self.a;
                    self.f |= FLAG_N | FLAG_H;
                }
                0x37 => {
                    // SCF
                    self.f = (self.f & FLAG_Z) | FLAG_C;
                }
                0x3F => {
                    // CCF
                    self.f = (self.f & FLAG_Z) | ((self.f ^ FLAG_C) & FLAG_C);
                }

                // HALT
                0x76 => {
                    self.ime = self.ime_pending;
                    let pending = self.pending_interrupts();
                    if pending == 0 {
                        let halt_start = self.sched.get_cycle_counter();
                        self.wake.reset();
                        self.wake.wait(Unit::Cpu).await;
                        // The wake can land mid-M-cycle; realign so the
                        // interrupt sample at the loop top hits T-cycle 2.
                        let elapsed =
                            self.sched.get_cycle_counter().wrapping_sub(halt_start);
                        self.dummy((4 - elapsed % 4) % 4);
                    } else if !self.ime {
                        // HALT bug: the next opcode executes twice.
                        halt_bug = true;
                    }
                }

                // LD r,r
                0x40..=0x7F => {
                    let val = self.read_r(opcode & 0x07).await;
                    self.write_r((opcode >> 3) & 0x07, val).await;
                }

                // ALU A,r
                0x80..=0xBF => {
                    let val = self.read_r(opcode & 0x07).await;
                    self.alu((opcode >> 3) & 0x07, val);
                }

                // RET cc / RET / RETI
                0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                    // The condition check takes an extra internal cycle.
                    self.dummy(4);
                    if self.condition(opcode) {
                        self.pc = self.pop16().await;
                        self.dummy(4);
                    }
                }
                0xC9 => {
                    self.pc = self.pop16().await;
                    self.dummy(4);
                }
                0xD9 => {
                    self.pc = self.pop16().await;
                    self.ime = true;
                    self.ime_pending = true;
                    self.dummy(4);
                }

                // POP / PUSH
                0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                    let val = self.pop16().await;
                    match (opcode >> 4) & 0x03 {
                        0 => self.set_bc(val),
                        1 => self.set_de(val),
                        2 => self.set_hl(val),
                        _ => self.set_af(val),
                    }
                }
                0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                    let val = match (opcode >> 4) & 0x03 {
                        0 => self.bc(),
                        1 => self.de(),
                        2 => self.hl(),
                        _ => self.af(),
                    };
                    self.push16(val).await;
                }

                // JP cc / JP / JP HL
                0xC2 | 0xCA | 0xD2 | 0xDA => {
                    let dest = self.fetch16().await;
                    if self.condition(opcode) {
                        self.pc = dest;
                        self.dummy(4);
                    }
                }
                0xC3 => {
                    self.pc = self.fetch16().await;
                    self.dummy(4);
                }
                0xE9 => self.pc = self.hl(),

                // CALL cc / CALL
                0xC4 | 0xCC | 0xD4 | 0xDC => {
                    let dest = self.fetch16().await;
                    if self.condition(opcode) {
                        let pc = self.pc;
                        self.push16(pc).await;
                        self.pc = dest;
                    }
                }
                0xCD => {
                    let dest = self.fetch16().await;
                    let pc = self.pc;
                    self.push16(pc).await;
                    self.pc = dest;
                }

                // ALU A,d8
                0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                    let val = self.fetch8().await;
                    self.alu((opcode >> 3) & 0x07, val);
                }

                // RST
                0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                    let pc = self.pc;
                    self.push16(pc).await;
                    self.pc = (opcode & 0x38) as u16;
                }

                // LDH / LD (C)
                0xE0 => {
                    let offset = self.fetch8().await as u16;
                    let a = self.a;
                    self.write8(0xFF00 + offset, a).await;
                }
                0xF0 => {
                    let offset = self.fetch8().await as u16;
                    self.a = self.read8(0xFF00 + offset).await;
                }
                0xE2 => {
                    let addr = 0xFF00 + self.c as u16;
                    let a = self.a;
                    self.write8(addr, a).await;
                }
                0xF2 => {
                    let addr = 0xFF00 + self.c as u16;
                    self.a = self.read8(addr).await;
                }

                // LD (a16),A / LD A,(a16)
                0xEA => {
                    let addr = self.fetch16().await;
                    let a = self.a;
                    self.write8(addr, a).await;
                }
                0xFA => {
                    let addr = self.fetch16().await;
                    self.a = self.read8(addr).await;
                }

                // ADD SP,r8 / LD HL,SP+r8 / LD SP,HL
                0xE8 => {
                    let offset = self.fetch8().await;
                    self.sp = self.sp_plus_offset(offset);
                    self.dummy(8);
                }
                0xF8 => {
                    let offset = self.fetch8().await;
                    let result = self.sp_plus_offset(offset);
                    self.set_hl(result);
                    self.dummy(4);
                }
                0xF9 => {
                    self.sp = self.hl();
                    self.dummy(4);
                }

                // DI / EI
                0xF3 => {
                    self.ime = false;
                    self.ime_pending = false;
                }
                0xFB => self.ime_pending = true,

                // CB-prefixed bit operations
                0xCB => {
                    let op = self.fetch8().await;
                    let index = op & 0x07;
                    match op {
                        0x00..=0x3F => {
                            let val = self.read_r(index).await;
                            let result = self.rotate_shift((op >> 3) & 0x07, val);
                            self.write_r(index, result).await;
                        }
                        0x40..=0x7F => {
                            // BIT only reads.
                            let bit = (op >> 3) & 0x07;
                            let val = self.read_r(index).await;
                            self.f = (self.f & FLAG_C)
                                | FLAG_H
                                | (if val & (1 << bit) == 0 { FLAG_Z } else { 0 });
                        }
                        0x80..=0xBF => {
                            let bit = (op >> 3) & 0x07;
                            let val = self.read_r(index).await & !(1 << bit);
                            self.write_r(index, val).await;
                        }
                        _ => {
                            let bit = (op >> 3) & 0x07;
                            let val = self.read_r(index).await | (1 << bit);
                            self.write_r(index, val).await;
                        }
                    }
                }

                0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
                    return Err(Error::UnknownOpcode {
                        opcode,
                        pc: self.pc.wrapping_sub(1),
                    });
                }
            }
        }
    }
}
