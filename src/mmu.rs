use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::input::Input;
use crate::interrupt::Signal;
use crate::scheduler::{PRIORITY_WRITE, Scheduler, Unit};
use crate::serial::Serial;
use crate::timer::Timer;

pub const IF_VBLANK: u8 = 0x01;
pub const IF_STAT: u8 = 0x02;
pub const IF_TIMER: u8 = 0x04;
pub const IF_SERIAL: u8 = 0x08;
pub const IF_JOYPAD: u8 = 0x10;
/// The five live interrupt bits of IF/IE.
pub const INT_MASK: u8 = 0x1F;

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7F;
const BOOT_ROM_SIZE: usize = 0x100;

// Read-back masks for the audio registers; unreadable bits come back as 1.
const AUDIO_REG_MASKS: [u8; 20] = [
    0x80, 0x3F, 0x00, 0x00, 0xB8, // NR10-NR14
    0xFF, 0x3F, 0x00, 0x00, 0xB8, // NR20-NR24
    0x7F, 0xFF, 0x9F, 0x00, 0xB8, // NR30-NR34
    0xFF, 0xFF, 0x00, 0x00, 0xBF, // NR40-NR44
];
const AUDIO_CONTROL_MASKS: [u8; 3] = [0x00, 0x00, 0x70]; // NR50-NR52

/// A window of bytes shared with the component that owns them.
#[derive(Clone)]
pub struct ByteWindow {
    data: Rc<RefCell<Vec<u8>>>,
    offset: usize,
}

impl ByteWindow {
    pub fn new(data: &Rc<RefCell<Vec<u8>>>, offset: usize) -> Self {
        Self {
            data: Rc::clone(data),
            offset,
        }
    }

    fn read(&self, rel: usize) -> u8 {
        self.data.borrow().get(self.offset + rel).copied().unwrap_or(0xFF)
    }

    fn write(&self, rel: usize, val: u8) {
        if let Some(b) = self.data.borrow_mut().get_mut(self.offset + rel) {
            *b = val;
        }
    }
}

pub type ReadHandler = Rc<dyn Fn(&mut Mmu, u16) -> u8>;
pub type WriteHandler = Rc<dyn Fn(&mut Mmu, u16, u8)>;

#[derive(Clone)]
pub enum ReadTarget {
    /// Nothing behind the window; reads see 0xFF.
    Open,
    Bytes(ByteWindow),
    Handler(ReadHandler),
}

#[derive(Clone)]
pub enum WriteTarget {
    /// Writes in range are silently discarded.
    Ignore,
    Bytes(ByteWindow),
    Handler(WriteHandler),
}

/// One registered address-space mapping; `end` is inclusive.
#[derive(Clone)]
pub struct Mapping {
    pub start: u16,
    pub end: u16,
    pub read: ReadTarget,
    pub write: WriteTarget,
}

impl Mapping {
    /// A null window: reads 0xFF, writes discarded.
    pub fn open(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            read: ReadTarget::Open,
            write: WriteTarget::Ignore,
        }
    }

    /// A read/write byte window.
    pub fn ram(start: u16, end: u16, data: &Rc<RefCell<Vec<u8>>>, offset: usize) -> Self {
        Self {
            start,
            end,
            read: ReadTarget::Bytes(ByteWindow::new(data, offset)),
            write: WriteTarget::Bytes(ByteWindow::new(data, offset)),
        }
    }

    /// A read-only byte window with an optional write interceptor.
    pub fn rom(
        start: u16,
        end: u16,
        data: &Rc<RefCell<Vec<u8>>>,
        offset: usize,
        write: WriteTarget,
    ) -> Self {
        Self {
            start,
            end,
            read: ReadTarget::Bytes(ByteWindow::new(data, offset)),
            write,
        }
    }
}

pub struct Interrupts {
    pub cpu_wake: Signal,
}

/// The memory mapper: serves 8-bit reads and writes on the 16-bit address
/// space, dispatching to registered mappings first and the fixed DMG layout
/// (WRAM, echo, HRAM, I/O registers) as the fallback.
pub struct Mmu {
    sched: Scheduler,
    weak_self: Weak<RefCell<Mmu>>,
    mappings: Vec<Mapping>,
    pub wram: [u8; WRAM_SIZE],
    pub hram: [u8; HRAM_SIZE],
    pub if_reg: u8,
    pub ie_reg: u8,
    pub input: Input,
    pub serial: Serial,
    pub timer: Timer,
    audio_regs: [u8; 20],
    audio_control: [u8; 3],
    audio_wave: [u8; 16],
    boot_rom: Option<Rc<RefCell<Vec<u8>>>>,
    boot_rom_disabled: bool,
    pub interrupts: Interrupts,
}

impl Mmu {
    pub fn new(sched: Scheduler) -> Rc<RefCell<Mmu>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(Mmu {
                weak_self: weak.clone(),
                mappings: Vec::new(),
                wram: [0; WRAM_SIZE],
                hram: [0; HRAM_SIZE],
                if_reg: 0,
                ie_reg: 0,
                input: Input::new(),
                serial: Serial::new(),
                timer: Timer::new(),
                audio_regs: AUDIO_REG_MASKS,
                audio_control: AUDIO_CONTROL_MASKS,
                audio_wave: [0; 16],
                boot_rom: None,
                boot_rom_disabled: true,
                interrupts: Interrupts {
                    cpu_wake: Signal::new(&sched),
                },
                sched,
            })
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Install a 256-byte boot ROM overlay at 0x0000. A later write of 0x01
    /// to 0xFF50 removes it again.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if data.len() != BOOT_ROM_SIZE {
            return Err(Error::BadBootRomSize(data.len()));
        }
        let rom = Rc::new(RefCell::new(data));
        self.set_mapping(Mapping::rom(0x0000, 0x00FF, &rom, 0, WriteTarget::Ignore));
        self.boot_rom = Some(rom);
        self.boot_rom_disabled = false;
        Ok(())
    }

    /// Register `mapping`, replacing any existing mapping with the exact same
    /// range.
    pub fn set_mapping(&mut self, mapping: Mapping) {
        debug_assert!(mapping.start <= mapping.end);
        let key = (mapping.start, mapping.end);
        match self.mappings.binary_search_by(|m| (m.start, m.end).cmp(&key)) {
            Ok(pos) => self.mappings[pos] = mapping,
            Err(pos) => self.mappings.insert(pos, mapping),
        }
    }

    /// Remove the mapping with exactly this range. Absence is a bug in the
    /// caller.
    pub fn remove_mapping(&mut self, start: u16, end: u16) {
        let key = (start, end);
        match self.mappings.binary_search_by(|m| (m.start, m.end).cmp(&key)) {
            Ok(pos) => {
                self.mappings.remove(pos);
            }
            Err(_) => panic!("no mapping registered at {start:#06X}-{end:#06X}"),
        }
    }

    /// Innermost registered mapping containing `addr`. The table is sorted by
    /// (start, end), so of two nested ranges with one start the shorter one
    /// matches first.
    fn find_mapping(&self, addr: u16) -> Option<usize> {
        self.mappings
            .iter()
            .position(|m| addr >= m.start && addr <= m.end)
    }

    pub fn read8(&mut self, addr: u16) -> u8 {
        if let Some(idx) = self.find_mapping(addr) {
            let start = self.mappings[idx].start;
            return match self.mappings[idx].read.clone() {
                ReadTarget::Open => 0xFF,
                ReadTarget::Bytes(w) => w.read((addr - start) as usize),
                ReadTarget::Handler(h) => h(self, addr),
            };
        }
        self.read_default(addr)
    }

    pub fn write8(&mut self, addr: u16, val: u8) {
        if let Some(idx) = self.find_mapping(addr) {
            let start = self.mappings[idx].start;
            match self.mappings[idx].write.clone() {
                WriteTarget::Ignore => {}
                WriteTarget::Bytes(w) => w.write((addr - start) as usize, val),
                WriteTarget::Handler(h) => h(self, addr, val),
            }
            return;
        }
        self.write_default(addr, val);
    }

    fn read_default(&mut self, addr: u16) -> u8 {
        match addr {
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize],
            // Echo RAM mirrors WRAM.
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize],
            0xFF00 => self.input.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => {
                let now = self.sched.get_cycle_counter();
                self.timer.read(addr, now)
            }
            0xFF0F => self.if_reg | !INT_MASK,
            0xFF10..=0xFF23 => self.audio_regs[(addr - 0xFF10) as usize],
            0xFF24..=0xFF26 => self.audio_control[(addr - 0xFF24) as usize],
            0xFF30..=0xFF3F => self.audio_wave[(addr - 0xFF30) as usize],
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg | !INT_MASK,
            _ => 0xFF,
        }
    }

    fn write_default(&mut self, addr: u16, val: u8) {
        match addr {
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize] = val,
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize] = val,
            0xFF00 => self.input.write(val),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => {
                let now = self.sched.get_cycle_counter();
                if self.timer.write(addr, val, now) {
                    self.raise_interrupt(IF_TIMER);
                }
                self.reschedule_timer_overflow();
            }
            0xFF0F => self.if_reg = val & INT_MASK,
            0xFF10..=0xFF23 => {
                let i = (addr - 0xFF10) as usize;
                self.audio_regs[i] = AUDIO_REG_MASKS[i] | val;
            }
            0xFF24..=0xFF26 => {
                let i = (addr - 0xFF24) as usize;
                self.audio_control[i] = AUDIO_CONTROL_MASKS[i] | val;
            }
            0xFF30..=0xFF3F => self.audio_wave[(addr - 0xFF30) as usize] = val,
            0xFF50 => {
                if !self.boot_rom_disabled && val == 0x01 {
                    self.boot_rom_disabled = true;
                    self.remove_mapping(0x0000, 0x00FF);
                    self.boot_rom = None;
                    log::trace!(target: "mmu", "boot ROM unmapped");
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val & INT_MASK,
            _ => {}
        }
    }

    /// Set an IF bit and wake a halted CPU if the interrupt can be taken.
    pub fn raise_interrupt(&mut self, bit: u8) {
        self.if_reg |= bit & INT_MASK;
        if self.if_reg & self.ie_reg & INT_MASK != 0 {
            self.interrupts.cpu_wake.trigger();
        }
    }

    /// Re-derive and queue the next TIMA overflow instant. Any previously
    /// queued prediction is invalidated via the timer's generation counter.
    fn reschedule_timer_overflow(&mut self) {
        let now = self.sched.get_cycle_counter();
        let generation = self.timer.bump_generation();
        if let Some(delta) = self.timer.cycles_to_overflow(now) {
            let weak = self.weak_self.clone();
            self.sched.enqueue(
                now.wrapping_add(delta),
                Unit::Debug,
                PRIORITY_WRITE,
                move || {
                    if let Some(mmu) = weak.upgrade() {
                        mmu.borrow_mut().on_timer_overflow(generation);
                    }
                },
            );
        }
    }

    fn on_timer_overflow(&mut self, generation: u64) {
        if generation != self.timer.generation() {
            return;
        }
        let now = self.sched.get_cycle_counter();
        self.timer.sync(now);
        self.raise_interrupt(IF_TIMER);
        self.reschedule_timer_overflow();
    }
}
