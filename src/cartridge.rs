use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::mmu::{Mapping, Mmu, ReadHandler, ReadTarget, WriteHandler, WriteTarget};

const ROM_BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;
const MIN_ROM_SIZE: usize = 0x4000;
const MAX_ROM_SIZE: usize = 0x80_0000;

/// Header logo bytes, compared against secondary headers for multicart and
/// MMM01 detection.
pub const NINTENDO_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D,
    0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99,
    0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbcType {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
    Mmm01,
}

#[derive(Debug)]
enum MbcState {
    None,
    Mbc1 {
        /// Composite bank for the 0x4000 window: outer bits already merged.
        rom_bank: u8,
        /// Two-bit register at 0x4000: ROM high bits or RAM bank.
        outer_bank: u8,
        mode: u8,
        ram_enabled: bool,
        /// 1 MiB multicart wiring: outer supplies 2 of 6 bank bits, inner
        /// only 4.
        multicart: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enabled: bool,
    },
    Mbc3 {
        rom_bank: u8,
        /// Raw 0x4000 register: 0x00-0x07 RAM bank, 0x08-0x0C RTC select.
        ram_bank: u8,
        ram_enabled: bool,
        has_rtc: bool,
        /// 256 KiB multicart: the 0x4000 register picks a 32 KiB game.
        multicart: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enabled: bool,
    },
    Mmm01 {
        /// Unmapped at reset: the menu's top 32 KiB shows at 0x0000-0x7FFF.
        mapped: bool,
        mode: u8,
        /// Swaps whether the mid ROM bits come from the ROM or RAM register.
        multiplex: bool,
        ram_enabled: bool,
        rom_bank_low: u8,
        rom_bank_mid: u8,
        rom_bank_high: u8,
        ram_bank_low: u8,
        ram_bank_high: u8,
        /// Latched at 0x6000 while unmapped; locks rom_bank_low bits 1-4.
        rom_we_mask: u8,
        /// Latched at 0x0000 while unmapped; locks ram_bank_low bits.
        ram_we_mask: u8,
    },
}

/// A cartridge: ROM image, optional RAM, and the bank-controller state
/// machine that reconfigures the memory mapper on ROM-area writes.
pub struct Cartridge {
    rom: Rc<RefCell<Vec<u8>>>,
    ram: Rc<RefCell<Vec<u8>>>,
    pub mbc: MbcType,
    state: MbcState,
    cart_type: u8,
    pub title: String,
    has_battery: bool,
    save_sink: Option<Box<dyn FnMut(&[u8])>>,
    mapped: bool,
}

impl Cartridge {
    /// Build a cartridge from a raw ROM image.
    pub fn load(rom_data: Vec<u8>) -> Result<Self, Error> {
        let len = rom_data.len();
        if !(MIN_ROM_SIZE..=MAX_ROM_SIZE).contains(&len) || !len.is_multiple_of(ROM_BANK_SIZE) {
            return Err(Error::BadRomSize(len));
        }

        // A menu cart's live header sits in the top 32 KiB, which is what
        // maps at reset.
        let mmm01 = detect_mmm01(&rom_data);
        let header_base = if mmm01 { len - 0x8000 } else { 0 };
        let header = Header {
            data: &rom_data,
            base: header_base,
        };

        let cart_type = header.cart_type();
        let mbc = if mmm01 {
            MbcType::Mmm01
        } else {
            match cart_type {
                0x00 | 0x08 | 0x09 => MbcType::None,
                0x01..=0x03 => MbcType::Mbc1,
                0x05 | 0x06 => MbcType::Mbc2,
                0x0B..=0x0D => MbcType::Mmm01,
                0x0F..=0x13 => MbcType::Mbc3,
                0x19..=0x1E => MbcType::Mbc5,
                other => return Err(Error::UnsupportedCartType(other)),
            }
        };

        let ram_size = if mbc == MbcType::Mbc2 {
            0x200
        } else {
            ram_size_bytes(header.ram_size_code())?
        };

        if mbc == MbcType::Mbc1 && len > 0x8_0000 && ram_size > RAM_BANK_SIZE {
            // The 0x4000 register cannot bank both large ROM and large RAM.
            return Err(Error::UnsupportedMbc1Layout);
        }

        let state = match mbc {
            MbcType::None => MbcState::None,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                outer_bank: 0,
                mode: 0,
                ram_enabled: false,
                multicart: detect_mbc1_multicart(&rom_data),
            },
            MbcType::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enabled: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enabled: false,
                has_rtc: matches!(cart_type, 0x0F | 0x10),
                multicart: detect_mbc3_multicart(&rom_data),
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enabled: false,
            },
            MbcType::Mmm01 => MbcState::Mmm01 {
                mapped: false,
                mode: 0,
                multiplex: false,
                ram_enabled: false,
                rom_bank_low: 0,
                rom_bank_mid: 0,
                rom_bank_high: 0,
                ram_bank_low: 0,
                ram_bank_high: 0,
                rom_we_mask: 0,
                ram_we_mask: 0,
            },
        };

        let title = header.title();
        let cart = Self {
            rom: Rc::new(RefCell::new(rom_data)),
            ram: Rc::new(RefCell::new(vec![0; ram_size])),
            mbc,
            state,
            cart_type,
            title,
            has_battery: matches!(
                cart_type,
                0x03 | 0x06 | 0x09 | 0x0D | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
            ),
            save_sink: None,
            mapped: false,
        };
        log::info!(
            target: "cartridge",
            "loaded \"{}\": {:?} (type {:#04X}), ROM {} KiB, RAM {} KiB",
            cart.title,
            cart.mbc,
            cart.cart_type,
            len / 1024,
            ram_size / 1024,
        );
        Ok(cart)
    }

    /// Route RAM flushes to the host. File handling stays outside the core.
    pub fn set_save_sink(&mut self, sink: impl FnMut(&[u8]) + 'static) {
        self.save_sink = Some(Box::new(sink));
    }

    /// Overwrite battery RAM from a save image. A short image is a
    /// configuration error; extra bytes are ignored.
    pub fn load_battery_ram(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut ram = self.ram.borrow_mut();
        let want = ram.len();
        if bytes.len() < want {
            return Err(Error::SaveRamTooSmall {
                got: bytes.len(),
                want,
            });
        }
        ram.copy_from_slice(&bytes[..want]);
        Ok(())
    }

    pub fn dump_battery_ram(&self) -> Vec<u8> {
        self.ram.borrow().clone()
    }

    /// Install the cartridge's ROM and RAM windows on the mapper.
    pub fn map(this: &Rc<RefCell<Self>>, mmu: &mut Mmu) {
        {
            let mut c = this.borrow_mut();
            assert!(!c.mapped, "cartridge is already mapped");
            c.mapped = true;
        }
        Self::install_rom_windows(this, mmu);
        Self::install_ram_window(this, mmu);
    }

    /// Remove this cartridge's windows and flush battery RAM to the sink.
    pub fn unmap(&mut self, mmu: &mut Mmu) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        match self.state {
            MbcState::None => mmu.remove_mapping(0x0000, 0x7FFF),
            _ => {
                mmu.remove_mapping(0x0000, 0x3FFF);
                mmu.remove_mapping(0x4000, 0x7FFF);
            }
        }
        if let Some((start, end)) = self.ram_window_range() {
            mmu.remove_mapping(start, end);
        }
        self.flush_save();
    }

    fn flush_save(&mut self) {
        if !self.has_battery {
            return;
        }
        if let Some(sink) = self.save_sink.as_mut() {
            let ram = self.ram.borrow();
            if !ram.is_empty() {
                sink(&ram);
            }
        }
    }

    fn write_handler(this: &Rc<RefCell<Self>>) -> WriteHandler {
        let cart = Rc::clone(this);
        Rc::new(move |mmu: &mut Mmu, addr: u16, val: u8| {
            Cartridge::rom_write(&cart, mmu, addr, val);
        })
    }

    fn install_rom_windows(this: &Rc<RefCell<Self>>, mmu: &mut Mmu) {
        let (rom, plain, off0, offx, intercept_high) = {
            let c = this.borrow();
            (
                Rc::clone(&c.rom),
                matches!(c.state, MbcState::None),
                c.rom0_offset(),
                c.romx_offset(),
                !matches!(c.state, MbcState::Mbc2 { .. }),
            )
        };
        if plain {
            mmu.set_mapping(Mapping::rom(0x0000, 0x7FFF, &rom, 0, WriteTarget::Ignore));
            return;
        }
        let handler = Self::write_handler(this);
        mmu.set_mapping(Mapping::rom(
            0x0000,
            0x3FFF,
            &rom,
            off0,
            WriteTarget::Handler(handler.clone()),
        ));
        let write_high = if intercept_high {
            WriteTarget::Handler(handler)
        } else {
            WriteTarget::Ignore
        };
        mmu.set_mapping(Mapping::rom(0x4000, 0x7FFF, &rom, offx, write_high));
    }

    /// Refresh the 0xA000 window to match RAM enable/bank state. Disabled RAM
    /// leaves a null window: reads 0xFF, writes discarded.
    fn install_ram_window(this: &Rc<RefCell<Self>>, mmu: &mut Mmu) {
        enum Plan {
            Open,
            Bytes(usize),
            Nibble,
        }
        let (ram, range, plan) = {
            let c = this.borrow();
            let Some(range) = c.ram_window_range() else {
                return;
            };
            let plan = if !c.ram_enabled() {
                Plan::Open
            } else if matches!(c.state, MbcState::Mbc2 { .. }) {
                Plan::Nibble
            } else {
                match c.ram_offset() {
                    Some(offset) => Plan::Bytes(offset),
                    None => Plan::Open,
                }
            };
            (Rc::clone(&c.ram), range, plan)
        };
        let (start, end) = range;
        match plan {
            Plan::Open => mmu.set_mapping(Mapping::open(start, end)),
            Plan::Bytes(offset) => mmu.set_mapping(Mapping::ram(start, end, &ram, offset)),
            Plan::Nibble => {
                // MBC2: 512 half-bytes, upper nibble reads back as 1s.
                let read_ram = Rc::clone(&ram);
                let read: ReadHandler = Rc::new(move |_mmu, addr| {
                    let idx = (addr as usize - 0xA000) & 0x1FF;
                    0xF0 | (read_ram.borrow().get(idx).copied().unwrap_or(0x0F) & 0x0F)
                });
                let write_ram = Rc::clone(&ram);
                let write: WriteHandler = Rc::new(move |_mmu, addr, val| {
                    let idx = (addr as usize - 0xA000) & 0x1FF;
                    if let Some(b) = write_ram.borrow_mut().get_mut(idx) {
                        *b = val & 0x0F;
                    }
                });
                mmu.set_mapping(Mapping {
                    start,
                    end,
                    read: ReadTarget::Handler(read),
                    write: WriteTarget::Handler(write),
                });
            }
        }
    }

    fn rom_write(this: &Rc<RefCell<Self>>, mmu: &mut Mmu, addr: u16, val: u8) {
        let (remap_rom, remap_ram) = this.borrow_mut().handle_rom_write(addr, val);
        if remap_rom {
            Self::install_rom_windows(this, mmu);
        }
        if remap_ram {
            Self::install_ram_window(this, mmu);
        }
    }

    /// Apply a 0x0000-0x7FFF write to the bank registers. Returns which
    /// windows (rom, ram) must be re-installed.
    fn handle_rom_write(&mut self, addr: u16, val: u8) -> (bool, bool) {
        match &mut self.state {
            MbcState::None => (false, false),
            MbcState::Mbc1 {
                rom_bank,
                outer_bank,
                mode,
                ram_enabled,
                multicart,
            } => match addr {
                0x0000..=0x1FFF => {
                    *ram_enabled = val & 0x0F == 0x0A;
                    (false, true)
                }
                0x2000..=0x3FFF => {
                    // Bank 0 selects bank 1; only the masked low bits count.
                    let (bank_mask, keep) = if *multicart { (0x0F, 0xF0) } else { (0x1F, 0xE0) };
                    let low = (val & bank_mask).max(1);
                    *rom_bank = (*rom_bank & keep) | low;
                    (true, false)
                }
                0x4000..=0x5FFF => {
                    *outer_bank = val & 0x03;
                    let (shift, keep) = if *multicart { (4, 0x0F) } else { (5, 0x1F) };
                    *rom_bank = (*rom_bank & keep) | (*outer_bank << shift);
                    (true, *mode == 1)
                }
                _ => {
                    *mode = val & 0x01;
                    (true, true)
                }
            },
            MbcState::Mbc2 {
                rom_bank,
                ram_enabled,
            } => {
                if addr >= 0x4000 {
                    return (false, false);
                }
                // Address bit 8 selects the register: clear = RAM gate,
                // set = ROM bank.
                if addr & 0x0100 == 0 {
                    *ram_enabled = val & 0x0F == 0x0A;
                    (false, true)
                } else {
                    *rom_bank = (val & 0x0F).max(1);
                    (true, false)
                }
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enabled,
                has_rtc,
                multicart,
            } => match addr {
                0x0000..=0x1FFF => {
                    *ram_enabled = val & 0x0F == 0x0A;
                    (false, true)
                }
                0x2000..=0x3FFF => {
                    *rom_bank = (val & 0x7F).max(1);
                    (true, false)
                }
                0x4000..=0x5FFF => {
                    *ram_bank = val & 0x0F;
                    if (0x08..=0x0C).contains(ram_bank) {
                        log::warn!(
                            target: "cartridge",
                            "MBC3 RTC register {:#04X} selected; RTC is not modeled",
                            ram_bank
                        );
                    }
                    (*multicart, true)
                }
                _ => {
                    if *has_rtc && val == 0x01 {
                        log::warn!(target: "cartridge", "MBC3 RTC latch ignored; RTC is not modeled");
                    }
                    (false, false)
                }
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enabled,
            } => match addr {
                0x0000..=0x1FFF => {
                    *ram_enabled = val & 0x0F == 0x0A;
                    (false, true)
                }
                // Unlike the other MBCs, bank 0 is selectable.
                0x2000..=0x2FFF => {
                    *rom_bank = (*rom_bank & 0x100) | val as u16;
                    (true, false)
                }
                0x3000..=0x3FFF => {
                    *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
                    (true, false)
                }
                0x4000..=0x5FFF => {
                    *ram_bank = val & 0x0F;
                    (false, true)
                }
                _ => (false, false),
            },
            MbcState::Mmm01 {
                mapped,
                mode,
                multiplex,
                ram_enabled,
                rom_bank_low,
                rom_bank_mid,
                rom_bank_high,
                ram_bank_low,
                ram_bank_high,
                rom_we_mask,
                ram_we_mask,
            } => match addr {
                0x0000..=0x1FFF => {
                    if !*mapped {
                        *ram_we_mask = (val >> 4) & 0x03;
                        if val & 0x40 != 0 {
                            *mapped = true;
                        }
                    }
                    *ram_enabled = val & 0x0F == 0x0A;
                    (true, true)
                }
                0x2000..=0x3FFF => {
                    if !*mapped {
                        *rom_bank_low = val & 0x1F;
                        *rom_bank_mid = (val >> 5) & 0x03;
                    } else {
                        let writable = !(*rom_we_mask << 1) & 0x1F;
                        *rom_bank_low = (*rom_bank_low & !writable) | (val & writable);
                    }
                    (true, false)
                }
                0x4000..=0x5FFF => {
                    if !*mapped {
                        *ram_bank_low = val & 0x03;
                        *ram_bank_high = (val >> 2) & 0x03;
                        *rom_bank_high = (val >> 4) & 0x03;
                    } else {
                        let writable = !*ram_we_mask & 0x03;
                        *ram_bank_low = (*ram_bank_low & !writable) | (val & writable);
                    }
                    (true, true)
                }
                _ => {
                    if !*mapped {
                        *mode = val & 0x01;
                        *rom_we_mask = (val >> 2) & 0x0F;
                        *multiplex = val & 0x40 != 0;
                    } else {
                        *mode = val & 0x01;
                    }
                    (true, true)
                }
            },
        }
    }

    fn rom_len(&self) -> usize {
        self.rom.borrow().len()
    }

    fn ram_len(&self) -> usize {
        self.ram.borrow().len()
    }

    /// Bank shown in the 0x0000-0x3FFF window.
    fn rom0_offset(&self) -> usize {
        let bank = match &self.state {
            MbcState::Mbc1 {
                mode,
                outer_bank,
                multicart,
                ..
            } => {
                if *mode == 1 {
                    let shift = if *multicart { 4 } else { 5 };
                    (*outer_bank as usize) << shift
                } else {
                    0
                }
            }
            MbcState::Mbc3 {
                multicart: true,
                ram_bank,
                ..
            } => (*ram_bank as usize) * 2,
            MbcState::Mmm01 { .. } => self.mmm01_banks().0,
            _ => 0,
        };
        (bank * ROM_BANK_SIZE) % self.rom_len()
    }

    /// Bank shown in the 0x4000-0x7FFF window.
    fn romx_offset(&self) -> usize {
        let bank = match &self.state {
            MbcState::None => 1,
            MbcState::Mbc1 { rom_bank, .. } => *rom_bank as usize,
            MbcState::Mbc2 { rom_bank, .. } => *rom_bank as usize,
            MbcState::Mbc3 {
                multicart,
                rom_bank,
                ram_bank,
                ..
            } => {
                if *multicart {
                    (*ram_bank as usize) * 2 + 1
                } else {
                    *rom_bank as usize
                }
            }
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
            MbcState::Mmm01 { .. } => self.mmm01_banks().1,
        };
        (bank * ROM_BANK_SIZE) % self.rom_len()
    }

    /// (rom0 bank, romx bank) for the MMM01's composite registers.
    fn mmm01_banks(&self) -> (usize, usize) {
        let MbcState::Mmm01 {
            mapped,
            multiplex,
            rom_bank_low,
            rom_bank_mid,
            rom_bank_high,
            ram_bank_low,
            rom_we_mask,
            ..
        } = &self.state
        else {
            return (0, 0);
        };
        if !*mapped {
            return (0x1FE, 0x1FF);
        }
        let mid = if *multiplex {
            *ram_bank_low
        } else {
            *rom_bank_mid
        };
        let base = ((*rom_bank_high as usize) << 7) | ((mid as usize) << 5);
        let mut low = *rom_bank_low & 0x1F;
        let unmasked = !(*rom_we_mask << 1) & 0x1F;
        if low & unmasked == 0 {
            // Bank-0 translation applies to the writable slice of the
            // register.
            low |= 1;
        }
        (base, base | low as usize)
    }

    fn ram_enabled(&self) -> bool {
        match &self.state {
            MbcState::None => true,
            MbcState::Mbc1 { ram_enabled, .. }
            | MbcState::Mbc2 { ram_enabled, .. }
            | MbcState::Mbc3 { ram_enabled, .. }
            | MbcState::Mbc5 { ram_enabled, .. }
            | MbcState::Mmm01 { ram_enabled, .. } => *ram_enabled,
        }
    }

    /// Byte offset of the active RAM bank, or `None` when the selected bank
    /// is not backed (MBC3 RTC registers).
    fn ram_offset(&self) -> Option<usize> {
        let len = self.ram_len();
        if len == 0 {
            return None;
        }
        let bank = match &self.state {
            MbcState::None | MbcState::Mbc2 { .. } => 0,
            MbcState::Mbc1 {
                mode, outer_bank, ..
            } => {
                if *mode == 1 {
                    *outer_bank as usize
                } else {
                    0
                }
            }
            MbcState::Mbc3 { ram_bank, .. } => {
                let bank_mask = if len > 4 * RAM_BANK_SIZE { 0x07 } else { 0x03 };
                if *ram_bank & !bank_mask != 0 {
                    return None;
                }
                (*ram_bank & bank_mask) as usize
            }
            MbcState::Mbc5 { ram_bank, .. } => *ram_bank as usize,
            MbcState::Mmm01 {
                mode,
                multiplex,
                ram_bank_low,
                ram_bank_high,
                rom_bank_mid,
                ..
            } => {
                let low = if *multiplex {
                    *rom_bank_mid
                } else {
                    *ram_bank_low
                };
                let low = if *mode == 1 { low } else { 0 };
                ((*ram_bank_high as usize) << 2) | low as usize
            }
        };
        Some((bank * RAM_BANK_SIZE) % len)
    }

    /// Address range of the external-RAM window, if the cart has any RAM.
    fn ram_window_range(&self) -> Option<(u16, u16)> {
        if matches!(self.state, MbcState::Mbc2 { .. }) {
            return Some((0xA000, 0xA1FF));
        }
        let len = self.ram_len();
        if len == 0 {
            None
        } else if len >= RAM_BANK_SIZE {
            Some((0xA000, 0xBFFF))
        } else {
            Some((0xA000, 0xA000 + len as u16 - 1))
        }
    }
}

impl Drop for Cartridge {
    fn drop(&mut self) {
        if self.mapped {
            self.flush_save();
        }
    }
}

fn ram_size_bytes(code: u8) -> Result<usize, Error> {
    match code {
        0x00 => Ok(0),
        0x01 => Ok(0x800),
        0x02 => Ok(0x2000),
        0x03 => Ok(0x8000),
        0x04 => Ok(0x2_0000),
        0x05 => Ok(0x1_0000),
        other => Err(Error::InvalidRamSizeCode(other)),
    }
}

fn rom_size_from_code(code: u8) -> Option<usize> {
    (code <= 8).then(|| 0x8000usize << code)
}

fn logo_at(rom: &[u8], offset: usize) -> bool {
    rom.get(offset..offset + NINTENDO_LOGO.len())
        .is_some_and(|s| s == NINTENDO_LOGO)
}

/// 1 MiB MBC1 multicarts duplicate the logo in the headers of banks 0x10 and
/// 0x20.
fn detect_mbc1_multicart(rom: &[u8]) -> bool {
    rom.len() == 0x10_0000
        && logo_at(rom, 0x10 * ROM_BANK_SIZE + 0x0104)
        && logo_at(rom, 0x20 * ROM_BANK_SIZE + 0x0104)
}

/// 256 KiB MBC3 multicarts carry 32 KiB games with headers in banks 2 and 4.
fn detect_mbc3_multicart(rom: &[u8]) -> bool {
    rom.len() == 0x4_0000
        && logo_at(rom, 2 * ROM_BANK_SIZE + 0x0104)
        && logo_at(rom, 4 * ROM_BANK_SIZE + 0x0104)
}

/// Menu carts are recognized by a valid header in the top 32 KiB whose size
/// code matches the image while the primary header's does not.
fn detect_mmm01(rom: &[u8]) -> bool {
    if rom.len() < 0x4_0000 {
        return false;
    }
    let tail = rom.len() - 0x8000;
    if !logo_at(rom, tail + 0x0104) {
        return false;
    }
    let tail_matches = rom
        .get(tail + 0x0148)
        .and_then(|&c| rom_size_from_code(c))
        .is_some_and(|size| size == rom.len());
    let primary_matches = rom
        .get(0x0148)
        .and_then(|&c| rom_size_from_code(c))
        .is_some_and(|size| size == rom.len());
    tail_matches && !primary_matches
}

struct Header<'a> {
    data: &'a [u8],
    base: usize,
}

impl Header<'_> {
    fn byte(&self, offset: usize) -> u8 {
        self.data.get(self.base + offset).copied().unwrap_or(0)
    }

    fn title(&self) -> String {
        let start = (self.base + 0x0134).min(self.data.len());
        let end = (self.base + 0x0144).min(self.data.len());
        let mut slice = &self.data[start..end];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cart_type(&self) -> u8 {
        self.byte(0x0147)
    }

    fn ram_size_code(&self) -> u8 {
        self.byte(0x0149)
    }
}
