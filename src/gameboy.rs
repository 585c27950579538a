use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::cartridge::Cartridge;
use crate::cpu::Cpu;
use crate::error::Error;
use crate::input::{Button, ButtonState};
use crate::mmu::Mmu;
use crate::ppu::Ppu;
use crate::scheduler::{Scheduler, Unit};

/// Host display palettes: 4 RGBA shades for each of the three palette banks
/// (BG, OBP0, OBP1) the screen buffer's pixels select between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PalettePreset {
    Grey,
    Green,
    Blue,
    Red,
    /// Green background, blue OBP0, red OBP1.
    Gbr,
}

const PALETTE_GREY: [u32; 4] = [0xFFFF_FFFF, 0xFFAA_AAAA, 0xFF55_5555, 0xFF00_0000];
const PALETTE_GREEN: [u32; 4] = [0xFFE0_F8D0, 0xFF88_C070, 0xFF34_6856, 0xFF08_1820];
const PALETTE_BLUE: [u32; 4] = [0xFFE5_F1F3, 0xFF7B_A8B8, 0xFF30_617B, 0xFF08_263B];
const PALETTE_RED: [u32; 4] = [0xFFF3_F1E5, 0xFFB8_A87B, 0xFF7B_6130, 0xFF3B_2608];

/// The assembled machine: scheduler, memory mapper, and the CPU/PPU/DMA
/// tasks, driven by the host through [`GameBoy::tick`].
pub struct GameBoy {
    scheduler: Scheduler,
    mmu: Rc<RefCell<Mmu>>,
    ppu: Ppu,
    cart: Option<Rc<RefCell<Cartridge>>>,
    palette: [[u32; 4]; 3],
    started: bool,
}

impl GameBoy {
    pub fn new() -> Self {
        let scheduler = Scheduler::new();
        let mmu = Mmu::new(scheduler.clone());
        let ppu = Ppu::new(&scheduler, &mmu);
        let mut gb = Self {
            scheduler,
            mmu,
            ppu,
            cart: None,
            palette: [[0; 4]; 3],
            started: false,
        };
        gb.select_palette(PalettePreset::Green);
        gb
    }

    /// Install a 256-byte boot ROM; execution will begin in it at 0x0000.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.mmu.borrow_mut().load_boot_rom(data)
    }

    /// Map a cartridge, replacing (and flushing) any previous one.
    pub fn load_cart(&mut self, cart: Cartridge) {
        if let Some(old) = self.cart.take() {
            old.borrow_mut().unmap(&mut self.mmu.borrow_mut());
        }
        let cart = Rc::new(RefCell::new(cart));
        Cartridge::map(&cart, &mut self.mmu.borrow_mut());
        self.cart = Some(cart);
    }

    /// Unmap and return the cartridge, flushing battery RAM to its sink.
    pub fn unload_cart(&mut self) -> Option<Cartridge> {
        let cart = self.cart.take()?;
        cart.borrow_mut().unmap(&mut self.mmu.borrow_mut());
        match Rc::try_unwrap(cart) {
            Ok(cell) => Some(cell.into_inner()),
            Err(rc) => {
                // A stray handler still holds the cart; keep it loaded.
                self.cart = Some(rc);
                None
            }
        }
    }

    /// Spawn the CPU, PPU and DMA tasks. Requires a loaded cartridge.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.cart.is_none() {
            return Err(Error::NoCartLoaded);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        let cpu = Cpu::new(self.scheduler.clone(), Rc::clone(&self.mmu));
        self.scheduler.spawn(Unit::Cpu, cpu.run());
        self.ppu.start();
        Ok(())
    }

    pub fn get_cycle_counter(&self) -> u32 {
        self.scheduler.get_cycle_counter()
    }

    /// Advance the machine by `num_cycles` T-cycles, surfacing any fatal
    /// task error.
    pub fn tick(&mut self, num_cycles: u32) -> Result<(), Error> {
        self.scheduler.tick(num_cycles);
        match self.scheduler.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Report a button edge. Any press pokes the CPU wake signal so HALT
    /// exits promptly.
    pub fn input(&mut self, button: Button, state: ButtonState) {
        let wake = {
            let mut mmu = self.mmu.borrow_mut();
            mmu.input.set(button, state);
            mmu.interrupts.cpu_wake.clone()
        };
        wake.trigger();
    }

    pub fn is_screen_enabled(&self) -> bool {
        self.ppu.is_screen_enabled()
    }

    /// 160x144 palette-encoded pixels: bits 0-1 shade, bits 2-3 palette bank
    /// (0 = BG, 1 = OBP0, 2 = OBP1); map through [`GameBoy::palette`].
    pub fn screen_buffer(&self) -> Ref<'_, [u8]> {
        self.ppu.screen_buffer()
    }

    /// Called by the render task at the end of each visible frame.
    pub fn set_display_callback(&mut self, callback: impl FnMut() + 'static) {
        self.ppu.set_display_callback(callback);
    }

    pub fn palette(&self) -> &[[u32; 4]; 3] {
        &self.palette
    }

    pub fn select_palette(&mut self, preset: PalettePreset) {
        self.palette = match preset {
            PalettePreset::Grey => [PALETTE_GREY; 3],
            PalettePreset::Green => [PALETTE_GREEN; 3],
            PalettePreset::Blue => [PALETTE_BLUE; 3],
            PalettePreset::Red => [PALETTE_RED; 3],
            PalettePreset::Gbr => [PALETTE_GREEN, PALETTE_BLUE, PALETTE_RED],
        };
    }

    /// Enforce OAM/VRAM lockout during PPU modes 2/3 (off by default).
    pub fn set_access_lockout(&mut self, enabled: bool) {
        self.ppu.set_access_lockout(enabled);
    }

    /// Drain bytes the ROM pushed out the serial port.
    pub fn take_serial(&mut self) -> Vec<u8> {
        self.mmu.borrow_mut().serial.take_output()
    }

    /// Direct bus access, for hosts' debug surfaces and tests.
    pub fn read8(&self, addr: u16) -> u8 {
        self.mmu.borrow_mut().read8(addr)
    }

    pub fn write8(&self, addr: u16, val: u8) {
        self.mmu.borrow_mut().write8(addr, val);
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GameBoy {
    fn drop(&mut self) {
        if let Some(cart) = self.cart.take() {
            cart.borrow_mut().unmap(&mut self.mmu.borrow_mut());
        }
    }
}
