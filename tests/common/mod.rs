#![allow(dead_code)]

use tandem_gb::cartridge::{Cartridge, NINTENDO_LOGO};
use tandem_gb::gameboy::GameBoy;

pub const ROM_BANK: usize = 0x4000;

/// Build a ROM image with a plausible header: logo, title, type and size
/// codes. `banks` must be a power of two for the size code to agree.
pub fn rom_image(banks: usize, cart_type: u8, ram_code: u8) -> Vec<u8> {
    let mut rom = vec![0u8; banks * ROM_BANK];
    rom[0x0104..0x0134].copy_from_slice(&NINTENDO_LOGO);
    rom[0x0134..0x0138].copy_from_slice(b"TEST");
    rom[0x0147] = cart_type;
    rom[0x0148] = (banks / 2).trailing_zeros() as u8;
    rom[0x0149] = ram_code;
    rom
}

/// `rom_image` with the first byte of every bank set to the bank number, so
/// tests can see which bank a window shows.
pub fn banked_rom_image(banks: usize, cart_type: u8, ram_code: u8) -> Vec<u8> {
    let mut rom = rom_image(banks, cart_type, ram_code);
    for bank in 0..banks {
        rom[bank * ROM_BANK] = bank as u8;
    }
    rom
}

pub fn cart(rom: Vec<u8>) -> Cartridge {
    Cartridge::load(rom).expect("test ROM image must be valid")
}

/// A machine with the given cartridge mapped but no tasks running; the bus
/// can be driven directly through `read8`/`write8`.
pub fn gb_with_cart(rom: Vec<u8>) -> GameBoy {
    let mut gb = GameBoy::new();
    gb.load_cart(cart(rom));
    gb
}

/// A running machine whose CPU executes `program` from address 0x0000.
/// The program must stay clear of the header area.
pub fn gb_with_program(program: &[u8]) -> GameBoy {
    assert!(program.len() <= 0x100, "program overlaps the cart header");
    let mut rom = rom_image(2, 0x00, 0x00);
    rom[..program.len()].copy_from_slice(program);
    let mut gb = gb_with_cart(rom);
    gb.start().expect("cart is loaded");
    gb
}

/// A running machine whose CPU spins in place, for PPU/DMA-focused tests.
pub fn gb_idling() -> GameBoy {
    gb_with_program(&[0x18, 0xFE]) // jr -2
}

/// Patch `code` into a ROM image at `addr`.
pub fn patch(rom: &mut [u8], addr: usize, code: &[u8]) {
    rom[addr..addr + code.len()].copy_from_slice(code);
}
