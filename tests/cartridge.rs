mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{ROM_BANK, banked_rom_image, cart, gb_with_cart, rom_image};
use tandem_gb::cartridge::NINTENDO_LOGO;
use tandem_gb::gameboy::GameBoy;

#[test]
fn plain_rom_maps_both_banks() {
    let mut rom = banked_rom_image(2, 0x00, 0x00);
    rom[ROM_BANK + 0x123] = 0x99;
    let gb = gb_with_cart(rom);
    assert_eq!(gb.read8(0x0000), 0);
    assert_eq!(gb.read8(0x4123), 0x99);
    // Writes to a plain ROM are discarded.
    gb.write8(0x2000, 0x05);
    assert_eq!(gb.read8(0x4000), 1);
}

#[test]
fn mbc1_rom_bank_switching() {
    let gb = gb_with_cart(banked_rom_image(64, 0x01, 0x00));
    assert_eq!(gb.read8(0x4000), 1, "bank 1 after reset");

    gb.write8(0x2000, 0x02);
    assert_eq!(gb.read8(0x4000), 2);

    gb.write8(0x4000, 0x01); // outer bits: bank 0x22
    assert_eq!(gb.read8(0x4000), 0x22);

    // Bank 0 coerces to 1 in the low bits.
    gb.write8(0x2000, 0x05);
    gb.write8(0x2000, 0x00);
    assert_eq!(gb.read8(0x4000), 0x21);
}

#[test]
fn mbc1_mode_one_banks_the_low_window() {
    let gb = gb_with_cart(banked_rom_image(128, 0x01, 0x00)); // 2 MiB
    assert_eq!(gb.read8(0x0000), 0);
    gb.write8(0x6000, 0x01); // mode 1
    gb.write8(0x4000, 0x02); // outer = 2
    assert_eq!(gb.read8(0x0000), 0x40, "low window shows outer << 5");
    gb.write8(0x6000, 0x00); // back to mode 0
    assert_eq!(gb.read8(0x0000), 0);
}

#[test]
fn mbc1_ram_enable_gates_the_window() {
    let gb = gb_with_cart(rom_image(4, 0x03, 0x02)); // 8 KiB RAM
    gb.write8(0xA000, 0x55);
    assert_eq!(gb.read8(0xA000), 0xFF, "disabled RAM reads open bus");

    gb.write8(0x0000, 0x0A);
    gb.write8(0xA000, 0x55);
    assert_eq!(gb.read8(0xA000), 0x55);

    gb.write8(0x0000, 0x00);
    assert_eq!(gb.read8(0xA000), 0xFF);
    gb.write8(0xA000, 0x77); // discarded

    gb.write8(0x0000, 0x0A);
    assert_eq!(gb.read8(0xA000), 0x55, "contents survive a disable");
}

#[test]
fn mbc1_mode_one_banks_ram() {
    let gb = gb_with_cart(rom_image(4, 0x03, 0x03)); // 32 KiB RAM
    gb.write8(0x0000, 0x0A);
    gb.write8(0x6000, 0x01);
    gb.write8(0x4000, 0x00);
    gb.write8(0xA000, 0x11);
    gb.write8(0x4000, 0x02);
    gb.write8(0xA000, 0x33);
    gb.write8(0x4000, 0x00);
    assert_eq!(gb.read8(0xA000), 0x11);
    gb.write8(0x4000, 0x02);
    assert_eq!(gb.read8(0xA000), 0x33);
}

#[test]
fn mbc1_multicart_uses_four_inner_bits() {
    let mut rom = banked_rom_image(64, 0x01, 0x00); // 1 MiB
    for bank in [0x10, 0x20] {
        let base = bank * ROM_BANK + 0x0104;
        rom[base..base + 48].copy_from_slice(&NINTENDO_LOGO);
    }
    let gb = gb_with_cart(rom);
    gb.write8(0x4000, 0x01); // outer goes to bits 4-5
    assert_eq!(gb.read8(0x4000), 0x11);
    gb.write8(0x2000, 0x1F); // only four inner bits count
    assert_eq!(gb.read8(0x4000), 0x1F & 0x0F | 0x10);
}

#[test]
fn mbc2_decodes_registers_by_address_bit_8() {
    let gb = gb_with_cart(banked_rom_image(8, 0x06, 0x00));
    // Bit 8 set: ROM bank select.
    gb.write8(0x2100, 0x03);
    assert_eq!(gb.read8(0x4000), 3);
    gb.write8(0x2100, 0x00); // bank 0 -> 1
    assert_eq!(gb.read8(0x4000), 1);
    // Bit 8 clear anywhere in 0x0000-0x3FFF: RAM gate.
    gb.write8(0x3E00, 0x0A);
    gb.write8(0xA000, 0xAB);
    assert_eq!(gb.read8(0xA000), 0xFB, "only the low nibble is stored");
    gb.write8(0x3E00, 0x00);
    assert_eq!(gb.read8(0xA000), 0xFF);
}

#[test]
fn mbc3_bank_select_and_rtc_policy() {
    let gb = gb_with_cart(banked_rom_image(128, 0x13, 0x03));
    gb.write8(0x2000, 0x2A);
    assert_eq!(gb.read8(0x4000), 0x2A);
    gb.write8(0x2000, 0x00);
    assert_eq!(gb.read8(0x4000), 1, "bank 0 coerces to 1");

    gb.write8(0x0000, 0x0A);
    gb.write8(0x4000, 0x01);
    gb.write8(0xA000, 0x44);
    gb.write8(0x4000, 0x02);
    gb.write8(0xA000, 0x55);
    gb.write8(0x4000, 0x01);
    assert_eq!(gb.read8(0xA000), 0x44);

    // RTC register selects are tolerated but unbacked.
    gb.write8(0x4000, 0x08);
    assert_eq!(gb.read8(0xA000), 0xFF);
    gb.write8(0xA000, 0x12); // discarded
    gb.write8(0x4000, 0x02);
    assert_eq!(gb.read8(0xA000), 0x55);
}

#[test]
fn mbc5_bank_zero_is_real() {
    let gb = gb_with_cart(banked_rom_image(8, 0x19, 0x00));
    gb.write8(0x2000, 0x03);
    assert_eq!(gb.read8(0x4000), 3);
    gb.write8(0x2000, 0x00);
    assert_eq!(gb.read8(0x4000), 0, "bank 0 is selectable on MBC5");
}

#[test]
fn mbc5_high_bit_reaches_the_upper_half() {
    let mut rom = banked_rom_image(512, 0x19, 0x00);
    rom[0x134 * ROM_BANK + 1] = 0xEE;
    let gb = gb_with_cart(rom);
    gb.write8(0x2000, 0x34);
    gb.write8(0x3000, 0x01);
    assert_eq!(gb.read8(0x4001), 0xEE);
    gb.write8(0x3000, 0x00);
    assert_eq!(gb.read8(0x4001), 0x00);
}

#[test]
fn mbc5_ram_banks() {
    let gb = gb_with_cart(rom_image(4, 0x1B, 0x03));
    gb.write8(0x0000, 0x0A);
    gb.write8(0x4000, 0x00);
    gb.write8(0xA000, 0xA0);
    gb.write8(0x4000, 0x03);
    gb.write8(0xA000, 0xA3);
    gb.write8(0x4000, 0x00);
    assert_eq!(gb.read8(0xA000), 0xA0);
    gb.write8(0x4000, 0x03);
    assert_eq!(gb.read8(0xA000), 0xA3);
}

#[test]
fn mbc3_multicart_maps_game_pairs() {
    let mut rom = banked_rom_image(16, 0x11, 0x00); // 256 KiB
    for bank in [2, 4] {
        let base = bank * ROM_BANK + 0x0104;
        rom[base..base + 48].copy_from_slice(&NINTENDO_LOGO);
    }
    let gb = gb_with_cart(rom);
    gb.write8(0x4000, 0x01);
    assert_eq!(gb.read8(0x0000), 2, "low window shows the game's bank 0");
    assert_eq!(gb.read8(0x4000), 3, "high window shows the next bank");
    gb.write8(0x4000, 0x02);
    assert_eq!(gb.read8(0x0000), 4);
    assert_eq!(gb.read8(0x4000), 5);
}

fn mmm01_image() -> Vec<u8> {
    // 512 KiB menu image: primary header claims 32 KiB, the menu header in
    // the top 32 KiB agrees with the real size.
    let mut rom = banked_rom_image(32, 0x00, 0x00);
    rom[0x0148] = 0x00;
    let tail = rom.len() - 0x8000;
    rom[tail + 0x0104..tail + 0x0134].copy_from_slice(&NINTENDO_LOGO);
    rom[tail + 0x0147] = 0x0D;
    rom[tail + 0x0148] = 0x04; // 512 KiB
    rom[tail + 0x0149] = 0x02; // 8 KiB RAM
    rom
}

#[test]
fn mmm01_boots_from_the_menu_banks() {
    let gb = gb_with_cart(mmm01_image());
    assert_eq!(gb.read8(0x0000), 30, "menu bank: 0x1FE mod 32");
    assert_eq!(gb.read8(0x4000), 31);
}

#[test]
fn mmm01_latch_maps_the_selected_game() {
    let gb = gb_with_cart(mmm01_image());
    // Menu selects the game at banks 8-15: mid = 0, high = 0; put the base
    // in rom_bank_mid via the 0x2000 register (bits 5-6).
    gb.write8(0x2000, 0x02 | (0x01 << 5)); // low = 2, mid = 1 -> base bank 32? mod 32 applies
    gb.write8(0x4000, 0x00);
    gb.write8(0x0000, 0x40); // latch
    // base = mid << 5 = 32, low = 2 -> bank 34 % 32 = 2.
    assert_eq!(gb.read8(0x4000), 2);
    assert_eq!(gb.read8(0x0000), 0, "low window shows the game's base");
    // After latching, the mid bits are locked.
    gb.write8(0x2000, 0x03);
    assert_eq!(gb.read8(0x4000), 3);
}

#[test]
fn battery_ram_flushes_to_the_sink_on_unload() {
    let saved: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut c = cart(rom_image(4, 0x03, 0x02));
    {
        let saved = Rc::clone(&saved);
        c.set_save_sink(move |ram| {
            *saved.borrow_mut() = ram.to_vec();
        });
    }
    c.load_battery_ram(&vec![0x11; 0x2000]).unwrap();

    let mut gb = GameBoy::new();
    gb.load_cart(c);
    gb.write8(0x0000, 0x0A);
    assert_eq!(gb.read8(0xA000), 0x11, "loaded save image is visible");
    gb.write8(0xA000, 0x99);

    let cart_back = gb.unload_cart().expect("cart comes back out");
    assert_eq!(saved.borrow().len(), 0x2000);
    assert_eq!(saved.borrow()[0], 0x99);
    assert_eq!(cart_back.dump_battery_ram()[0], 0x99);
}

#[test]
fn sub_8k_ram_maps_a_short_window() {
    let gb = gb_with_cart(rom_image(4, 0x03, 0x01)); // 2 KiB RAM
    gb.write8(0x0000, 0x0A);
    gb.write8(0xA000, 0x42);
    assert_eq!(gb.read8(0xA000), 0x42);
    assert_eq!(gb.read8(0xA800), 0xFF, "beyond the 2 KiB window");
}
