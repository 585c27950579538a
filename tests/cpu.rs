mod common;

use common::gb_with_program;
use tandem_gb::error::Error;
use tandem_gb::gameboy::GameBoy;

fn run(program: &[u8]) -> GameBoy {
    let mut gb = gb_with_program(program);
    gb.tick(20_000).unwrap();
    gb
}

/// Program builder: code fragments at fixed offsets (interrupt handlers need
/// to sit on their vectors).
fn program(fragments: &[(usize, &[u8])]) -> Vec<u8> {
    let mut out = vec![0u8; 0x100];
    for (addr, code) in fragments {
        out[*addr..*addr + code.len()].copy_from_slice(code);
    }
    out
}

#[test]
fn loads_and_stores_reach_wram() {
    let gb = run(&[
        0x3E, 0x42, // ld a,0x42
        0xEA, 0x00, 0xC0, // ld (0xC000),a
        0x18, 0xFE, // jr @
    ]);
    assert_eq!(gb.read8(0xC000), 0x42);
}

#[test]
fn daa_after_bcd_addition() {
    let gb = run(&[
        0x3E, 0x45, // ld a,0x45
        0xC6, 0x38, // add a,0x38
        0x27, // daa
        0xEA, 0x00, 0xC0, // ld (0xC000),a
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 0x83);
}

#[test]
fn add_hl_hl_at_the_boundary() {
    let gb = run(&[
        0x31, 0x00, 0xD0, // ld sp,0xD000
        0x21, 0xFF, 0xFF, // ld hl,0xFFFF
        0x29, // add hl,hl
        0xF5, // push af
        0x7C, // ld a,h
        0xEA, 0x00, 0xC0,
        0x7D, // ld a,l
        0xEA, 0x01, 0xC0,
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 0xFF);
    assert_eq!(gb.read8(0xC001), 0xFE);
    // F landed at SP-2: carry and half-carry, Z preserved (clear).
    assert_eq!(gb.read8(0xCFFE), 0x30);
}

#[test]
fn ld_hl_sp_plus_offset_flags() {
    let gb = run(&[
        0x31, 0x0F, 0x00, // ld sp,0x000F
        0xF8, 0x01, // ld hl,sp+1
        0x31, 0x00, 0xD0, // ld sp,0xD000
        0xF5, // push af
        0x7C, 0xEA, 0x00, 0xC0, // ld a,h / ld (0xC000),a
        0x7D, 0xEA, 0x01, 0xC0, // ld a,l / ld (0xC001),a
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 0x00);
    assert_eq!(gb.read8(0xC001), 0x10);
    assert_eq!(gb.read8(0xCFFE), 0x20); // only half-carry
}

#[test]
fn call_and_ret_round_trip() {
    let code = program(&[
        (
            0x00,
            &[
                0x31, 0x00, 0xD0, // ld sp,0xD000
                0xCD, 0x20, 0x00, // call 0x0020
                0x3E, 0xBB, // ld a,0xBB
                0xEA, 0x01, 0xC0, // ld (0xC001),a
                0x18, 0xFE,
            ][..],
        ),
        (
            0x20,
            &[
                0x3E, 0xAA, // ld a,0xAA
                0xEA, 0x00, 0xC0, // ld (0xC000),a
                0xC9, // ret
            ][..],
        ),
    ]);
    let gb = run(&code);
    assert_eq!(gb.read8(0xC000), 0xAA);
    assert_eq!(gb.read8(0xC001), 0xBB);
}

#[test]
fn halt_bug_runs_the_next_opcode_twice() {
    let gb = run(&[
        0x3E, 0x01, // ld a,1
        0xE0, 0xFF, // ldh (0xFF),a  IE = vblank
        0xE0, 0x0F, // ldh (0x0F),a  IF = vblank
        0x3E, 0x00, // ld a,0
        0x76, // halt with IME=0 and a pending interrupt
        0x3C, // inc a            <- fetched twice
        0xEA, 0x00, 0xC0, // ld (0xC000),a
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 2);
}

#[test]
fn interrupt_service_clears_the_flag_and_vectors() {
    let code = program(&[
        (
            0x00,
            &[
                0x31, 0x00, 0xD0, // ld sp,0xD000
                0x3E, 0x01, // ld a,1
                0xE0, 0xFF, // ldh (0xFF),a  IE = vblank
                0xFB, // ei
                0xE0, 0x0F, // ldh (0x0F),a  IF = vblank
                0x00, 0x00, // nop nop (interrupt taken here)
                0x3E, 0xCC, // ld a,0xCC
                0xEA, 0x01, 0xC0, // ld (0xC001),a   resumed after RETI
                0x18, 0xFE,
            ][..],
        ),
        (
            0x40,
            &[
                0xF0, 0x0F, // ldh a,(0x0F)   IF with vblank acked
                0xEA, 0x00, 0xC0, // ld (0xC000),a
                0xD9, // reti
            ][..],
        ),
    ]);
    let gb = run(&code);
    assert_eq!(gb.read8(0xC000), 0xE0, "vblank bit acked, upper bits high");
    assert_eq!(gb.read8(0xC001), 0xCC, "execution resumed after RETI");
}

#[test]
fn ei_takes_effect_one_instruction_late() {
    let code = program(&[
        (
            0x00,
            &[
                0x31, 0x00, 0xD0, // ld sp,0xD000
                0x3E, 0x01, // ld a,1
                0xE0, 0x0F, // ldh (0x0F),a  IF = vblank
                0xE0, 0xFF, // ldh (0xFF),a  IE = vblank (pending, IME off)
                0xFB, // ei
                0xEA, 0x00, 0xC0, // ld (0xC000),a  must run before service
                0x18, 0xFE,
            ][..],
        ),
        (
            0x40,
            &[
                0xFA, 0x00, 0xC0, // ld a,(0xC000)
                0xEA, 0x01, 0xC0, // ld (0xC001),a
                0xD9, // reti
            ][..],
        ),
    ]);
    let gb = run(&code);
    assert_eq!(
        gb.read8(0xC001),
        0x01,
        "the instruction after EI completed before the handler ran"
    );
}

#[test]
fn timer_interrupt_wakes_halt() {
    let code = program(&[
        (
            0x00,
            &[
                0x31, 0x00, 0xD0, // ld sp,0xD000
                0x3E, 0x04, // ld a,4
                0xE0, 0xFF, // ldh (0xFF),a  IE = timer
                0x3E, 0xFD, // ld a,0xFD
                0xE0, 0x05, // ldh (0x05),a  TIMA
                0x3E, 0x05, // ld a,5
                0xE0, 0x07, // ldh (0x07),a  TAC: on, 16-cycle rate
                0xFB, // ei
                0x76, // halt
                0x3E, 0xAA, // ld a,0xAA
                0xEA, 0x00, 0xC0, // ld (0xC000),a
                0x18, 0xFE,
            ][..],
        ),
        (
            0x50,
            &[
                0x3E, 0xBB, // ld a,0xBB
                0xEA, 0x01, 0xC0, // ld (0xC001),a
                0xD9, // reti
            ][..],
        ),
    ]);
    let gb = run(&code);
    assert_eq!(gb.read8(0xC001), 0xBB, "timer vector ran");
    assert_eq!(gb.read8(0xC000), 0xAA, "halt resumed afterwards");
}

#[test]
fn halt_with_no_interrupts_waits_for_a_button() {
    use tandem_gb::input::{Button, ButtonState};

    // IF and IE are both clear: nothing but the wake signal can end this.
    let mut gb = gb_with_program(&[
        0x76, // halt
        0x3E, 0x55, // ld a,0x55
        0xEA, 0x00, 0xC0, // ld (0xC000),a
        0x18, 0xFE,
    ]);
    gb.tick(50_000).unwrap();
    assert_eq!(gb.read8(0xC000), 0x00, "still halted");

    gb.input(Button::A, ButtonState::Down);
    gb.tick(1_000).unwrap();
    assert_eq!(gb.read8(0xC000), 0x55, "button press woke the CPU");
}

#[test]
fn unknown_opcode_is_fatal() {
    let mut gb = gb_with_program(&[0xDD]);
    assert_eq!(
        gb.tick(100),
        Err(Error::UnknownOpcode {
            opcode: 0xDD,
            pc: 0x0000
        })
    );
    // The machine keeps ticking; the failure is reported once.
    assert_eq!(gb.tick(100), Ok(()));
}

#[test]
fn stop_is_fatal() {
    let mut gb = gb_with_program(&[0x10, 0x00]);
    assert_eq!(gb.tick(100), Err(Error::StopUnsupported(0x0000)));
}

#[test]
fn conditional_jumps_take_the_right_path() {
    let gb = run(&[
        0xAF, // xor a          -> Z set
        0x28, 0x03, // jr z,+3
        0x3E, 0x01, // ld a,1   (skipped)
        0x00, // nop
        0x3C, // inc a          -> a=1, Z clear
        0x20, 0x02, // jr nz,+2
        0x3E, 0x77, // ld a,0x77 (skipped)
        0xEA, 0x00, 0xC0, // ld (0xC000),a
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 1);
}

#[test]
fn sixteen_bit_inc_dec_wrap() {
    let gb = run(&[
        0x21, 0xFF, 0xFF, // ld hl,0xFFFF
        0x23, // inc hl -> 0
        0x7C, 0xEA, 0x00, 0xC0, // ld a,h / store
        0x7D, 0xEA, 0x01, 0xC0, // ld a,l / store
        0x2B, // dec hl -> 0xFFFF
        0x7C, 0xEA, 0x02, 0xC0,
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 0x00);
    assert_eq!(gb.read8(0xC001), 0x00);
    assert_eq!(gb.read8(0xC002), 0xFF);
}

#[test]
fn cb_bit_ops_on_memory() {
    let gb = run(&[
        0x21, 0x00, 0xC0, // ld hl,0xC000
        0x36, 0x81, // ld (hl),0x81
        0xCB, 0xFE, // set 7,(hl)  (already set)
        0xCB, 0x86, // res 0,(hl)
        0xCB, 0x3E, // srl (hl)    -> 0x40
        0x18, 0xFE,
    ]);
    assert_eq!(gb.read8(0xC000), 0x40);
}
