use thiserror::Error;

/// Errors surfaced by the emulation core.
///
/// Configuration errors are returned by the loading APIs before the machine
/// starts. Runtime-fatal errors come out of [`crate::gameboy::GameBoy::tick`]
/// when an execution unit hits something the core cannot continue past (real
/// hardware would lock up or the feature is unsupported).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    // Configuration errors.
    #[error("bad ROM image: {0} bytes (expected 16 KiB..=8 MiB, multiple of 16 KiB)")]
    BadRomSize(usize),
    #[error("unsupported cartridge type {0:#04X}")]
    UnsupportedCartType(u8),
    #[error("invalid RAM size code {0:#04X} in cartridge header")]
    InvalidRamSizeCode(u8),
    #[error("save RAM image too small: {got} bytes for a {want}-byte cart")]
    SaveRamTooSmall { got: usize, want: usize },
    #[error("boot ROM must be 256 bytes, got {0}")]
    BadBootRomSize(usize),
    #[error("no cartridge loaded")]
    NoCartLoaded,
    #[error("MBC1 cartridge with both banked ROM and banked RAM is not supported")]
    UnsupportedMbc1Layout,

    // Runtime-fatal errors.
    #[error("unknown opcode {opcode:#04X} at {pc:#06X}")]
    UnknownOpcode { opcode: u8, pc: u16 },
    #[error("STOP instruction is not supported (pc {0:#06X})")]
    StopUnsupported(u16),
}
