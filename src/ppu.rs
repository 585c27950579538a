use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::error::Error;
use crate::interrupt::Signal;
use crate::mmu::{IF_STAT, IF_VBLANK, INT_MASK, Mapping, Mmu, ReadTarget, WriteTarget};
use crate::scheduler::{PRIORITY_READ, PRIORITY_WRITE, Scheduler, Unit};

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

const VRAM_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;

const LINE_CYCLES: u32 = 456;
const OAM_SEARCH_CYCLES: u32 = 80;
const BG_FETCH_CYCLES: u32 = 5;
const SPRITE_FETCH_CYCLES: u32 = 6;
const WINDOW_SWITCH_CYCLES: u32 = 6;
/// The first visible line after the LCD turns on runs this much short.
const LCD_ON_SKIP_CYCLES: u32 = 8;

// LCDC bits.
const LCDC_BG_ENABLE: u8 = 0x01;
const LCDC_OBJ_ENABLE: u8 = 0x02;
const LCDC_OBJ_SIZE: u8 = 0x04;
const LCDC_BG_TILEMAP: u8 = 0x08;
const LCDC_TILEDATA: u8 = 0x10;
const LCDC_WINDOW_ENABLE: u8 = 0x20;
const LCDC_WINDOW_TILEMAP: u8 = 0x40;
const LCDC_LCD_ENABLE: u8 = 0x80;

// STAT interrupt-enable bits (the writable ones).
const STAT_IE_HBLANK: u8 = 0x08;
const STAT_IE_VBLANK: u8 = 0x10;
const STAT_IE_OAM: u8 = 0x20;
const STAT_IE_COINCIDENCE: u8 = 0x40;
const STAT_IE_ALL: u8 = 0x78;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    HBlank,
    VBlank,
    OamSearch,
    Transfer,
    /// First line after LCD enable; reports mode 0 in STAT.
    InitialPowerOn,
    /// LCD disabled; reports mode 0 in STAT.
    PowerOff,
}

impl Mode {
    fn stat_bits(self) -> u8 {
        match self {
            Mode::HBlank | Mode::InitialPowerOn | Mode::PowerOff => 0,
            Mode::VBlank => 1,
            Mode::OamSearch => 2,
            Mode::Transfer => 3,
        }
    }
}

#[derive(Clone, Copy)]
struct Sprite {
    y: u8,
    x: u8,
    tile: u8,
    flags: u8,
}

impl Sprite {
    fn palette(self) -> bool {
        self.flags & 0x10 != 0
    }

    fn flip_x(self) -> bool {
        self.flags & 0x20 != 0
    }

    fn flip_y(self) -> bool {
        self.flags & 0x40 != 0
    }

    fn behind_bg(self) -> bool {
        self.flags & 0x80 != 0
    }
}

/// Eight-pixel FIFO held as bit planes: shifting every plane right by one
/// pops one pixel. The overlay masks keep the first (leftmost-X) sprite on
/// top of later ones.
#[derive(Default)]
struct PixelFifo {
    bg_count: u8,
    bg_lo: u8,
    bg_hi: u8,
    obj_lo: u8,
    obj_hi: u8,
    obj_palette: u8,
    obj_priority: u8,
}

impl PixelFifo {
    /// Load eight background pixels. Planes are stored LSB-first so pop can
    /// shift right.
    fn load_bg(&mut self, lo: u8, hi: u8) {
        self.bg_count = 8;
        self.bg_lo = lo.reverse_bits();
        self.bg_hi = hi.reverse_bits();
    }

    fn overlay_sprite(&mut self, mut lo: u8, mut hi: u8, sprite: Sprite) {
        if !sprite.flip_x() {
            lo = lo.reverse_bits();
            hi = hi.reverse_bits();
        }
        // Only non-transparent pixels not already claimed by an earlier
        // sprite land in the object layer.
        let taken = self.obj_lo | self.obj_hi;
        let mask = (lo | hi) & !taken;
        self.obj_lo = (self.obj_lo & !mask) | (lo & mask);
        self.obj_hi = (self.obj_hi & !mask) | (hi & mask);
        let palette = if sprite.palette() { 0xFF } else { 0x00 };
        self.obj_palette = (self.obj_palette & !mask) | (palette & mask);
        let in_front = if sprite.behind_bg() { 0x00 } else { 0xFF };
        self.obj_priority = (self.obj_priority & !mask) | (in_front & mask);
    }

    /// Pop one pixel, already resolved through BGP/OBP0/OBP1: bits 0-1 carry
    /// the shade, bits 2-3 the palette bank (0 = BG, 1/2 = OBP0/1).
    fn pop(&mut self, bgp: u8, obp0: u8, obp1: u8) -> u8 {
        debug_assert!(self.bg_count > 0);
        self.bg_count -= 1;

        let bg_colour = ((self.bg_hi & 1) << 1) | (self.bg_lo & 1);
        let obj_colour = ((self.obj_hi & 1) << 1) | (self.obj_lo & 1);
        let palette = self.obj_palette & 1;
        let in_front = self.obj_priority & 1 != 0;

        self.bg_lo >>= 1;
        self.bg_hi >>= 1;
        self.obj_lo >>= 1;
        self.obj_hi >>= 1;
        self.obj_palette >>= 1;
        self.obj_priority >>= 1;

        if obj_colour != 0 && (in_front || bg_colour == 0) {
            let pal = if palette != 0 { obp1 } else { obp0 };
            ((palette + 1) << 2) | ((pal >> (obj_colour * 2)) & 0x03)
        } else {
            (bgp >> (bg_colour * 2)) & 0x03
        }
    }

    fn discard(&mut self, count: u8) {
        debug_assert!(count <= self.bg_count);
        self.bg_count -= count;
        self.bg_lo = ((self.bg_lo as u16) >> count) as u8;
        self.bg_hi = ((self.bg_hi as u16) >> count) as u8;
        self.obj_lo = ((self.obj_lo as u16) >> count) as u8;
        self.obj_hi = ((self.obj_hi as u16) >> count) as u8;
        self.obj_palette = ((self.obj_palette as u16) >> count) as u8;
        self.obj_priority = ((self.obj_priority as u16) >> count) as u8;
    }
}

/// PPU register file and interrupt-line state, shared between the render
/// task and the register window on the mapper.
pub struct PpuState {
    pub lcdc: u8,
    stat_ie: u8,
    mode: Mode,
    /// Mode as seen by bus arbitration; set at phase start, ahead of the
    /// 4-cycle STAT latch.
    bus_phase: Mode,
    coincidence: bool,
    pub scy: u8,
    pub scx: u8,
    pub ly: u8,
    pub lyc: u8,
    pub dma: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub wy: u8,
    pub wx: u8,
    stat_line: bool,
    vblank_line: bool,
    lockout: bool,
    dma_oam_block: bool,
    pub screen: [u8; SCREEN_WIDTH * SCREEN_HEIGHT],
    display_callback: Option<Box<dyn FnMut()>>,
}

impl PpuState {
    fn new() -> Self {
        Self {
            lcdc: 0,
            stat_ie: 0,
            mode: Mode::PowerOff,
            bus_phase: Mode::PowerOff,
            coincidence: false,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            dma: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            stat_line: false,
            vblank_line: false,
            lockout: false,
            dma_oam_block: false,
            screen: [0; SCREEN_WIDTH * SCREEN_HEIGHT],
            display_callback: None,
        }
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & LCDC_LCD_ENABLE != 0
    }

    fn sprite_height(&self) -> u8 {
        if self.lcdc & LCDC_OBJ_SIZE != 0 { 16 } else { 8 }
    }

    fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                0x80 | self.stat_ie
                    | ((self.coincidence as u8) << 2)
                    | self.mode.stat_bits()
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            _ => 0xFF,
        }
    }

    /// Recompute the level-sensitive STAT line (OR of the four sources) and
    /// the V-blank line for `mode`; only rising edges reach IF.
    fn refresh_interrupt_line(&mut self, mmu: &mut Mmu, mode: Mode) {
        let old_stat = self.stat_line;
        self.stat_line = (mode == Mode::HBlank && self.stat_ie & STAT_IE_HBLANK != 0)
            || (mode == Mode::VBlank && self.stat_ie & (STAT_IE_VBLANK | STAT_IE_OAM) != 0)
            || (mode == Mode::OamSearch && self.stat_ie & STAT_IE_OAM != 0)
            || (self.coincidence && self.stat_ie & STAT_IE_COINCIDENCE != 0);

        let old_vblank = self.vblank_line;
        self.vblank_line = mode == Mode::VBlank;

        let fire_stat = !old_stat && self.stat_line;
        let fire_vblank = mmu.if_reg & IF_VBLANK == 0 && !old_vblank && self.vblank_line;
        if fire_stat {
            mmu.if_reg |= IF_STAT;
        }
        if fire_vblank {
            mmu.if_reg |= IF_VBLANK;
        }
        if (fire_stat || fire_vblank) && mmu.if_reg & mmu.ie_reg & INT_MASK != 0 {
            mmu.interrupts.cpu_wake.trigger();
        }
    }

    fn oam_blocked(&self) -> bool {
        self.dma_oam_block
            || (self.lockout && matches!(self.bus_phase, Mode::OamSearch | Mode::Transfer))
    }

    fn vram_blocked(&self) -> bool {
        self.lockout && self.bus_phase == Mode::Transfer
    }
}

fn sync_oam_mapping(mmu: &mut Mmu, st: &PpuState, oam: &Rc<RefCell<Vec<u8>>>) {
    if st.oam_blocked() {
        mmu.set_mapping(Mapping::open(0xFE00, 0xFE9F));
    } else {
        mmu.set_mapping(Mapping::ram(0xFE00, 0xFE9F, oam, 0));
    }
}

fn sync_vram_mapping(mmu: &mut Mmu, st: &PpuState, vram: &Rc<RefCell<Vec<u8>>>) {
    if st.vram_blocked() {
        mmu.set_mapping(Mapping::open(0x8000, 0x9FFF));
    } else {
        mmu.set_mapping(Mapping::ram(0x8000, 0x9FFF, vram, 0));
    }
}

fn write_reg(
    mmu: &mut Mmu,
    state: &Rc<RefCell<PpuState>>,
    lcd_enable: &Signal,
    dma_trigger: &Signal,
    addr: u16,
    val: u8,
) {
    let mut st = state.borrow_mut();
    match addr {
        0xFF40 => {
            let was_on = st.lcd_enabled();
            st.lcdc = val;
            let is_on = st.lcd_enabled();
            if was_on != is_on {
                drop(st);
                lcd_enable.trigger();
            }
        }
        0xFF41 => {
            // STAT write bug: every enable bit reads as set for a moment
            // before the written value latches. Both states go through the
            // rising-edge check.
            let mode = st.mode;
            st.stat_ie = STAT_IE_ALL;
            st.refresh_interrupt_line(mmu, mode);
            st.stat_ie = val & STAT_IE_ALL;
            st.refresh_interrupt_line(mmu, mode);
        }
        0xFF42 => st.scy = val,
        0xFF43 => st.scx = val,
        0xFF44 => {} // LY is read-only
        0xFF45 => st.lyc = val,
        0xFF46 => {
            st.dma = val;
            drop(st);
            dma_trigger.trigger();
        }
        0xFF47 => st.bgp = val,
        0xFF48 => st.obp0 = val,
        0xFF49 => st.obp1 = val,
        0xFF4A => st.wy = val,
        0xFF4B => st.wx = val,
        _ => {}
    }
}

/// Host-side handle to the PPU: owns the shared register/VRAM/OAM state and
/// spawns the render and DMA tasks.
pub struct Ppu {
    sched: Scheduler,
    mmu: Rc<RefCell<Mmu>>,
    state: Rc<RefCell<PpuState>>,
    vram: Rc<RefCell<Vec<u8>>>,
    oam: Rc<RefCell<Vec<u8>>>,
    lcd_enable: Signal,
    dma_trigger: Signal,
}

impl Ppu {
    pub fn new(sched: &Scheduler, mmu: &Rc<RefCell<Mmu>>) -> Self {
        let state = Rc::new(RefCell::new(PpuState::new()));
        let vram = Rc::new(RefCell::new(vec![0u8; VRAM_SIZE]));
        let oam = Rc::new(RefCell::new(vec![0u8; OAM_SIZE]));
        let lcd_enable = Signal::new(sched);
        let dma_trigger = Signal::new(sched);

        {
            let mut mmu = mmu.borrow_mut();
            mmu.set_mapping(Mapping::ram(0x8000, 0x9FFF, &vram, 0));
            mmu.set_mapping(Mapping::ram(0xFE00, 0xFE9F, &oam, 0));

            let read = {
                let state = Rc::clone(&state);
                Rc::new(move |_mmu: &mut Mmu, addr: u16| state.borrow().read_reg(addr))
                    as Rc<dyn Fn(&mut Mmu, u16) -> u8>
            };
            let write = {
                let state = Rc::clone(&state);
                let lcd_enable = lcd_enable.clone();
                let dma_trigger = dma_trigger.clone();
                Rc::new(move |mmu: &mut Mmu, addr: u16, val: u8| {
                    write_reg(mmu, &state, &lcd_enable, &dma_trigger, addr, val);
                }) as Rc<dyn Fn(&mut Mmu, u16, u8)>
            };
            mmu.set_mapping(Mapping {
                start: 0xFF40,
                end: 0xFF4B,
                read: ReadTarget::Handler(read),
                write: WriteTarget::Handler(write),
            });
        }

        Self {
            sched: sched.clone(),
            mmu: Rc::clone(mmu),
            state,
            vram,
            oam,
            lcd_enable,
            dma_trigger,
        }
    }

    /// Spawn the render and OAM-DMA tasks.
    pub fn start(&self) {
        let render = RenderTask {
            sched: self.sched.clone(),
            mmu: Rc::clone(&self.mmu),
            state: Rc::clone(&self.state),
            vram: Rc::clone(&self.vram),
            oam: Rc::clone(&self.oam),
            lcd_enable: self.lcd_enable.clone(),
            window_line: 0,
            window_triggered: false,
        };
        self.sched.spawn(Unit::Ppu, render.run());

        let dma = DmaTask {
            sched: self.sched.clone(),
            mmu: Rc::clone(&self.mmu),
            state: Rc::clone(&self.state),
            oam: Rc::clone(&self.oam),
            dma_trigger: self.dma_trigger.clone(),
        };
        self.sched.spawn(Unit::Dma, dma.run());
    }

    pub fn is_screen_enabled(&self) -> bool {
        self.state.borrow().lcd_enabled()
    }

    /// The rendered frame as palette-resolved pixels (see
    /// [`PixelFifo::pop`]'s encoding).
    pub fn screen_buffer(&self) -> Ref<'_, [u8]> {
        Ref::map(self.state.borrow(), |st| &st.screen[..])
    }

    pub fn set_display_callback(&self, callback: impl FnMut() + 'static) {
        self.state.borrow_mut().display_callback = Some(Box::new(callback));
    }

    /// Enforce OAM/VRAM bus lockout during modes 2/3. Off by default: some
    /// games depend on the relaxed behavior.
    pub fn set_access_lockout(&self, enabled: bool) {
        self.state.borrow_mut().lockout = enabled;
    }
}

/// Cursor state for one scanline's pixel transfer.
struct Scanline {
    sprites: Vec<Sprite>,
    sprite_height: u8,
    fifo: PixelFifo,
    bg_enable: bool,
    window_enable: bool,
    wx: u8,
    bg_map: u16,
    window_map: u16,
    /// Tile-data base for indices below 0x80; 0x80.. always read from 0x0000.
    tiledata_low: u16,
    tile_x: u8,
    tile_y: u8,
    sub_tile_y: u16,
    in_window: bool,
    /// Window trigger cursor; starts one step before pixel 0.
    window_x: u8,
    sprite_x: u8,
    next_sprite: usize,
    fetch_start: u32,
}

impl Scanline {
    fn new(st: &PpuState, y: u8, sprites: Vec<Sprite>, window_triggered: bool) -> Self {
        Self {
            sprites,
            sprite_height: st.sprite_height(),
            fifo: PixelFifo::default(),
            bg_enable: st.lcdc & LCDC_BG_ENABLE != 0,
            window_enable: st.lcdc & LCDC_WINDOW_ENABLE != 0 && window_triggered && st.wx < 167,
            wx: st.wx,
            bg_map: if st.lcdc & LCDC_BG_TILEMAP != 0 { 0x1C00 } else { 0x1800 },
            window_map: if st.lcdc & LCDC_WINDOW_TILEMAP != 0 { 0x1C00 } else { 0x1800 },
            tiledata_low: if st.lcdc & LCDC_TILEDATA != 0 { 0x0000 } else { 0x1000 },
            tile_x: st.scx / 8,
            tile_y: (y.wrapping_add(st.scy) / 8) % 32,
            sub_tile_y: (y.wrapping_add(st.scy) % 8) as u16,
            in_window: false,
            window_x: 0xFF,
            sprite_x: 0,
            next_sprite: 0,
            fetch_start: 0,
        }
    }

    /// Fetch the tile row under the cursor into the FIFO.
    fn load_bg_row(&mut self, vram: &[u8]) {
        let map = if self.in_window { self.window_map } else { self.bg_map };
        let index = vram[(map + self.tile_y as u16 * 32 + self.tile_x as u16) as usize];
        let base = if index < 0x80 { self.tiledata_low } else { 0x0000 };
        let addr = (base + index as u16 * 16 + self.sub_tile_y * 2) as usize;
        self.fifo.load_bg(vram[addr], vram[addr + 1]);
    }

    /// Fetch the pending sprite's row and overlay it onto the FIFO.
    fn fetch_sprite(&mut self, vram: &[u8], y: u8) {
        let sprite = self.sprites[self.next_sprite];
        self.next_sprite += 1;
        let line = y.wrapping_sub(sprite.y.wrapping_sub(16));
        let row = if sprite.flip_y() {
            self.sprite_height - 1 - line
        } else {
            line
        };
        let addr = (sprite.tile as u16 * 16 + row as u16 * 2) as usize;
        self.fifo.overlay_sprite(vram[addr], vram[addr + 1], sprite);
    }
}

struct Restart;

struct RenderTask {
    sched: Scheduler,
    mmu: Rc<RefCell<Mmu>>,
    state: Rc<RefCell<PpuState>>,
    vram: Rc<RefCell<Vec<u8>>>,
    oam: Rc<RefCell<Vec<u8>>>,
    lcd_enable: Signal,
    window_line: u8,
    window_triggered: bool,
}

impl RenderTask {
    async fn run(mut self) -> Result<(), Error> {
        loop {
            let lcd_on_bug = if !self.state.borrow().lcd_enabled() {
                self.power_down();
                self.lcd_enable.reset();
                self.lcd_enable.wait(Unit::Ppu).await;
                true
            } else {
                false
            };
            // An LCD disable mid-frame interrupts whatever wait is pending
            // and restarts from the top.
            let _ = self.frame(lcd_on_bug).await;
        }
    }

    fn power_down(&self) {
        let mut mmu = self.mmu.borrow_mut();
        let mut st = self.state.borrow_mut();
        st.stat_line = false;
        st.vblank_line = false;
        st.ly = 0;
        st.coincidence = false;
        st.mode = Mode::PowerOff;
        st.bus_phase = Mode::PowerOff;
        sync_vram_mapping(&mut mmu, &st, &self.vram);
        sync_oam_mapping(&mut mmu, &st, &self.oam);
    }

    async fn wait_i(&self, priority: u8, cycles: u32) -> Result<(), Restart> {
        if self
            .sched
            .interruptible_cycles(&self.lcd_enable, Unit::Ppu, priority, cycles)
            .await
        {
            Err(Restart)
        } else {
            Ok(())
        }
    }

    /// Enter a new phase: LY and bus arbitration change immediately, the
    /// STAT mode bits and the coincidence flag latch four cycles later.
    fn update_stat(&self, mode: Mode, y: u8) {
        {
            let mut mmu = self.mmu.borrow_mut();
            let mut st = self.state.borrow_mut();
            if st.ly != y {
                st.ly = y;
                st.coincidence = false;
            }
            st.bus_phase = mode;
            sync_vram_mapping(&mut mmu, &st, &self.vram);
            sync_oam_mapping(&mut mmu, &st, &self.oam);
            st.refresh_interrupt_line(&mut mmu, mode);
        }
        let state = Rc::clone(&self.state);
        let mmu = Rc::clone(&self.mmu);
        let at = self.sched.get_cycle_counter().wrapping_add(4);
        self.sched.enqueue(at, Unit::Ppu, PRIORITY_WRITE, move || {
            let mut mmu = mmu.borrow_mut();
            let mut st = state.borrow_mut();
            st.mode = mode;
            if matches!(
                mode,
                Mode::HBlank | Mode::VBlank | Mode::OamSearch | Mode::InitialPowerOn
            ) {
                st.coincidence = st.lyc == st.ly;
                st.refresh_interrupt_line(&mut mmu, mode);
            }
        });
    }

    async fn frame(&mut self, lcd_on_bug: bool) -> Result<(), Restart> {
        self.window_line = 0;
        self.window_triggered = false;

        for y in 0..SCREEN_HEIGHT as u8 {
            self.scanline(y, lcd_on_bug && y == 0).await?;
        }

        self.present();

        for y in 144..153u8 {
            self.update_stat(Mode::VBlank, y);
            self.wait_i(PRIORITY_WRITE, LINE_CYCLES).await?;
        }

        // Line 153 reads LY=153 for just four cycles, then 0 for the rest of
        // the line with the coincidence re-evaluated against the new value.
        self.update_stat(Mode::VBlank, 153);
        self.wait_i(PRIORITY_WRITE, 4).await?;
        self.state.borrow_mut().ly = 0;
        self.wait_i(PRIORITY_WRITE, 4).await?;
        self.state.borrow_mut().coincidence = false;
        self.update_stat(Mode::VBlank, 0);
        self.wait_i(PRIORITY_WRITE, LINE_CYCLES - 8).await?;
        Ok(())
    }

    fn present(&mut self) {
        let callback = self.state.borrow_mut().display_callback.take();
        if let Some(mut callback) = callback {
            callback();
            let mut st = self.state.borrow_mut();
            if st.display_callback.is_none() {
                st.display_callback = Some(callback);
            }
        }
    }

    fn collect_sprites(&self, y: u8, out: &mut Vec<Sprite>) {
        let st = self.state.borrow();
        if st.lcdc & LCDC_OBJ_ENABLE == 0 {
            return;
        }
        let height = st.sprite_height() as i16;
        let tall = height == 16;
        let oam = self.oam.borrow();
        for entry in oam.chunks_exact(4) {
            let mut sprite = Sprite {
                y: entry[0],
                x: entry[1],
                tile: entry[2],
                flags: entry[3],
            };
            let top = sprite.y as i16 - 16;
            if top <= y as i16 && (y as i16) < top + height {
                if tall {
                    sprite.tile &= 0xFE;
                }
                out.push(sprite);
            }
        }
        // Hardware stops at ten per line; priority ties go to the lower X.
        out.truncate(10);
        out.sort_by_key(|s| s.x);
    }

    async fn scanline(&mut self, y: u8, lcd_on_bug: bool) -> Result<(), Restart> {
        let mut line_start = self.sched.get_cycle_counter();
        let mut sprites = Vec::new();

        if lcd_on_bug {
            line_start = line_start.wrapping_sub(LCD_ON_SKIP_CYCLES);
            self.update_stat(Mode::InitialPowerOn, y);
            self.wait_i(PRIORITY_WRITE, OAM_SEARCH_CYCLES - LCD_ON_SKIP_CYCLES)
                .await?;
        } else {
            self.update_stat(Mode::OamSearch, y);
            self.collect_sprites(y, &mut sprites);
            self.wait_i(PRIORITY_WRITE, OAM_SEARCH_CYCLES).await?;
        }

        self.update_stat(Mode::Transfer, y);
        if y >= self.state.borrow().wy {
            // Once hit, the trigger survives WY moving below LY later in the
            // frame.
            self.window_triggered = true;
        }
        let mut line = {
            let st = self.state.borrow();
            Scanline::new(&st, y, sprites, self.window_triggered)
        };

        line.fetch_start = self.sched.get_cycle_counter();
        self.wait_i(PRIORITY_READ, BG_FETCH_CYCLES).await?;
        if line.bg_enable {
            line.load_bg_row(&self.vram.borrow());
            line.fetch_start = self.sched.get_cycle_counter();
        } else {
            line.fifo.load_bg(0, 0);
        }

        // Pixel 0 is processed ahead of the fine-scroll discard.
        self.run_pixels(&mut line, 1, false, y).await?;

        let fine_scroll = self.state.borrow().scx & 7;
        self.wait_i(PRIORITY_READ, fine_scroll as u32).await?;
        line.fifo.discard(fine_scroll);

        // The next seven pixels also fall off the left edge, letting sprites
        // scroll on and the window sit at WX 0-6.
        self.run_pixels(&mut line, 7, false, y).await?;
        self.run_pixels(&mut line, SCREEN_WIDTH as u8, true, y).await?;

        self.update_stat(Mode::HBlank, y);
        let remaining = line_start
            .wrapping_add(LINE_CYCLES)
            .wrapping_sub(self.sched.get_cycle_counter());
        if remaining as i32 > 0 {
            self.wait_i(PRIORITY_WRITE, remaining).await?;
        }
        Ok(())
    }

    /// Advance `count` pixel slots: fetch sprites that trigger at the
    /// cursor, pop or discard ready background pixels, switch into the
    /// window, and keep the fetcher fed.
    async fn run_pixels(
        &mut self,
        line: &mut Scanline,
        count: u8,
        emit: bool,
        y: u8,
    ) -> Result<(), Restart> {
        let mut x: u8 = 0;
        while x < count {
            while line.next_sprite < line.sprites.len()
                && line.sprites[line.next_sprite].x == line.sprite_x
            {
                self.finish_bg_fetch(line).await?;
                self.wait_i(PRIORITY_READ, SPRITE_FETCH_CYCLES).await?;
                line.fetch_sprite(&self.vram.borrow(), y);
                if emit {
                    line.fetch_start = self.sched.get_cycle_counter();
                }
            }

            let mut complete = line.fifo.bg_count.min(count - x);
            if line.window_enable && !line.in_window {
                complete = complete.min(line.wx.wrapping_sub(line.window_x));
            }
            if let Some(sprite) = line.sprites.get(line.next_sprite) {
                complete = complete.min(sprite.x.wrapping_sub(line.sprite_x));
            }

            self.wait_i(PRIORITY_READ, complete as u32).await?;
            if emit {
                let mut st = self.state.borrow_mut();
                for i in 0..complete {
                    let pixel = line.fifo.pop(st.bgp, st.obp0, st.obp1);
                    st.screen[y as usize * SCREEN_WIDTH + (x + i) as usize] = pixel;
                }
            } else {
                line.fifo.discard(complete);
            }
            x += complete;
            line.window_x = line.window_x.wrapping_add(complete);
            line.sprite_x = line.sprite_x.wrapping_add(complete);

            if line.window_enable && !line.in_window && line.window_x == line.wx {
                line.in_window = true;
                line.tile_y = (self.window_line / 8) % 32;
                line.sub_tile_y = (self.window_line % 8) as u16;
                self.window_line += 1;

                self.wait_i(PRIORITY_READ, WINDOW_SWITCH_CYCLES).await?;
                line.tile_x = 0;
                line.load_bg_row(&self.vram.borrow());
                line.tile_x = 1;
                line.fetch_start = self.sched.get_cycle_counter();
            } else if line.fifo.bg_count == 0 {
                if line.in_window || line.bg_enable {
                    self.refill_bg(line).await?;
                } else {
                    line.fifo.load_bg(0, 0);
                }
            }
        }
        Ok(())
    }

    /// Wait out whatever remains of the in-flight background fetch.
    async fn finish_bg_fetch(&self, line: &Scanline) -> Result<(), Restart> {
        let remaining = line
            .fetch_start
            .wrapping_add(BG_FETCH_CYCLES)
            .wrapping_sub(self.sched.get_cycle_counter());
        if remaining as i32 > 0 {
            self.wait_i(PRIORITY_READ, remaining).await?;
        }
        Ok(())
    }

    async fn refill_bg(&self, line: &mut Scanline) -> Result<(), Restart> {
        let now = self.sched.get_cycle_counter();
        if line.fetch_start != now {
            let remaining = line
                .fetch_start
                .wrapping_add(BG_FETCH_CYCLES)
                .wrapping_sub(now);
            if remaining as i32 > 0 {
                self.wait_i(PRIORITY_READ, remaining).await?;
            }
        }
        line.load_bg_row(&self.vram.borrow());
        line.tile_x = (line.tile_x + 1) % 32;
        line.fetch_start = self.sched.get_cycle_counter();
        Ok(())
    }
}

struct DmaTask {
    sched: Scheduler,
    mmu: Rc<RefCell<Mmu>>,
    state: Rc<RefCell<PpuState>>,
    oam: Rc<RefCell<Vec<u8>>>,
    dma_trigger: Signal,
}

impl DmaTask {
    async fn run(self) -> Result<(), Error> {
        loop {
            self.dma_trigger.reset();
            self.dma_trigger.wait(Unit::Dma).await;

            let mut source_page;
            loop {
                // Setup delay before the transfer claims the OAM bus.
                self.sched.cycles(Unit::Dma, PRIORITY_WRITE, 8).await;
                source_page = self.state.borrow().dma;
                if source_page >= 0xE0 {
                    // Sources above 0xE0 read the WRAM mirror instead of OAM.
                    source_page -= 0x20;
                }
                {
                    let mut mmu = self.mmu.borrow_mut();
                    let mut st = self.state.borrow_mut();
                    st.dma_oam_block = true;
                    sync_oam_mapping(&mut mmu, &st, &self.oam);
                }
                // A new FF46 write during the transfer restarts it from the
                // top, superseding the pending copy.
                if !self
                    .sched
                    .interruptible_cycles(&self.dma_trigger, Unit::Dma, PRIORITY_WRITE, 640)
                    .await
                {
                    break;
                }
            }

            let mut buf = [0u8; OAM_SIZE];
            {
                let mut mmu = self.mmu.borrow_mut();
                let base = (source_page as u16) << 8;
                for (offset, byte) in buf.iter_mut().enumerate() {
                    *byte = mmu.read8(base + offset as u16);
                }
            }
            self.oam.borrow_mut().copy_from_slice(&buf);

            {
                let mut mmu = self.mmu.borrow_mut();
                let mut st = self.state.borrow_mut();
                st.dma_oam_block = false;
                sync_oam_mapping(&mut mmu, &st, &self.oam);
            }
        }
    }
}
