//! Framebuffer console
//!
//! Character-grid terminal over the Limine framebuffer: the boot banner and
//! the panic screen render here. Owns cursor movement, line wrap, scrolling
//! and clearing; glyph bitmaps come from `font8x8`, drawn line-doubled into
//! 8x16 cells.

use core::fmt;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use spin::Mutex;

/// Glyph cell geometry. Font rows are doubled vertically.
const GLYPH_WIDTH: usize = 8;
const CELL_HEIGHT: usize = 16;

pub const COLOR_WHITE: u32 = 0xFFFF_FFFF;
pub const COLOR_BLACK: u32 = 0xFF00_0000;
pub const COLOR_RED: u32 = 0xFFFF_0000;

/// Console over a 32bpp linear framebuffer.
pub struct Terminal {
    addr: *mut u8,
    pitch: usize,
    cols: usize,
    rows: usize,
    cursor_x: usize,
    cursor_y: usize,
    fg: u32,
    bg: u32,
}

// The framebuffer pointer is only ever touched under the TERMINAL lock.
unsafe impl Send for Terminal {}

static TERMINAL: Mutex<Option<Terminal>> = Mutex::new(None);

impl Terminal {
    fn new(addr: *mut u8, width: usize, height: usize, pitch: usize) -> Self {
        Terminal {
            addr,
            pitch,
            cols: width / GLYPH_WIDTH,
            rows: height / CELL_HEIGHT,
            cursor_x: 0,
            cursor_y: 0,
            fg: COLOR_WHITE,
            bg: COLOR_BLACK,
        }
    }

    fn put_pixel(&mut self, x: usize, y: usize, color: u32) {
        let offset = y * self.pitch + x * 4;
        unsafe {
            (self.addr.add(offset) as *mut u32).write_volatile(color);
        }
    }

    fn draw_glyph(&mut self, ch: char) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0; 8]);
        let px = self.cursor_x * GLYPH_WIDTH;
        let py = self.cursor_y * CELL_HEIGHT;

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                let color = if bits & (1 << col) != 0 { self.fg } else { self.bg };
                self.put_pixel(px + col, py + row * 2, color);
                self.put_pixel(px + col, py + row * 2 + 1, color);
            }
        }
    }

    fn newline(&mut self) {
        self.cursor_x = 0;
        self.cursor_y += 1;
        if self.cursor_y >= self.rows {
            self.scroll();
            self.cursor_y = self.rows - 1;
        }
    }

    fn scroll(&mut self) {
        let row_bytes = CELL_HEIGHT * self.pitch;
        let visible = self.rows * CELL_HEIGHT * self.pitch;
        unsafe {
            core::ptr::copy(self.addr.add(row_bytes), self.addr, visible - row_bytes);
        }
        // Blank the last text row.
        let last = (self.rows - 1) * CELL_HEIGHT;
        for y in last..self.rows * CELL_HEIGHT {
            for x in 0..self.cols * GLYPH_WIDTH {
                self.put_pixel(x, y, self.bg);
            }
        }
    }

    fn put_char(&mut self, ch: char) {
        match ch {
            '\n' => self.newline(),
            '\r' => self.cursor_x = 0,
            ch => {
                self.draw_glyph(ch);
                self.cursor_x += 1;
                if self.cursor_x >= self.cols {
                    self.newline();
                }
            }
        }
    }

    fn clear(&mut self) {
        for y in 0..self.rows * CELL_HEIGHT {
            for x in 0..self.cols * GLYPH_WIDTH {
                self.put_pixel(x, y, self.bg);
            }
        }
        self.cursor_x = 0;
        self.cursor_y = 0;
    }
}

impl fmt::Write for Terminal {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            self.put_char(ch);
        }
        Ok(())
    }
}

/// Initialize the console over the loader's framebuffer. Only 32bpp linear
/// framebuffers are supported; anything else leaves the console disabled
/// (serial output still works).
pub fn init(addr: *mut u8, width: u64, height: u64, pitch: u64, bpp: u16) {
    if bpp != 32 {
        return;
    }
    let mut terminal = Terminal::new(addr, width as usize, height as usize, pitch as usize);
    terminal.clear();
    *TERMINAL.lock() = Some(terminal);
}

pub fn is_initialized() -> bool {
    TERMINAL.lock().is_some()
}

/// Clear the screen and home the cursor.
pub fn clear() {
    if let Some(terminal) = TERMINAL.lock().as_mut() {
        terminal.clear();
    }
}

pub fn set_fg_color(color: u32) {
    if let Some(terminal) = TERMINAL.lock().as_mut() {
        terminal.fg = color;
    }
}

/// Print to the framebuffer console (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    if let Some(terminal) = TERMINAL.lock().as_mut() {
        terminal.write_fmt(args).ok();
    }
}

/// Print to the framebuffer console
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::terminal::_print(format_args!($($arg)*))
    };
}

/// Print to the framebuffer console with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($fmt:expr) => ($crate::print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 64;
    const H: usize = 48;

    fn test_terminal(buf: &mut std::vec::Vec<u8>) -> Terminal {
        buf.resize(W * H * 4, 0);
        Terminal::new(buf.as_mut_ptr(), W, H, W * 4)
    }

    fn pixel(buf: &[u8], x: usize, y: usize) -> u32 {
        let off = y * W * 4 + x * 4;
        u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    #[test]
    fn glyph_lights_foreground_pixels() {
        let mut buf = std::vec::Vec::new();
        let mut terminal = test_terminal(&mut buf);
        terminal.put_char('#');
        let lit = (0..CELL_HEIGHT)
            .flat_map(|y| (0..GLYPH_WIDTH).map(move |x| (x, y)))
            .filter(|&(x, y)| pixel(&buf, x, y) == COLOR_WHITE)
            .count();
        assert!(lit > 0, "glyph drew no foreground pixels");
    }

    #[test]
    fn newline_and_wrap_move_cursor() {
        let mut buf = std::vec::Vec::new();
        let mut terminal = test_terminal(&mut buf);
        terminal.put_char('a');
        assert_eq!((terminal.cursor_x, terminal.cursor_y), (1, 0));
        terminal.put_char('\n');
        assert_eq!((terminal.cursor_x, terminal.cursor_y), (0, 1));
        for _ in 0..terminal.cols {
            terminal.put_char('b');
        }
        assert_eq!((terminal.cursor_x, terminal.cursor_y), (0, 2));
    }

    #[test]
    fn scroll_shifts_rows_up() {
        let mut buf = std::vec::Vec::new();
        let mut terminal = test_terminal(&mut buf);
        // Fill every row, then one more line to force a scroll.
        for _ in 0..terminal.rows {
            terminal.put_char('x');
            terminal.put_char('\n');
        }
        assert_eq!(terminal.cursor_y, terminal.rows - 1);
        // After scrolling, row 0 still shows the glyph that was on row 1.
        let lit_top = (0..CELL_HEIGHT)
            .flat_map(|y| (0..GLYPH_WIDTH).map(move |x| (x, y)))
            .any(|(x, y)| pixel(&buf, x, y) == COLOR_WHITE);
        assert!(lit_top);
    }

    #[test]
    fn clear_resets_screen_and_cursor() {
        let mut buf = std::vec::Vec::new();
        let mut terminal = test_terminal(&mut buf);
        terminal.put_char('z');
        terminal.clear();
        assert_eq!((terminal.cursor_x, terminal.cursor_y), (0, 0));
        let any_lit = (0..H).flat_map(|y| (0..W).map(move |x| (x, y)))
            .any(|(x, y)| pixel(&buf, x, y) == COLOR_WHITE);
        assert!(!any_lit);
    }
}
