//! Terminal dimensions applied to a PTY before and after spawning

use serde::{Deserialize, Serialize};

/// Rows and columns of a PTY, as carried by `TIOCSWINSZ`
///
/// In TOML the pixel fields may be left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    /// Most programs ignore the pixel fields; 0 means unknown
    #[serde(default)]
    pub pixel_width: u16,
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    /// Size in character cells, pixels unknown
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_pixels(cols, rows, 0, 0)
    }

    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// The kernel's view of this size, ready for `TIOCSWINSZ`
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

/// The classic 80x24 terminal
impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Read back from `TIOCGWINSZ`
impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self::with_pixels(ws.ws_col, ws.ws_row, ws.ws_xpixel, ws.ws_ypixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_default() {
        let size = WindowSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_window_size_with_pixels() {
        let size = WindowSize::with_pixels(100, 30, 800, 600);
        let ws = size.to_winsize();
        assert_eq!(ws.ws_col, 100);
        assert_eq!(ws.ws_row, 30);
        assert_eq!(WindowSize::from(ws), size);
    }

    #[test]
    fn test_window_size_toml_pixels_optional() {
        let size: WindowSize = toml::from_str("rows = 40\ncols = 120").unwrap();
        assert_eq!(size, WindowSize::new(120, 40));
    }
}
