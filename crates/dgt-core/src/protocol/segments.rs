//! Seven-segment glyphs for the DGT XL display.
//!
//! Segment bits: 0x01 top, 0x02 right top, 0x04 right bottom, 0x08 bottom,
//! 0x10 left bottom, 0x20 left top, 0x40 centre.

/// Number of 7-segment positions on the clock ("1A:BC 1D:EF").
pub const DISPLAY_WIDTH: usize = 6;

/// Segment mask for `c`, case-insensitive; `None` if the display cannot show it.
pub fn segments_for(c: char) -> Option<u8> {
    let mask = match c.to_ascii_lowercase() {
        '0' => 0x3f,
        '1' => 0x06,
        '2' => 0x5b,
        '3' => 0x4f,
        '4' => 0x66,
        '5' => 0x6d,
        '6' => 0x7d,
        '7' => 0x07,
        '8' => 0x7f,
        '9' => 0x6f,
        'a' => 0x5f,
        'b' => 0x7c,
        'c' => 0x58,
        'd' => 0x5e,
        'e' => 0x7b,
        'f' => 0x71,
        'g' => 0x3d,
        'h' => 0x74,
        'i' => 0x10,
        'j' => 0x1e,
        'k' => 0x75,
        'l' => 0x38,
        'm' => 0x55,
        'n' => 0x54,
        'o' => 0x5c,
        'p' => 0x73,
        'q' => 0x67,
        'r' => 0x50,
        's' => 0x6d,
        't' => 0x78,
        'u' => 0x3e,
        'v' => 0x2a,
        'w' => 0x7e,
        'x' => 0x64,
        'y' => 0x6e,
        'z' => 0x5b,
        ' ' => 0x00,
        '-' => 0x40,
        '/' => 0x52,
        '|' => 0x36,
        '\\' => 0x64,
        '?' => 0x53,
        '@' => 0x65,
        '=' => 0x48,
        '_' => 0x08,
        _ => return None,
    };
    Some(mask)
}

/// Renders up to six characters, left to right (A to F), padded with blanks.
///
/// Returns the first character that has no glyph as the error, or the length
/// when the text is too wide.
pub fn render(text: &str) -> Result<[u8; DISPLAY_WIDTH], RenderError> {
    let len = text.chars().count();
    if len > DISPLAY_WIDTH {
        return Err(RenderError::TooLong(len));
    }
    let mut out = [0u8; DISPLAY_WIDTH];
    for (slot, c) in out.iter_mut().zip(text.chars()) {
        *slot = segments_for(c).ok_or(RenderError::Unsupported(c))?;
    }
    Ok(out)
}

/// Why a string could not be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderError {
    TooLong(usize),
    Unsupported(char),
}
