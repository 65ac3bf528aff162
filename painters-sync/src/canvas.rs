//! Bit-packed shared canvas.
//!
//! Layout:
//! ```text
//! cell (x, y)  →  bit index i = y * width + x
//!              →  byte i / 8, bit i % 8 (LSB first)
//!
//! byte 0                 byte 1
//! ┌─┬─┬─┬─┬─┬─┬─┬─┐     ┌─┬─┬─┬─┬─┬─┬─┬─┐
//! │7│6│5│4│3│2│1│0│     │F│E│D│C│B│A│9│8│
//! └─┴─┴─┴─┴─┴─┴─┴─┘     └─┴─┴─┴─┴─┴─┴─┴─┘
//! ```
//!
//! A 200×200 canvas packs into 5000 bytes, which is also the exact size of
//! the persisted snapshot file.

use thiserror::Error;

/// Canvas errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    #[error("Canvas buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Fixed-size grid of 1-bit cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitCanvas {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl BitCanvas {
    /// Create a zero-filled canvas.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    pub fn new(width: u32, height: u32) -> Self {
        assert!(width > 0 && height > 0, "canvas dimensions must be positive");
        Self {
            width,
            height,
            bits: vec![0; Self::byte_len_for(width, height)],
        }
    }

    /// Create a canvas from a packed buffer (e.g. a persisted snapshot).
    pub fn from_raw(width: u32, height: u32, bytes: &[u8]) -> Result<Self, CanvasError> {
        let mut canvas = Self::new(width, height);
        canvas.load_raw(bytes)?;
        Ok(canvas)
    }

    /// Packed size in bytes: `ceil(width * height / 8)`.
    pub fn byte_len_for(width: u32, height: u32) -> usize {
        (width as usize * height as usize).div_ceil(8)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed size of this canvas in bytes.
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    /// Whether `(x, y)` lies inside the canvas.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    fn locate(&self, x: u32, y: u32) -> (usize, u8) {
        let index = y as usize * self.width as usize + x as usize;
        (index / 8, 1 << (index % 8))
    }

    /// Whether the cell is painted.
    ///
    /// # Panics
    ///
    /// Panics on out-of-range coordinates; callers validate with
    /// [`contains`](Self::contains) first.
    pub fn get(&self, x: u32, y: u32) -> bool {
        assert!(
            self.contains(x, y),
            "cell ({x}, {y}) outside {}x{} canvas",
            self.width,
            self.height
        );
        let (byte, mask) = self.locate(x, y);
        self.bits[byte] & mask != 0
    }

    /// Set or clear a cell. Out-of-range coordinates are ignored.
    pub fn set(&mut self, x: u32, y: u32, painted: bool) {
        if !self.contains(x, y) {
            return;
        }
        let (byte, mask) = self.locate(x, y);
        if painted {
            self.bits[byte] |= mask;
        } else {
            self.bits[byte] &= !mask;
        }
    }

    /// Flip a cell, returning its new value (`None` when out of range).
    pub fn toggle(&mut self, x: u32, y: u32) -> Option<bool> {
        if !self.contains(x, y) {
            return None;
        }
        let painted = !self.get(x, y);
        self.set(x, y, painted);
        Some(painted)
    }

    /// Packed representation, for chunking and snapshots.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Replace the whole buffer.
    pub fn load_raw(&mut self, bytes: &[u8]) -> Result<(), CanvasError> {
        if bytes.len() != self.bits.len() {
            return Err(CanvasError::SizeMismatch {
                expected: self.bits.len(),
                actual: bytes.len(),
            });
        }
        self.bits.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `bytes` into the buffer at `offset`, clamped to the canvas size.
    ///
    /// Returns the number of bytes actually written.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> usize {
        if offset >= self.bits.len() {
            return 0;
        }
        let len = bytes.len().min(self.bits.len() - offset);
        self.bits[offset..offset + len].copy_from_slice(&bytes[..len]);
        len
    }

    /// Zero every cell.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Number of painted cells.
    pub fn painted_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}
