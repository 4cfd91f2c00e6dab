//! The process image: one contiguous buffer holding all cyclic PDO data.
//!
//! The driver maps every subdevice's inputs and outputs into this buffer
//! and reads/writes it in place on each cycle, so the allocation must be
//! contiguous, little-endian by convention, and stable in memory for the
//! master's lifetime. Subdevices see only (offset, length) windows.
//!
//! There is no synchronization here: layout establishes a single writer
//! per output window and a single reader per input window.

use ecat_common::{MasterError, MasterResult};

/// Minimum process-image allocation in bytes.
///
/// Small buses round up to this size so the driver can map conservatively
/// sized PDO sets without reallocation.
pub const IOMAP_MIN: usize = 655_360;

/// A byte window into the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageWindow {
    /// Offset from the start of the image.
    pub offset: usize,
    /// Window length in bytes.
    pub len: usize,
}

impl ImageWindow {
    /// Create a window.
    #[must_use]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte of the window.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Whether two windows share any byte. Zero-length windows overlap
    /// nothing.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.len > 0 && other.len > 0 && self.offset < other.end() && other.offset < self.end()
    }
}

/// The contiguous I/O map.
#[derive(Debug, Default)]
pub struct ProcessImage {
    data: Box<[u8]>,
    frozen: bool,
}

impl ProcessImage {
    /// Image of size `max(pdo_bytes, IOMAP_MIN)`, zero-initialized.
    #[must_use]
    pub fn new(pdo_bytes: usize) -> Self {
        Self {
            data: vec![0u8; pdo_bytes.max(IOMAP_MIN)].into_boxed_slice(),
            frozen: false,
        }
    }

    /// Zero-sized placeholder used before `init` allocates the real image.
    #[must_use]
    pub fn unallocated() -> Self {
        Self::default()
    }

    /// Allocated size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True before `init` has allocated the image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole image, for the driver's transmit path.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The whole image, for the driver's mapping and receive paths.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freeze the layout. Windows handed out before the freeze stay
    /// valid; new windows can no longer be cut.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the layout is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Validate that a window lies inside the image; only legal before
    /// the layout freeze.
    pub fn claim(&self, window: ImageWindow) -> MasterResult<ImageWindow> {
        if self.frozen {
            return Err(MasterError::InternalError(0));
        }
        if window.end() > self.data.len() {
            return Err(MasterError::ProcessImageTooSmall {
                required: window.end(),
                allocated: self.data.len(),
            });
        }
        Ok(window)
    }

    /// Read-only view of an input window.
    #[must_use]
    pub fn input(&self, window: ImageWindow) -> &[u8] {
        &self.data[window.offset..window.end()]
    }

    /// Writable view of an output window.
    pub fn output_mut(&mut self, window: ImageWindow) -> &mut [u8] {
        &mut self.data[window.offset..window.end()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_allocation() {
        let image = ProcessImage::new(128);
        assert_eq!(image.len(), IOMAP_MIN);

        let big = ProcessImage::new(IOMAP_MIN + 1);
        assert_eq!(big.len(), IOMAP_MIN + 1);
    }

    #[test]
    fn test_window_overlap() {
        let a = ImageWindow::new(0, 4);
        let b = ImageWindow::new(4, 4);
        let c = ImageWindow::new(2, 4);
        let empty = ImageWindow::new(0, 0);

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&empty));
    }

    #[test]
    fn test_claim_rejects_out_of_range() {
        let image = ProcessImage::new(0);
        assert!(image.claim(ImageWindow::new(0, 16)).is_ok());
        let err = image
            .claim(ImageWindow::new(IOMAP_MIN - 8, 16))
            .unwrap_err();
        assert!(matches!(err, MasterError::ProcessImageTooSmall { .. }));
    }

    #[test]
    fn test_claim_refused_after_freeze() {
        let mut image = ProcessImage::new(0);
        image.freeze();
        assert!(image.claim(ImageWindow::new(0, 1)).is_err());
    }

    #[test]
    fn test_window_views() {
        let mut image = ProcessImage::new(0);
        let out = ImageWindow::new(0, 2);
        let inp = ImageWindow::new(2, 2);

        image.output_mut(out).copy_from_slice(&0x1234u16.to_le_bytes());
        assert_eq!(image.as_slice()[0], 0x34);
        assert_eq!(image.as_slice()[1], 0x12);
        assert_eq!(image.input(inp), &[0, 0]);
    }
}
