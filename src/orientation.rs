//! Stored image orientation and its undo decomposition.

/// EXIF orientation tag values.
///
/// Describes how the stored pixels relate to the intended display. A sink
/// configured with an undo orientation writes pixels so that the output
/// matches the display orientation. Every value decomposes into an optional
/// horizontal flip, an optional vertical flip and an optional transpose; see
/// [`flips_x`](Orientation::flips_x), [`flips_y`](Orientation::flips_y) and
/// [`transposes`](Orientation::transposes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Orientation {
    /// No rotation or flip needed.
    #[default]
    Identity = 1,
    /// Flip horizontally (mirror left-right).
    FlipHorizontal = 2,
    /// Rotate 180 degrees.
    Rotate180 = 3,
    /// Flip vertically (mirror top-bottom).
    FlipVertical = 4,
    /// Transpose (swap x and y).
    Transpose = 5,
    /// Rotate 90 degrees clockwise.
    Rotate90 = 6,
    /// Transpose across the anti-diagonal.
    AntiTranspose = 7,
    /// Rotate 270 degrees clockwise (= 90 CCW).
    Rotate270 = 8,
}

impl Orientation {
    /// All eight orientations in EXIF order.
    pub const ALL: [Self; 8] = [
        Self::Identity,
        Self::FlipHorizontal,
        Self::Rotate180,
        Self::FlipVertical,
        Self::Transpose,
        Self::Rotate90,
        Self::AntiTranspose,
        Self::Rotate270,
    ];

    /// Create from EXIF orientation value (1-8).
    ///
    /// Returns [`Identity`](Orientation::Identity) for out-of-range values.
    pub fn from_exif(value: u16) -> Self {
        match value {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::AntiTranspose,
            8 => Self::Rotate270,
            _ => Self::Identity,
        }
    }

    /// EXIF tag value (1-8).
    pub fn exif_value(self) -> u16 {
        self as u16
    }

    /// Whether undoing this orientation mirrors columns.
    pub const fn flips_x(self) -> bool {
        matches!(
            self,
            Self::FlipHorizontal | Self::Rotate180 | Self::Rotate270 | Self::AntiTranspose
        )
    }

    /// Whether undoing this orientation mirrors rows.
    pub const fn flips_y(self) -> bool {
        matches!(
            self,
            Self::FlipVertical | Self::Rotate180 | Self::Rotate90 | Self::AntiTranspose
        )
    }

    /// Whether undoing this orientation swaps x and y.
    ///
    /// Flips apply in stored coordinates, before the transpose.
    pub const fn transposes(self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Rotate270 | Self::AntiTranspose
        )
    }

    /// Whether this orientation swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        self.transposes()
    }

    /// Compute display dimensions for the given stored dimensions.
    pub fn display_dimensions(self, stored_width: u32, stored_height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (stored_height, stored_width)
        } else {
            (stored_width, stored_height)
        }
    }

    /// Map a stored pixel position to where it lands in the output.
    ///
    /// `width` and `height` are the stored dimensions.
    pub fn map_position(self, x: usize, y: usize, width: usize, height: usize) -> (usize, usize) {
        let x = if self.flips_x() { width - 1 - x } else { x };
        let y = if self.flips_y() { height - 1 - y } else { y };
        if self.transposes() { (y, x) } else { (x, y) }
    }

    /// Whether any transformation is needed.
    pub fn is_identity(self) -> bool {
        matches!(self, Self::Identity)
    }
}
