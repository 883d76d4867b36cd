//! Color-encoding metadata carried alongside in-memory frames.
//!
//! The pipeline never converts color; it only records what the channel
//! values mean so a later re-encode or CMS step can interpret them.

use std::sync::Arc;

/// CICP color description (ITU-T H.273).
///
/// Common combinations:
/// - sRGB: `(1, 13, 0, true)`: BT.709 primaries, sRGB transfer, identity matrix
/// - Linear sRGB: `(1, 8, 0, true)`
/// - BT.2100 PQ (HDR): `(9, 16, 0, true)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cicp {
    /// Color primaries (1 = BT.709/sRGB, 9 = BT.2020, 12 = Display P3).
    pub color_primaries: u8,
    /// Transfer characteristics (8 = linear, 13 = sRGB, 16 = PQ, 18 = HLG).
    pub transfer_characteristics: u8,
    /// Matrix coefficients (0 = identity/RGB).
    pub matrix_coefficients: u8,
    /// Full-range sample values.
    pub full_range: bool,
}

impl Cicp {
    /// sRGB primaries and transfer, RGB samples.
    pub const SRGB: Self = Self {
        color_primaries: 1,
        transfer_characteristics: 13,
        matrix_coefficients: 0,
        full_range: true,
    };

    /// sRGB primaries, linear transfer.
    pub const LINEAR_SRGB: Self = Self {
        color_primaries: 1,
        transfer_characteristics: 8,
        matrix_coefficients: 0,
        full_range: true,
    };

    /// Whether the transfer characteristic is linear light.
    pub const fn is_linear(&self) -> bool {
        self.transfer_characteristics == 8
    }
}

/// What the color planes of a frame hold.
///
/// ICC bytes are shared through an `Arc` so the metadata can be cloned into
/// every frame of an animation without copying the profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColorEncoding {
    /// CICP description, if known.
    pub cicp: Option<Cicp>,
    /// Raw ICC profile, if the source had one.
    pub icc: Option<Arc<[u8]>>,
    /// Whether the color planes hold a single gray channel replicated.
    pub grayscale: bool,
}

impl Default for ColorEncoding {
    fn default() -> Self {
        Self::srgb()
    }
}

impl ColorEncoding {
    /// sRGB color.
    pub fn srgb() -> Self {
        Self::from_cicp(Cicp::SRGB)
    }

    /// Linear-light sRGB color.
    pub fn linear_srgb() -> Self {
        Self::from_cicp(Cicp::LINEAR_SRGB)
    }

    /// Create from CICP parameters.
    pub fn from_cicp(cicp: Cicp) -> Self {
        Self {
            cicp: Some(cicp),
            icc: None,
            grayscale: false,
        }
    }

    /// Create from an ICC profile.
    pub fn from_icc(icc: impl Into<Arc<[u8]>>) -> Self {
        Self {
            cicp: None,
            icc: Some(icc.into()),
            grayscale: false,
        }
    }

    /// Mark the encoding as grayscale.
    pub fn with_grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    /// True if this describes sRGB via CICP.
    pub fn is_srgb(&self) -> bool {
        self.cicp == Some(Cicp::SRGB)
    }

    /// True if the color planes hold linear light.
    pub fn is_linear(&self) -> bool {
        self.cicp.is_some_and(|c| c.is_linear())
    }
}
