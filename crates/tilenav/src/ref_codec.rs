//! Opaque polygon and tile references and the bit-packed codec behind them.
//!
//! A reference packs three fields into a `u32`: a salt (generation
//! counter), a tile slot index and a polygon index within the tile. The
//! field widths are decided once at navigation mesh init from the maximum
//! tile and polygon counts; callers never see the raw layout.

use tilenav_common::{ilog2, next_pow2};

use super::{Result, Status};

/// Opaque reference to a polygon in the navigation mesh.
///
/// The zero value is reserved as the null reference; a live reference
/// always carries a non-zero salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(pub(crate) u32);

impl PolyRef {
    /// The null polygon reference.
    pub const NULL: PolyRef = PolyRef(0);

    /// Returns true if this is the null reference.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw identifier value, for logging and serialisation only.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Opaque reference to a tile: a [`PolyRef`] whose polygon field is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileRef(pub(crate) u32);

impl TileRef {
    /// The null tile reference.
    pub const NULL: TileRef = TileRef(0);

    /// Returns true if this is the null reference.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw identifier value, for logging and serialisation only.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }

    /// The polygon-reference base of this tile: same salt and tile index,
    /// polygon index zero. Or-ing a polygon index onto it yields that
    /// polygon's reference.
    #[inline]
    pub fn base(self) -> PolyRef {
        PolyRef(self.0)
    }
}

impl From<TileRef> for PolyRef {
    fn from(t: TileRef) -> Self {
        PolyRef(t.0)
    }
}

/// Bit-packed reference codec with init-time field widths.
///
/// Widths are `ceil_log2` of the respective maximum counts, with the
/// remaining bits (capped at 31) allotted to the salt. Construction fails
/// when fewer than 10 salt bits remain.
#[derive(Debug, Clone, Copy)]
pub struct RefCodec {
    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl RefCodec {
    /// Derives field widths for the given capacity.
    pub fn new(max_tiles: u32, max_polys: u32) -> Result<Self> {
        let tile_bits = ilog2(next_pow2(max_tiles));
        let poly_bits = ilog2(next_pow2(max_polys));
        let salt_bits = 32i32 - tile_bits as i32 - poly_bits as i32;
        if salt_bits < 10 {
            return Err(Status::InvalidParam);
        }
        Ok(Self {
            salt_bits: (salt_bits as u32).min(31),
            tile_bits,
            poly_bits,
        })
    }

    /// Packs (salt, tile index, poly index) into a reference.
    #[inline]
    pub fn encode(&self, salt: u32, tile: u32, poly: u32) -> PolyRef {
        PolyRef(
            ((salt & self.salt_mask()) << (self.poly_bits + self.tile_bits))
                | ((tile & self.tile_mask()) << self.poly_bits)
                | (poly & self.poly_mask()),
        )
    }

    /// Packs (salt, tile index) into a tile reference.
    #[inline]
    pub fn encode_tile(&self, salt: u32, tile: u32) -> TileRef {
        TileRef(self.encode(salt, tile, 0).0)
    }

    /// Unpacks a reference into (salt, tile index, poly index).
    #[inline]
    pub fn decode(&self, r: PolyRef) -> (u32, u32, u32) {
        (self.decode_salt(r), self.decode_tile(r), self.decode_poly(r))
    }

    /// Extracts the salt field.
    #[inline]
    pub fn decode_salt(&self, r: PolyRef) -> u32 {
        (r.0 >> (self.poly_bits + self.tile_bits)) & self.salt_mask()
    }

    /// Extracts the tile index field.
    #[inline]
    pub fn decode_tile(&self, r: PolyRef) -> u32 {
        (r.0 >> self.poly_bits) & self.tile_mask()
    }

    /// Extracts the polygon index field.
    #[inline]
    pub fn decode_poly(&self, r: PolyRef) -> u32 {
        r.0 & self.poly_mask()
    }

    /// Largest polygon count a tile may carry under this codec.
    #[inline]
    pub fn max_polys(&self) -> u32 {
        1 << self.poly_bits
    }

    /// Mask covering the salt field.
    #[inline]
    pub fn salt_mask(&self) -> u32 {
        ((1u64 << self.salt_bits) - 1) as u32
    }

    #[inline]
    fn tile_mask(&self) -> u32 {
        ((1u64 << self.tile_bits) - 1) as u32
    }

    #[inline]
    fn poly_mask(&self) -> u32 {
        ((1u64 << self.poly_bits) - 1) as u32
    }
}
