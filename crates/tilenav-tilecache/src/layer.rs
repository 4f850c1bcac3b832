//! Compressed tile layers and their binary format.
//!
//! A cache payload is a little-endian blob: a fixed layer header followed
//! by the compressed cell grids (heights, areas, neighbour connectivity,
//! concatenated in that order). The compressor itself is a collaborator
//! injected by the caller; [`Lz4Compressor`] is the stock implementation.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use tilenav::{Result, Status};
use tilenav_common::align4;

/// Magic number identifying a compressed tile layer payload.
pub const TILECACHE_MAGIC: u32 = 0x4354_4E54; // 'TNTC' in little-endian

/// Compressed tile layer format version.
pub const TILECACHE_VERSION: u32 = 1;

const LAYER_HEADER_SIZE: usize = 54;

/// Header of a compressed tile layer.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct LayerHeader {
    pub magic: u32,
    pub version: u32,
    /// Tile grid location.
    pub tx: i32,
    pub ty: i32,
    pub tlayer: i32,
    /// Tile bounding box.
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Height range of the layer, in cell units.
    pub hmin: u16,
    pub hmax: u16,
    /// Grid dimensions, in cells.
    pub width: u8,
    pub height: u8,
    /// Tight usable sub-rectangle of the grid.
    pub minx: u8,
    pub maxx: u8,
    pub miny: u8,
    pub maxy: u8,
}

impl LayerHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.tx.to_le_bytes());
        out.extend_from_slice(&self.ty.to_le_bytes());
        out.extend_from_slice(&self.tlayer.to_le_bytes());
        for v in self.bmin.iter().chain(self.bmax.iter()) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.hmin.to_le_bytes());
        out.extend_from_slice(&self.hmax.to_le_bytes());
        out.push(self.width);
        out.push(self.height);
        out.push(self.minx);
        out.push(self.maxx);
        out.push(self.miny);
        out.push(self.maxy);
    }

    /// Parses a layer header, validating magic and version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Status::InvalidParam);
        }
        let mut cur = Cursor::new(data);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != TILECACHE_MAGIC {
            return Err(Status::WrongMagic);
        }
        let version = cur.read_u32::<LittleEndian>()?;
        if version != TILECACHE_VERSION {
            return Err(Status::WrongVersion);
        }
        if data.len() < LAYER_HEADER_SIZE {
            return Err(Status::InvalidParam);
        }
        Ok(Self {
            magic,
            version,
            tx: cur.read_i32::<LittleEndian>()?,
            ty: cur.read_i32::<LittleEndian>()?,
            tlayer: cur.read_i32::<LittleEndian>()?,
            bmin: read_f32x3(&mut cur)?,
            bmax: read_f32x3(&mut cur)?,
            hmin: cur.read_u16::<LittleEndian>()?,
            hmax: cur.read_u16::<LittleEndian>()?,
            width: cur.read_u8()?,
            height: cur.read_u8()?,
            minx: cur.read_u8()?,
            maxx: cur.read_u8()?,
            miny: cur.read_u8()?,
            maxy: cur.read_u8()?,
        })
    }
}

/// A decompressed tile layer: per-cell grids in row-major order.
#[derive(Debug, Clone)]
pub struct TileCacheLayer {
    pub header: LayerHeader,
    /// Surface height of each cell, in cell units.
    pub heights: Vec<u8>,
    /// Area id of each cell; 0 marks unwalkable space.
    pub areas: Vec<u8>,
    /// Packed neighbour connectivity of each cell.
    pub cons: Vec<u8>,
}

impl TileCacheLayer {
    /// Grid size in cells.
    pub fn grid_size(&self) -> usize {
        self.header.width as usize * self.header.height as usize
    }
}

fn read_f32x3(cur: &mut Cursor<&[u8]>) -> Result<[f32; 3]> {
    Ok([
        cur.read_f32::<LittleEndian>()?,
        cur.read_f32::<LittleEndian>()?,
        cur.read_f32::<LittleEndian>()?,
    ])
}

/// Symmetric, byte-granular compressor for layer grids.
pub trait TileCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Stock LZ4 compressor.
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl TileCompressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| {
            log::error!("layer decompression failed: {e}");
            Status::Failure
        })
    }
}

/// Assembles a compressed layer payload from its grids.
pub fn build_tile_cache_layer(
    compressor: &dyn TileCompressor,
    header: &LayerHeader,
    heights: &[u8],
    areas: &[u8],
    cons: &[u8],
) -> Result<Vec<u8>> {
    let grid_size = header.width as usize * header.height as usize;
    if heights.len() != grid_size || areas.len() != grid_size || cons.len() != grid_size {
        return Err(Status::InvalidParam);
    }

    let mut grids = Vec::with_capacity(grid_size * 3);
    grids.extend_from_slice(heights);
    grids.extend_from_slice(areas);
    grids.extend_from_slice(cons);
    let compressed = compressor.compress(&grids)?;

    let mut out = Vec::with_capacity(align4(LAYER_HEADER_SIZE) + compressed.len());
    header.write_to(&mut out);
    while out.len() < align4(LAYER_HEADER_SIZE) {
        out.push(0);
    }
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decompresses a layer payload back into its grids.
pub fn decompress_tile_cache_layer(
    compressor: &dyn TileCompressor,
    data: &[u8],
) -> Result<TileCacheLayer> {
    let header = LayerHeader::from_bytes(data)?;
    let grid_size = header.width as usize * header.height as usize;

    let payload = &data[align4(LAYER_HEADER_SIZE)..];
    let grids = compressor.decompress(payload)?;
    if grids.len() != grid_size * 3 {
        return Err(Status::InvalidParam);
    }

    Ok(TileCacheLayer {
        header,
        heights: grids[..grid_size].to_vec(),
        areas: grids[grid_size..grid_size * 2].to_vec(),
        cons: grids[grid_size * 2..].to_vec(),
    })
}
