//! Transform unit traversal
//!
//! Residual surfaces are navigated in transform-unit steps using one of two
//! access patterns defined by the standard:
//!
//! * **Surface raster** — plain linear order over the plane, stepping one
//!   TU at a time.
//! * **Block raster** — the plane is divided into 32x32 pixel blocks;
//!   TUs are visited in raster order inside a block, then the walk jumps to
//!   the next block. Edge blocks hold fewer TUs when the plane is not a
//!   multiple of 32.
//!
//! `TuState` precomputes the block geometry for a tile so the decode loop
//! can map TU indices to coordinates, convert to block-aligned indices
//! (where every block is padded up to its full TU count) and test for
//! block starts without dividing in the hot path.

use crate::config::{BLOCK_SIZE, BLOCK_SIZE_SHIFT};
use crate::error::{Error, Result};

/// Progress indicator for coordinate queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuProgress {
    /// The index maps to coordinates and more TUs follow.
    More(u32, u32),
    /// The index is one past the final TU.
    Complete,
}

/// Block geometry derived from the tile dimensions.
#[derive(Debug, Clone, Copy, Default)]
struct BlockArgs {
    /// Number of TUs in a bottom edge block.
    tu_per_block_bottom_edge: u32,
    /// Number of TUs in a right edge block row.
    tu_per_block_row_right_edge: u32,
    /// Number of TUs in a bottom edge block column.
    tu_per_block_col_bottom_edge: u32,
    /// Number of TUs in a whole row of blocks, edge block included.
    tu_per_row: u32,
    /// Number of full blocks in a row.
    whole_blocks_per_row: u32,
    /// Number of full blocks in a column.
    whole_blocks_per_col: u32,
    /// Number of blocks in a row, partial included.
    blocks_per_row: u32,
    /// TUs in a whole block: 64 for DDS, 256 for DD.
    tu_per_block: u32,
    /// TUs across (or down) a whole block: 8 for DDS, 16 for DD.
    tu_per_block_dims: u32,
    tu_per_block_dims_shift: u8,
    tu_per_block_shift: u8,
    /// TU index above which bottom-edge block sizes apply.
    max_whole_block_tu: u32,
}

/// Block-aligned geometry, where the surface is rounded up to whole blocks.
#[derive(Debug, Clone, Copy, Default)]
struct BlockAlignedArgs {
    /// TUs in a whole aligned row of blocks.
    tu_per_row: u32,
    /// Y position of the first partial block row.
    max_whole_block_y: u32,
}

/// Traversal state for one tile of a plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct TuState {
    /// Total number of TUs in the tile.
    pub tu_total: u32,
    /// Tile width in TUs.
    pub num_across: u32,
    /// Tile origin in pixels.
    pub x_offset: u32,
    pub y_offset: u32,
    /// log2 of the TU width: 1 for DD, 2 for DDS.
    pub tu_width_shift: u8,

    block: BlockArgs,
    block_aligned: BlockAlignedArgs,
}

impl TuState {
    /// Set up traversal over a `width` x `height` pixel region with its
    /// origin at (`x_offset`, `y_offset`).
    ///
    /// The region dimensions must be multiples of the TU size.
    pub fn new(
        width: u32,
        height: u32,
        x_offset: u32,
        y_offset: u32,
        tu_width_shift: u8,
    ) -> Result<Self> {
        debug_assert!(tu_width_shift > 0);

        let tu_size = 1u32 << tu_width_shift;
        if width & (tu_size - 1) != 0 || height & (tu_size - 1) != 0 {
            return Err(Error::invalid_input(
                "Region dimensions must be divisible by the transform size",
            ));
        }

        let num_across = width >> tu_width_shift;
        let tu_per_block_dims_shift = if tu_width_shift == 1 { 4 } else { 3 };
        let tu_per_block_dims = 1u32 << tu_per_block_dims_shift;
        let tu_per_block_shift = tu_per_block_dims_shift << 1;
        let tu_per_block = 1u32 << tu_per_block_shift;

        let tu_per_block_row_right_edge = (width & (BLOCK_SIZE - 1)) >> tu_width_shift;
        let tu_per_block_col_bottom_edge = (height & (BLOCK_SIZE - 1)) >> tu_width_shift;

        let block = BlockArgs {
            tu_per_block_row_right_edge,
            tu_per_block_col_bottom_edge,
            tu_per_block_bottom_edge: tu_per_block_col_bottom_edge << tu_per_block_dims_shift,
            tu_per_row: num_across << tu_per_block_dims_shift,
            whole_blocks_per_row: width >> BLOCK_SIZE_SHIFT,
            whole_blocks_per_col: height >> BLOCK_SIZE_SHIFT,
            blocks_per_row: (width + BLOCK_SIZE - 1) >> BLOCK_SIZE_SHIFT,
            tu_per_block,
            tu_per_block_dims,
            tu_per_block_dims_shift: tu_per_block_dims_shift as u8,
            tu_per_block_shift: tu_per_block_shift as u8,
            max_whole_block_tu: (height >> BLOCK_SIZE_SHIFT)
                * (num_across << tu_per_block_dims_shift),
        };

        let block_aligned_width = (width + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        let block_aligned = BlockAlignedArgs {
            tu_per_row: (block_aligned_width >> tu_width_shift) << tu_per_block_dims_shift,
            max_whole_block_y: block.whole_blocks_per_col << BLOCK_SIZE_SHIFT,
        };

        Ok(TuState {
            tu_total: num_across * (height >> tu_width_shift),
            num_across,
            x_offset,
            y_offset,
            tu_width_shift,
            block,
            block_aligned,
        })
    }

    /// TUs in one whole block.
    pub fn tu_per_block(&self) -> u32 {
        self.block.tu_per_block
    }

    /// TUs in a whole row of blocks.
    pub fn tu_per_row(&self) -> u32 {
        self.block.tu_per_row
    }

    /// TU index above which bottom-edge block sizes apply.
    pub fn max_whole_block_tu(&self) -> u32 {
        self.block.max_whole_block_tu
    }

    /// Map a TU index to pixel coordinates with the surface raster pattern.
    pub fn coords_surface_raster(&self, tu_index: u32) -> Result<TuProgress> {
        if tu_index > self.tu_total {
            return Err(Error::invalid_input("TU index past end of region"));
        }
        if tu_index == self.tu_total {
            return Ok(TuProgress::Complete);
        }

        Ok(TuProgress::More(
            ((tu_index % self.num_across) << self.tu_width_shift) + self.x_offset,
            ((tu_index / self.num_across) << self.tu_width_shift) + self.y_offset,
        ))
    }

    /// Inverse of [`coords_surface_raster`](Self::coords_surface_raster).
    pub fn surface_index(&self, x: u32, y: u32) -> u32 {
        (y >> self.tu_width_shift) * self.num_across + (x >> self.tu_width_shift)
    }

    /// Map a TU index to pixel coordinates with the block raster pattern.
    pub fn coords_block_raster(&self, tu_index: u32) -> Result<TuProgress> {
        if tu_index > self.tu_total {
            return Err(Error::invalid_input("TU index past end of region"));
        }
        if tu_index == self.tu_total {
            return Ok(TuProgress::Complete);
        }

        let block = &self.block;

        let block_row_index = tu_index / block.tu_per_row;
        let row_tu_index = tu_index - block_row_index * block.tu_per_row;

        let (block_col_index, block_tu_index) = if block_row_index >= block.whole_blocks_per_col {
            // Bottom edge blocks hold fewer TUs.
            (
                row_tu_index / block.tu_per_block_bottom_edge,
                row_tu_index % block.tu_per_block_bottom_edge,
            )
        } else {
            let col = row_tu_index >> block.tu_per_block_shift;
            (col, row_tu_index - (col << block.tu_per_block_shift))
        };

        let (tu_x, tu_y) = if block_col_index >= block.whole_blocks_per_row {
            (
                block_tu_index % block.tu_per_block_row_right_edge,
                block_tu_index / block.tu_per_block_row_right_edge,
            )
        } else {
            let y = block_tu_index >> block.tu_per_block_dims_shift;
            (block_tu_index - (y << block.tu_per_block_dims_shift), y)
        };

        let tu_x = tu_x + (block_col_index << block.tu_per_block_dims_shift);
        let tu_y = tu_y + (block_row_index << block.tu_per_block_dims_shift);

        Ok(TuProgress::More(
            (tu_x << self.tu_width_shift) + self.x_offset,
            (tu_y << self.tu_width_shift) + self.y_offset,
        ))
    }

    /// Map a TU index to pixel coordinates within a block-aligned surface
    /// (dimensions rounded up to whole 32x32 blocks).
    pub fn coords_block_aligned_raster(&self, tu_index: u32) -> (u32, u32) {
        let block = &self.block;
        let aligned = &self.block_aligned;

        let block_row_index = tu_index / aligned.tu_per_row;
        let row_tu_index = tu_index - block_row_index * aligned.tu_per_row;

        let block_col_index = row_tu_index >> block.tu_per_block_shift;
        let block_tu_index = row_tu_index - (block_col_index << block.tu_per_block_shift);
        let tu_y = block_tu_index >> block.tu_per_block_dims_shift;
        let tu_x = block_tu_index - (tu_y << block.tu_per_block_dims_shift);

        (
            ((tu_x + (block_col_index << block.tu_per_block_dims_shift)) << self.tu_width_shift)
                + self.x_offset,
            ((tu_y + (block_row_index << block.tu_per_block_dims_shift)) << self.tu_width_shift)
                + self.y_offset,
        )
    }

    /// Block-aligned TU index for a pixel coordinate.
    pub fn block_aligned_index(&self, x: u32, y: u32) -> u32 {
        debug_assert!(x >= self.x_offset && y >= self.y_offset);

        let x = x - self.x_offset;
        let y = y - self.y_offset;
        let block_x = x >> BLOCK_SIZE_SHIFT;
        let block_y = y >> BLOCK_SIZE_SHIFT;

        // TU index of the block's top-left corner, then the offset inside.
        let mut index = block_y * self.block_aligned.tu_per_row
            + (block_x << self.block.tu_per_block_shift);
        index += ((y - block_y * BLOCK_SIZE) >> self.tu_width_shift)
            << self.block.tu_per_block_dims_shift;
        index += (x - block_x * BLOCK_SIZE) >> self.tu_width_shift;

        index
    }

    /// Convert a block-raster TU index to its block-aligned equivalent,
    /// accounting for partial edge blocks.
    pub fn index_block_aligned(&self, tu_index: u32) -> u32 {
        let block = &self.block;
        let mut index = tu_index;

        if block.tu_per_block_row_right_edge > 0 {
            let block_row_index = tu_index / block.tu_per_row;
            index += (block.tu_per_block
                - block.tu_per_block_row_right_edge * block.tu_per_block_dims)
                * block_row_index;
            if (tu_index % block.tu_per_row) > (block.whole_blocks_per_row * block.tu_per_block) {
                index += (((tu_index % block.tu_per_row) % block.tu_per_block)
                    / block.tu_per_block_row_right_edge)
                    * (block.tu_per_block_dims - block.tu_per_block_row_right_edge);
            }
        }

        if block.tu_per_block_col_bottom_edge > 0 && tu_index > block.max_whole_block_tu {
            let last_row_block_index = (tu_index - block.max_whole_block_tu)
                / (block.tu_per_block_col_bottom_edge * block.tu_per_block_dims);
            index += (block.tu_per_block
                - block.tu_per_block_col_bottom_edge * block.tu_per_block_dims)
                * last_row_block_index;
            if last_row_block_index == block.blocks_per_row - 1
                && block.tu_per_block_row_right_edge > 0
            {
                index += (((tu_index - block.max_whole_block_tu)
                    % (block.tu_per_block_col_bottom_edge * block.tu_per_block_dims))
                    / block.tu_per_block_row_right_edge)
                    * (block.tu_per_block_dims - block.tu_per_block_row_right_edge);
            }
        }

        index
    }

    /// Number of TUs in the block that contains `tu_index`.
    pub fn block_tu_count(&self, tu_index: u32) -> u32 {
        let block = &self.block;
        let right_limit = block.whole_blocks_per_row << block.tu_per_block_shift;

        let tu_wide = if (tu_index % block.tu_per_row) >= right_limit {
            block.tu_per_block_row_right_edge
        } else {
            block.tu_per_block_dims
        };
        let tu_high = if tu_index >= block.max_whole_block_tu {
            block.tu_per_block_col_bottom_edge
        } else {
            block.tu_per_block_dims
        };

        tu_wide * tu_high
    }

    /// True when `tu_index` is the first (top-left) TU of a block.
    pub fn is_block_start(&self, tu_index: u32) -> bool {
        let block = &self.block;
        if tu_index >= block.max_whole_block_tu {
            (tu_index - block.max_whole_block_tu) % block.tu_per_block_bottom_edge == 0
        } else {
            (tu_index % block.tu_per_row) % block.tu_per_block == 0
        }
    }
}
