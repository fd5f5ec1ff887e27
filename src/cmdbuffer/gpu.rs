//! GPU command buffer and its builder
//!
//! The GPU format describes residuals per 32x32-aligned block: one 64-bit
//! command word per (block, operation) plus a bitmask of the transform
//! units the operation touches (one mask word for DDS blocks of 64 TUs,
//! four for DD blocks of 256 TUs), and one contiguous run of residual
//! values per command in the final `residuals` array.
//!
//! The packed command word layout is:
//!
//! ```text
//!  2 bits: operation
//! 18 bits: block index
//! 27 bits: residual data offset
//!  8 bits: first set bit index
//!  9 bits: set bit count
//! ```
//!
//! The offset field allows a 15360x8640 image with a residual on every
//! pixel.
//!
//! Residuals for a block must be contiguous in the final buffer, but they
//! arrive interleaved by operation type during decode. The builder stages
//! residuals into one growable array per operation type while command
//! entries record offsets within their staging array; `build` concatenates
//! the staging arrays in a fixed order (Add, then Set, then ClearAndSet)
//! and rewrites each command's data offset into the final array.

use crate::config::LAYER_COUNT_DDS;
use crate::error::{Error, Result};

use super::DDS_RESIDUAL_ORDER;

/// Initial capacity of each staging residual buffer, in values.
const INITIAL_RESIDUAL_CAPACITY: usize = 2_048;
/// Initial capacity of the command vector.
const INITIAL_COMMAND_CAPACITY: usize = 256;
/// TUs per block for each transform shape.
const DDS_BLOCK_SIZE: u32 = 64;
const DD_BLOCK_SIZE: u32 = 256;

/// The four block operations, stored in the 2-bit operation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOp {
    /// Add residual data to the TUs in the bitmask.
    Add = 0,
    /// Set residual data on the TUs in the bitmask.
    Set = 1,
    /// Zero the TUs in the bitmask; carries no residual data.
    SetZero = 2,
    /// Zero the whole block, then set residual data on the TUs in the
    /// bitmask.
    ClearAndSet = 3,
}

/// One command: a block operation plus the bitmask of TUs it covers.
///
/// Stored unpacked for construction; [`GpuCmd::word`] produces the packed
/// 64-bit representation the GPU consumer uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCmd {
    pub operation: GpuOp,
    /// Block index within the temporal buffer (18 bits).
    pub block_index: u32,
    /// Offset of the first residual value in the final buffer (27 bits);
    /// zero for `SetZero`.
    pub data_offset: u32,
    /// Index of the first set bit in the bitmask.
    pub bit_start: u8,
    /// Count of set bits in the bitmask (9 bits).
    pub bit_count: u16,
    /// TU bitmask, MSB-first within each word. Only the first word is used
    /// for DDS; DD blocks need all 256 bits.
    pub bitmask: [u64; 4],
}

impl Default for GpuCmd {
    fn default() -> Self {
        GpuCmd {
            operation: GpuOp::Add,
            block_index: 0,
            data_offset: 0,
            bit_start: 0,
            bit_count: 0,
            bitmask: [0; 4],
        }
    }
}

impl GpuCmd {
    /// Pack the command fields into the 64-bit wire word.
    pub fn word(&self) -> u64 {
        debug_assert!(self.block_index < (1 << 18));
        debug_assert!(self.data_offset < (1 << 27));
        debug_assert!(self.bit_count < (1 << 9));

        (self.operation as u64)
            | (u64::from(self.block_index) << 2)
            | (u64::from(self.data_offset) << 20)
            | (u64::from(self.bit_start) << 47)
            | (u64::from(self.bit_count) << 55)
    }
}

/// The final flat command/residual arrays the GPU consumer uploads.
///
/// Both arrays grow as needed and never shrink; `reset` clears the counts
/// while keeping the allocations.
#[derive(Debug, Default)]
pub struct CmdBufferGpu {
    commands: Vec<GpuCmd>,
    residuals: Vec<i16>,
    /// Residual values per TU: 4 for DD, 16 for DDS.
    layer_count: u8,
}

impl CmdBufferGpu {
    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[GpuCmd] {
        &self.commands
    }

    /// Number of commands recorded since the last reset.
    pub fn command_count(&self) -> u32 {
        self.commands.len() as u32
    }

    /// The flattened residual array; valid after [`build`](CmdBufferGpuBuilder::build).
    pub fn residuals(&self) -> &[i16] {
        &self.residuals
    }

    /// Number of residual values in the final array.
    pub fn residual_count(&self) -> u32 {
        self.residuals.len() as u32
    }

    /// Residual values per TU the buffer was reset for.
    pub fn layer_count(&self) -> u8 {
        self.layer_count
    }
}

/// Transient staging state used while a tile decodes into a
/// [`CmdBufferGpu`]. Exists only between `reset` and `build`.
#[derive(Debug, Default)]
pub struct CmdBufferGpuBuilder {
    residuals_add: Vec<i16>,
    residuals_set: Vec<i16>,
    residuals_clear_and_set: Vec<i16>,

    current_add_cmd: Option<usize>,
    current_set_cmd: Option<usize>,
    current_set_zero_cmd: Option<usize>,
    current_clear_and_set_cmd: Option<usize>,

    /// Set while successive appends may still belong to an open
    /// ClearAndSet block.
    building_clear_and_set: bool,
}

impl CmdBufferGpuBuilder {
    /// Create a builder with pre-sized staging buffers.
    pub fn new() -> Self {
        CmdBufferGpuBuilder {
            residuals_add: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            residuals_set: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            residuals_clear_and_set: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            current_add_cmd: None,
            current_set_cmd: None,
            current_set_zero_cmd: None,
            current_clear_and_set_cmd: None,
            building_clear_and_set: false,
        }
    }

    /// Reset the buffer and builder for a new tile with `layer_count`
    /// residual values per TU. Keeps all allocations.
    pub fn reset(&mut self, buffer: &mut CmdBufferGpu, layer_count: u8) -> Result<()> {
        if layer_count as usize != 4 && layer_count as usize != LAYER_COUNT_DDS {
            return Err(Error::invalid_input("Layer count must be 4 or 16"));
        }

        self.residuals_add.clear();
        self.residuals_set.clear();
        self.residuals_clear_and_set.clear();
        self.current_add_cmd = None;
        self.current_set_cmd = None;
        self.current_set_zero_cmd = None;
        self.current_clear_and_set_cmd = None;
        self.building_clear_and_set = false;

        buffer.commands.clear();
        buffer.residuals.clear();
        if buffer.commands.capacity() < INITIAL_COMMAND_CAPACITY {
            buffer
                .commands
                .reserve(INITIAL_COMMAND_CAPACITY - buffer.commands.len());
        }
        buffer.layer_count = layer_count;

        Ok(())
    }

    /// Record `residuals` into the command's bitmask and staging buffer.
    fn append_residuals(
        &mut self,
        buffer: &mut CmdBufferGpu,
        cmd_index: usize,
        residuals: &[i16],
        tu_index: u32,
        tu_raster_order: bool,
    ) {
        let dds = buffer.layer_count as usize == LAYER_COUNT_DDS;
        let cmd = &mut buffer.commands[cmd_index];

        if !tu_raster_order && dds {
            let tu_block_position = tu_index % DDS_BLOCK_SIZE;
            cmd.bitmask[0] |= 1u64 << (DDS_BLOCK_SIZE - 1 - tu_block_position);
            if cmd.bit_count == 0 {
                cmd.bit_start = cmd.bitmask[0].leading_zeros() as u8;
            }
        } else {
            // DD blocks span four mask words; in raster order DDS uses the
            // same indexing over the 256-TU aligned block.
            let tu_block_position = tu_index % DD_BLOCK_SIZE;
            let mask_index = (tu_block_position >> 6) as usize;
            cmd.bitmask[mask_index] |= 1u64 << (63 - (tu_block_position % 64));
            if cmd.bit_count == 0 {
                cmd.bit_start = cmd.bitmask[mask_index].leading_zeros() as u8;
            }
        }
        cmd.bit_count += 1;

        let staging = match cmd.operation {
            GpuOp::Add => &mut self.residuals_add,
            GpuOp::Set => &mut self.residuals_set,
            GpuOp::ClearAndSet => &mut self.residuals_clear_and_set,
            GpuOp::SetZero => return,
        };

        if dds {
            for &src_index in DDS_RESIDUAL_ORDER.iter() {
                staging.push(residuals[src_index]);
            }
        } else {
            staging.extend_from_slice(&residuals[..buffer.layer_count as usize]);
        }
    }

    /// Append one TU's operation at block-aligned index `tu_index`.
    ///
    /// `Add`, `Set` and `ClearAndSet` read `layer_count` residual values
    /// from `residuals`; `SetZero` ignores it. Commands merge into the
    /// current command for their operation while the block index is
    /// unchanged; residuals seen while a ClearAndSet block is open are
    /// absorbed into it.
    pub fn append(
        &mut self,
        buffer: &mut CmdBufferGpu,
        operation: GpuOp,
        residuals: &[i16],
        tu_index: u32,
        tu_raster_order: bool,
    ) -> Result<()> {
        assert!(buffer.layer_count > 0, "reset must be called before append");

        let dds = buffer.layer_count as usize == LAYER_COUNT_DDS;
        let block_shift = if !tu_raster_order && dds { 6 } else { 8 };
        let block_index = tu_index >> block_shift;

        if operation != GpuOp::ClearAndSet && self.building_clear_and_set {
            let clear_cmd = self
                .current_clear_and_set_cmd
                .expect("open ClearAndSet block without a command");
            if buffer.commands[clear_cmd].block_index == block_index {
                if operation != GpuOp::SetZero {
                    // Residuals inside a cleared block fold into the
                    // ClearAndSet command itself.
                    self.append_residuals(buffer, clear_cmd, residuals, tu_index, false);
                    return Ok(());
                }
            } else {
                self.building_clear_and_set = false;
            }
        }

        let current = match operation {
            GpuOp::Add => &mut self.current_add_cmd,
            GpuOp::Set => &mut self.current_set_cmd,
            GpuOp::SetZero => &mut self.current_set_zero_cmd,
            GpuOp::ClearAndSet => {
                self.building_clear_and_set = true;
                &mut self.current_clear_and_set_cmd
            }
        };

        match *current {
            Some(cmd_index) if buffer.commands[cmd_index].block_index == block_index => {
                if operation != GpuOp::ClearAndSet {
                    self.append_residuals(buffer, cmd_index, residuals, tu_index, tu_raster_order);
                }
            }
            _ => {
                let data_offset = match operation {
                    GpuOp::Add => self.residuals_add.len() as u32,
                    GpuOp::Set => self.residuals_set.len() as u32,
                    GpuOp::ClearAndSet => self.residuals_clear_and_set.len() as u32,
                    GpuOp::SetZero => 0,
                };

                let cmd_index = buffer.commands.len();
                buffer.commands.push(GpuCmd {
                    operation,
                    block_index,
                    data_offset,
                    bit_start: 0,
                    bit_count: 0,
                    bitmask: [0; 4],
                });
                *current = Some(cmd_index);

                if operation != GpuOp::ClearAndSet {
                    self.append_residuals(buffer, cmd_index, residuals, tu_index, tu_raster_order);
                }
            }
        }

        Ok(())
    }

    /// Flatten the staging buffers into the buffer's final residual array
    /// in the fixed order Add, Set, ClearAndSet, rewriting each command's
    /// data offset to point into it. In raster order only Add residuals
    /// exist and the rewrite is skipped.
    pub fn build(&mut self, buffer: &mut CmdBufferGpu, tu_raster_order: bool) -> Result<()> {
        let set_residuals_start = self.residuals_add.len() as u32;
        let clear_residuals_start = (self.residuals_add.len() + self.residuals_set.len()) as u32;

        buffer.residuals.clear();
        buffer.residuals.extend_from_slice(&self.residuals_add);

        if !tu_raster_order {
            buffer.residuals.extend_from_slice(&self.residuals_set);
            buffer
                .residuals
                .extend_from_slice(&self.residuals_clear_and_set);

            for cmd in buffer.commands.iter_mut() {
                match cmd.operation {
                    GpuOp::Add | GpuOp::SetZero => {}
                    GpuOp::Set => cmd.data_offset += set_residuals_start,
                    GpuOp::ClearAndSet => cmd.data_offset += clear_residuals_start,
                }
            }
        }

        Ok(())
    }
}
