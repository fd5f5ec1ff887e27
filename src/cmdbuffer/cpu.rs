//! CPU command buffer
//!
//! A compact byte encoding of decoded residuals for the scalar apply stage.
//! One growing arena is written from both ends: commands and their jump
//! values grow forward from the start while residual payloads grow backward
//! from the end. The two regions share capacity, so a single
//! would-collide-then-grow check replaces independent reallocation
//! bookkeeping, and `reset` just repositions both cursors.
//!
//! Each command is one byte: a 2-bit command in the top bits and a 6-bit
//! jump (transform units since the previous command) below it. Jump values
//! of 62 and 63 escape to 2 and 3 little-endian extension bytes. `Add` and
//! `Set` commands store one residual payload of `layer_count` values at the
//! residual end of the arena.

use crate::config::{LAYER_COUNT_DD, LAYER_COUNT_DDS};
use crate::error::{Error, Result};

use super::DDS_RESIDUAL_ORDER;

/// The four CPU command kinds, stored in the top 2 bits of the first
/// command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuCmd {
    /// Saturating add of a residual to the existing buffer contents.
    Add = 0x00,
    /// Overwrite with a residual.
    Set = 0x40,
    /// Zero one transform unit; carries no payload.
    SetZero = 0x80,
    /// Zero an entire 32x32 block; only legal as the first command touching
    /// that block.
    Clear = 0xC0,
}

impl CpuCmd {
    /// Decode the command bits from the top of a command byte.
    pub fn from_byte(byte: u8) -> CpuCmd {
        match byte & 0xC0 {
            0x00 => CpuCmd::Add,
            0x40 => CpuCmd::Set,
            0x80 => CpuCmd::SetZero,
            _ => CpuCmd::Clear,
        }
    }
}

/// Largest jump that fits in the command byte itself.
const BIG_JUMP_SIGNAL: u32 = 62;
/// Jump signal escaping to a 3-byte extended jump.
const EXTRA_BIG_JUMP_SIGNAL: u32 = 63;
/// Largest jump representable with the 2-byte extension.
const EXTRA_BIG_JUMP: u32 = u16::MAX as u32;
/// Default initial arena capacity in bytes.
const INITIAL_CAPACITY: usize = 32_768;
/// Capacity multiplier when the cursors would collide.
const GROW_FACTOR: usize = 2;
/// Maximum number of entry points a buffer can be split into.
pub const MAX_ENTRY_POINTS: usize = 16;

/// A slice of the command buffer that an apply worker can start from
/// without re-scanning from the beginning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPoint {
    /// Number of commands in this slice.
    pub count: u32,
    /// Absolute position, in transform units, to resume from.
    pub initial_jump: u32,
    /// Byte offset into the command end of the arena.
    pub command_offset: i32,
    /// Byte offset into the residual end of the arena.
    pub data_offset: i32,
}

/// One growing byte arena holding commands from the front and residuals
/// from the back, plus the entry points computed by [`CmdBufferCpu::split`].
///
/// Owned by the caller across many decode calls: `reset` repositions the
/// cursors without freeing memory.
#[derive(Debug)]
pub struct CmdBufferCpu {
    data: Vec<u8>,
    /// Next command write offset, from the start of the arena.
    current_command: usize,
    /// Next residual write offset, growing down from the end of the arena.
    current_residual: usize,
    /// Number of commands appended since the last reset.
    count: u32,
    /// Residual values per payload: 4 for DD, 16 for DDS. Zero until the
    /// first reset.
    transform_size: u8,
    entry_points: Vec<EntryPoint>,
}

impl CmdBufferCpu {
    /// Create a buffer with the default capacity and `num_entry_points`
    /// split slots (0 disables splitting; at most [`MAX_ENTRY_POINTS`]).
    pub fn new(num_entry_points: u16) -> Result<Self> {
        if num_entry_points as usize > MAX_ENTRY_POINTS {
            return Err(Error::invalid_input(format!(
                "At most {} entry points supported",
                MAX_ENTRY_POINTS
            )));
        }

        Ok(CmdBufferCpu {
            data: vec![0; INITIAL_CAPACITY],
            current_command: 0,
            current_residual: INITIAL_CAPACITY,
            count: 0,
            transform_size: 0,
            entry_points: vec![EntryPoint::default(); num_entry_points as usize],
        })
    }

    /// Number of commands appended since the last reset.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// True if no commands have been appended since the last reset.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Residual values per payload the buffer was reset for.
    pub fn transform_size(&self) -> u8 {
        self.transform_size
    }

    /// The command bytes written so far.
    pub fn commands(&self) -> &[u8] {
        &self.data[..self.current_command]
    }

    /// The residual bytes written so far, newest first.
    pub fn residuals(&self) -> &[u8] {
        &self.data[self.current_residual..]
    }

    /// Size in bytes of the command region.
    pub fn commands_size(&self) -> usize {
        self.current_command
    }

    /// Size in bytes of the residual region.
    pub fn residuals_size(&self) -> usize {
        self.data.len() - self.current_residual
    }

    /// Total bytes in use.
    pub fn size(&self) -> usize {
        self.commands_size() + self.residuals_size()
    }

    /// The entry points computed by the last [`split`](Self::split).
    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    /// Reset to logically empty for a new tile, keeping the allocation.
    ///
    /// `transform_size` is the residual count per payload (4 for DD, 16 for
    /// DDS) and must match the values passed to subsequent appends.
    pub fn reset(&mut self, transform_size: u8) -> Result<()> {
        if transform_size as usize != LAYER_COUNT_DD && transform_size as usize != LAYER_COUNT_DDS {
            return Err(Error::invalid_input("Transform size must be 4 or 16"));
        }

        self.current_command = 0;
        self.current_residual = self.data.len();
        self.count = 0;
        self.transform_size = transform_size;
        Ok(())
    }

    /// Bytes one residual payload occupies.
    fn layer_size(&self) -> usize {
        self.transform_size as usize * 2
    }

    /// Grow the arena, preserving the command region in place and moving
    /// the residual region to the new end.
    fn grow(&mut self, new_capacity: usize) {
        let old_capacity = self.data.len();
        let residual_size = old_capacity - self.current_residual;

        self.data.resize(new_capacity, 0);
        self.data
            .copy_within(self.current_residual..old_capacity, new_capacity - residual_size);
        self.current_residual = new_capacity - residual_size;
    }

    /// Append a command at `jump` transform units past the previous one.
    ///
    /// `Add` and `Set` read `transform_size` residual values from `values`;
    /// the other commands ignore it. Grows the arena when the cursors would
    /// otherwise collide.
    pub fn append(&mut self, command: CpuCmd, values: &[i16], jump: u32) -> Result<()> {
        assert!(self.transform_size > 0, "reset must be called before append");
        debug_assert!(jump < 0x0100_0000);

        if jump < BIG_JUMP_SIGNAL {
            self.data[self.current_command] = command as u8 | jump as u8;
            self.current_command += 1;
        } else if jump < EXTRA_BIG_JUMP {
            self.data[self.current_command] = command as u8 | BIG_JUMP_SIGNAL as u8;
            self.data[self.current_command + 1] = (jump & 0xFF) as u8;
            self.data[self.current_command + 2] = ((jump >> 8) & 0xFF) as u8;
            self.current_command += 3;
        } else {
            self.data[self.current_command] = command as u8 | EXTRA_BIG_JUMP_SIGNAL as u8;
            self.data[self.current_command + 1] = (jump & 0xFF) as u8;
            self.data[self.current_command + 2] = ((jump >> 8) & 0xFF) as u8;
            self.data[self.current_command + 3] = ((jump >> 16) & 0xFF) as u8;
            self.current_command += 4;
        }

        let layer_size = self.layer_size();
        if command == CpuCmd::Add || command == CpuCmd::Set {
            debug_assert!(values.len() >= self.transform_size as usize);
            self.current_residual -= layer_size;

            let dst = &mut self.data[self.current_residual..self.current_residual + layer_size];
            if self.transform_size as usize == LAYER_COUNT_DDS {
                for (i, &src_index) in DDS_RESIDUAL_ORDER.iter().enumerate() {
                    dst[i * 2..i * 2 + 2].copy_from_slice(&values[src_index].to_le_bytes());
                }
            } else {
                for i in 0..LAYER_COUNT_DD {
                    dst[i * 2..i * 2 + 2].copy_from_slice(&values[i].to_le_bytes());
                }
            }
        }

        self.count += 1;

        // Keep room for the largest command plus one payload before the
        // cursors can meet.
        if self.current_residual - self.current_command < layer_size + 5 {
            self.grow(self.data.len() * GROW_FACTOR);
        }

        Ok(())
    }

    /// Compute entry points after the buffer is fully populated, splitting
    /// the commands into roughly equal-count slices that advance only at
    /// 32x32 block boundaries.
    pub fn split(&mut self) {
        let num_entry_points = self.entry_points.len();
        if num_entry_points == 0 {
            return;
        }

        let group_size = self.count / num_entry_points as u32;
        let block_shift = if self.transform_size as usize == LAYER_COUNT_DDS {
            6
        } else {
            8
        };
        let mut split_point = group_size;

        for entry in self.entry_points.iter_mut() {
            *entry = EntryPoint::default();
        }

        let mut data_offset = 0i32;
        let mut cmd_offset = 0usize;
        let mut tu_index = 0u32;
        let mut buffer_index = 0usize;
        let mut last_cmd_block = -1i64;
        let mut last_buffer_count = 0u32;

        let mut cmd_count = 0u32;
        while cmd_count < self.count {
            let command_byte = self.data[cmd_offset];
            let command = CpuCmd::from_byte(command_byte);
            let jump_signal = u32::from(command_byte & 0x3F);

            let (jump, cmd_increment) = if jump_signal < BIG_JUMP_SIGNAL {
                (jump_signal, 1)
            } else if jump_signal == BIG_JUMP_SIGNAL {
                (
                    u32::from(self.data[cmd_offset + 1])
                        + (u32::from(self.data[cmd_offset + 2]) << 8),
                    3,
                )
            } else {
                (
                    u32::from(self.data[cmd_offset + 1])
                        + (u32::from(self.data[cmd_offset + 2]) << 8)
                        + (u32::from(self.data[cmd_offset + 3]) << 16),
                    4,
                )
            };

            let current_block = i64::from((tu_index + jump) >> block_shift);
            if cmd_count > split_point
                && buffer_index < num_entry_points - 1
                && current_block != last_cmd_block
            {
                self.entry_points[buffer_index].count = cmd_count - last_buffer_count;
                buffer_index += 1;
                self.entry_points[buffer_index] = EntryPoint {
                    count: 0,
                    initial_jump: tu_index,
                    command_offset: cmd_offset as i32,
                    data_offset: data_offset * i32::from(self.transform_size) * 2,
                };
                split_point += group_size;
                last_buffer_count = cmd_count;
            }
            last_cmd_block = current_block;

            cmd_offset += cmd_increment;
            tu_index += jump;
            if command == CpuCmd::Set || command == CpuCmd::Add {
                data_offset += 1;
            }
            cmd_count += 1;
        }
        self.entry_points[buffer_index].count = cmd_count - last_buffer_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn residuals(len: usize, value: i16) -> Vec<i16> {
        vec![value; len]
    }

    #[test]
    fn test_append_small_jump_encoding() {
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();

        buffer.append(CpuCmd::Add, &residuals(4, 7), 5).unwrap();
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.commands(), &[0x00 | 5]);
        assert_eq!(buffer.residuals_size(), 8);

        buffer.append(CpuCmd::SetZero, &[], 3).unwrap();
        assert_eq!(buffer.commands(), &[0x05, 0x80 | 3]);
        // SetZero carries no payload.
        assert_eq!(buffer.residuals_size(), 8);
    }

    #[test]
    fn test_append_big_jump_encodings() {
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();

        // 62 escapes to the 2-byte form even though it fits in 6 bits.
        buffer.append(CpuCmd::SetZero, &[], 62).unwrap();
        assert_eq!(buffer.commands(), &[0x80 | 62, 62, 0]);

        buffer.reset(4).unwrap();
        buffer.append(CpuCmd::SetZero, &[], 0x1234).unwrap();
        assert_eq!(buffer.commands(), &[0x80 | 62, 0x34, 0x12]);

        buffer.reset(4).unwrap();
        buffer.append(CpuCmd::SetZero, &[], 0x0123_45).unwrap();
        assert_eq!(buffer.commands(), &[0x80 | 63, 0x45, 0x23, 0x01]);
    }

    #[test]
    fn test_dds_residuals_reordered_into_quads() {
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(16).unwrap();

        let values: Vec<i16> = (0..16).collect();
        buffer.append(CpuCmd::Set, &values, 0).unwrap();

        let stored: Vec<i16> = buffer
            .residuals()
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(stored, [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15]);
    }

    #[test]
    fn test_reset_is_idempotent_and_keeps_allocation() {
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(16).unwrap();
        buffer.append(CpuCmd::Add, &residuals(16, 1), 0).unwrap();
        assert!(!buffer.is_empty());

        let capacity = buffer.data.len();
        buffer.reset(16).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.data.len(), capacity);
    }

    #[test]
    fn test_growth_preserves_both_ends() {
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(16).unwrap();

        // Enough appends to force several doublings: each Add costs 1
        // command byte + 32 residual bytes against 32768 capacity.
        let total = 4000u32;
        for i in 0..total {
            buffer.append(CpuCmd::Add, &residuals(16, (i % 1000) as i16), 1).unwrap();
        }
        assert_eq!(buffer.count(), total);
        assert!(buffer.data.len() > INITIAL_CAPACITY);

        // Every command byte survived the relocations.
        for &byte in buffer.commands() {
            assert_eq!(byte, 0x01);
        }

        // Residuals are stored newest-first; the first-written payload sits
        // at the end of the arena.
        let residual_bytes = buffer.residuals();
        let last = &residual_bytes[residual_bytes.len() - 32..];
        for pair in last.chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 0);
        }
        let first = &residual_bytes[..32];
        for pair in first.chunks_exact(2) {
            assert_eq!(
                i16::from_le_bytes([pair[0], pair[1]]),
                ((total - 1) % 1000) as i16
            );
        }
    }

    #[test]
    fn test_split_entry_points() {
        let mut buffer = CmdBufferCpu::new(4).unwrap();
        buffer.reset(16).unwrap();

        // 256 commands, one per TU: 4 blocks of 64 TUs each.
        for _ in 0..256 {
            buffer.append(CpuCmd::Add, &residuals(16, 3), 1).unwrap();
        }
        buffer.split();

        let entries = buffer.entry_points().to_vec();
        assert_eq!(entries.len(), 4);
        let total: u32 = entries.iter().map(|e| e.count).sum();
        assert_eq!(total, 256);
        // Later entry points resume deeper into the buffer.
        assert_eq!(entries[0].command_offset, 0);
        assert!(entries[1].command_offset > 0);
        assert!(entries[1].initial_jump > 0);
        assert!(entries[2].initial_jump > entries[1].initial_jump);
        // Entry points only advance at block boundaries.
        for entry in &entries[1..] {
            assert_eq!((entry.initial_jump + 1) % 64, 0);
        }
    }

    #[test]
    fn test_too_many_entry_points_rejected() {
        assert!(CmdBufferCpu::new(17).is_err());
        assert!(CmdBufferCpu::new(16).is_ok());
    }
}
