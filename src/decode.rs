//! Enhancement decode orchestrator
//!
//! Drives entropy decode, dequantization and the inverse transform for one
//! (LOQ, plane, tile), appending the resulting residuals into a CPU or GPU
//! command buffer. Each call is independent: separate tiles may decode
//! concurrently as long as every call writes into its own buffer.
//!
//! The loop walks transform units in the encoder-chosen order, skipping the
//! common run of zero coefficients across all layers, consuming temporal
//! signal runs alongside, and expanding reduced-signalling Intra runs into
//! per-block clear commands.

use crate::cmdbuffer::{CmdBufferCpu, CmdBufferGpu, CmdBufferGpuBuilder, CpuCmd, GpuOp};
use crate::config::{
    tile_dimensions, tile_start, FrameConfig, GlobalConfig, LoqIndex, ScalingMode, TemporalSignal,
    TileDimensions, TransformType, MAX_LAYER_COUNT, MAX_PLANES,
};
use crate::dequant::calculate_dequant;
use crate::entropy::{EntropyDecoder, EntropyDecoderType};
use crate::error::{Error, Result};
use crate::transform::{transform_fn, Acceleration};
use crate::transform_unit::TuState;

/// Destination for decoded residuals: exactly one of the two command buffer
/// kinds. The GPU form carries its transient builder alongside.
pub enum CmdBufferTarget<'a> {
    Cpu(&'a mut CmdBufferCpu),
    Gpu(&'a mut CmdBufferGpu, &'a mut CmdBufferGpuBuilder),
}

/// Per-layer entropy decode for one transform unit.
///
/// Layers inside their zero run emit a zero coefficient; exhausted or
/// absent layers turn into one whole-surface zero run. Returns the bitmask
/// of non-zero coefficients and updates the common minimum zero run.
fn entropy_decode_all_layers(
    num_layers: usize,
    decoders: &mut Option<Vec<EntropyDecoder<'_>>>,
    tu_total: i32,
    zeros: &mut [i32; MAX_LAYER_COUNT],
    coeffs: &mut [i16; MAX_LAYER_COUNT],
    min_zero_count: &mut i32,
) -> Result<u32> {
    let mut nonzero_mask = 0u32;

    for layer in 0..num_layers {
        if zeros[layer] > 0 {
            zeros[layer] -= 1;
            coeffs[layer] = 0;
        } else if let Some(decoders) = decoders.as_mut() {
            match decoders[layer].decode()? {
                Some((coeff, run)) => {
                    coeffs[layer] = coeff;
                    zeros[layer] = run as i32;
                    nonzero_mask |= u32::from(coeff != 0) << layer;
                }
                None => {
                    coeffs[layer] = 0;
                    zeros[layer] = tu_total - 1;
                }
            }
        } else {
            // No decoder: skip over the whole surface.
            zeros[layer] = tu_total - 1;
            coeffs[layer] = 0;
        }

        if *min_zero_count > zeros[layer] {
            *min_zero_count = zeros[layer];
        }
    }

    Ok(nonzero_mask)
}

/// Scale the outer residuals of a DDS transform unit by the deblocking
/// coefficients.
///
/// Residual layer ordering as a grid:
/// ```text
/// [ 0  1  4  5  ]
/// [ 2  3  6  7  ]
/// [ 8  9  12 13 ]
/// [ 10 11 14 15 ]
/// ```
fn deblock_residuals(corner: u32, side: u32, residuals: &mut [i16; MAX_LAYER_COUNT]) {
    let corner_scale = |value: i16| ((corner * value as u32) >> 4) as i16;
    let side_scale = |value: i16| ((side * value as u32) >> 4) as i16;

    residuals[0] = corner_scale(residuals[0]);
    residuals[1] = side_scale(residuals[1]);
    residuals[4] = side_scale(residuals[4]);
    residuals[5] = corner_scale(residuals[5]);
    residuals[2] = side_scale(residuals[2]);
    residuals[7] = side_scale(residuals[7]);
    residuals[8] = side_scale(residuals[8]);
    residuals[13] = side_scale(residuals[13]);
    residuals[10] = corner_scale(residuals[10]);
    residuals[11] = side_scale(residuals[11]);
    residuals[14] = side_scale(residuals[14]);
    residuals[15] = corner_scale(residuals[15]);
}

/// Decode the enhancement data for one (LOQ, plane, tile) into `target`.
///
/// Validates the indices against the configuration before touching the
/// buffer. Aside from mutating the output buffer the decode is a pure
/// function of its inputs: a repeat call with a freshly reset buffer
/// produces byte-identical output.
pub fn decode_enhancement(
    global: &GlobalConfig,
    frame: &FrameConfig,
    loq: LoqIndex,
    plane_idx: usize,
    tile_idx: u32,
    target: CmdBufferTarget<'_>,
) -> Result<()> {
    if loq != LoqIndex::Loq0 && loq != LoqIndex::Loq1 {
        return Err(Error::invalid_input("Only LOQ0 and LOQ1 carry residuals"));
    }
    if plane_idx >= MAX_PLANES || tile_idx >= global.num_tiles[plane_idx][loq as usize] {
        return Err(Error::invalid_input(format!(
            "Invalid plane {} / tile {} for LOQ{}",
            plane_idx, tile_idx, loq as usize
        )));
    }

    if !frame.loq_enabled[loq as usize] || plane_idx > global.num_planes as usize {
        // Nothing to decode.
        return Ok(());
    }

    let mut target = target;

    let dequant = calculate_dequant(global, frame, plane_idx, loq);
    let temporal_enabled = global.temporal_enabled;
    let num_layers = global.num_layers as usize;
    let dds = global.transform == TransformType::Dds;
    let tu_width_shift = global.transform.tu_width_shift();
    let temporal_reduced_signalling = global.temporal_reduced_signalling_enabled;
    let scaling = if loq == LoqIndex::Loq0 {
        global.scaling_modes[LoqIndex::Loq0 as usize]
    } else {
        ScalingMode::Scale2D
    };
    let tu_raster_order = !temporal_enabled && global.tile_dimensions == TileDimensions::None;
    let version = global.bitstream_version;

    let chunks = frame.layer_chunks(global, plane_idx, loq, tile_idx)?;
    let temporal_chunk = if loq == LoqIndex::Loq0 {
        frame.temporal_chunk(global, plane_idx, tile_idx)?
    } else {
        None
    };

    let (width, height) = tile_dimensions(global, loq, plane_idx, tile_idx);
    let (start_x, start_y) = tile_start(global, loq, plane_idx, tile_idx);
    let tu_state = TuState::new(
        u32::from(width),
        u32::from(height),
        u32::from(start_x),
        u32::from(start_y),
        tu_width_shift,
    )?;
    let tu_total = tu_state.tu_total as i32;

    // Residual layer decoders, when this frame carries coefficient data.
    let mut residual_decoders: Option<Vec<EntropyDecoder<'_>>> = match chunks {
        Some(chunks) if frame.entropy_enabled => {
            let mut decoders = Vec::with_capacity(num_layers);
            for chunk in &chunks[..num_layers] {
                decoders.push(EntropyDecoder::new(
                    chunk,
                    frame.chunk_data(chunk),
                    EntropyDecoderType::Default,
                    version,
                )?);
            }
            Some(decoders)
        }
        _ => None,
    };

    let mut temporal_decoder = match temporal_chunk {
        Some(chunk) => Some(EntropyDecoder::new(
            chunk,
            frame.chunk_data(chunk),
            EntropyDecoderType::Temporal,
            version,
        )?),
        None => None,
    };
    let tile_has_temporal_decode = temporal_decoder.is_some();

    let transform = transform_fn(global.transform, scaling, Acceleration::Scalar);

    let mut coeffs = [0i16; MAX_LAYER_COUNT];
    let mut residuals = [0i16; MAX_LAYER_COUNT];
    let mut zeros = [0i32; MAX_LAYER_COUNT];
    let mut temporal_run = 0i32;
    let mut temporal = TemporalSignal::Inter;
    let mut tu_index = 0u32;
    let mut last_tu_index = 0u32;
    let mut clear_block_queue = 0i32;
    let mut clear_block_remainder = false;

    // Break once the tile is fully decoded.
    loop {
        let mut min_zero_count = i32::MAX;
        let nonzero_mask = entropy_decode_all_layers(
            num_layers,
            &mut residual_decoders,
            tu_total,
            &mut zeros,
            &mut coeffs,
            &mut min_zero_count,
        )?;

        let block_start = tu_state.is_block_start(tu_index);
        if clear_block_queue == 0 && tile_has_temporal_decode && temporal_enabled {
            if temporal_run <= 0 {
                match temporal_decoder.as_mut().unwrap().decode_temporal()? {
                    Some((signal, run)) => {
                        temporal = signal;
                        temporal_run = run as i32;
                    }
                    None => {
                        temporal = TemporalSignal::Inter;
                        temporal_run = tu_total;
                    }
                }
                clear_block_remainder = false;

                if temporal_run <= 0 {
                    return Err(Error::bitstream("Temporal run of zero length"));
                }
            }
            // The temporal run includes the current TU; the residual zero
            // runs do not. Normalize to "TUs after the current symbol".
            temporal_run -= 1;

            // Reduced signalling: an Intra run starting at a block start
            // means that many whole blocks get cleared. Convert the run
            // from blocks to the TU count those blocks span.
            if block_start && temporal == TemporalSignal::Intra && temporal_reduced_signalling {
                clear_block_queue = temporal_run + 1;
                temporal_run = 0;

                for _ in 0..clear_block_queue {
                    temporal_run +=
                        tu_state.block_tu_count(tu_index + temporal_run as u32) as i32;
                }
            }
        }

        let block_tu_count = tu_state.block_tu_count(tu_index) as i32;
        let mut cleared_block = false;

        // Emit the block clear when one is queued at a block start.
        if block_start && clear_block_queue > 0 {
            let block_aligned_index = tu_state.index_block_aligned(tu_index);
            match &mut target {
                CmdBufferTarget::Cpu(buffer) => {
                    buffer.append(CpuCmd::Clear, &[], block_aligned_index - last_tu_index)?;
                }
                CmdBufferTarget::Gpu(buffer, builder) => {
                    builder.append(buffer, GpuOp::ClearAndSet, &[], block_aligned_index, false)?;
                }
            }
            last_tu_index = block_aligned_index;

            cleared_block = true;
            clear_block_queue -= 1;
            if clear_block_queue == 0 {
                clear_block_remainder = true;
            }
        }

        // Apply only when the operation has side effects: non-zero
        // coefficients, or an Intra write outside a cleared block.
        if nonzero_mask != 0
            || (!cleared_block && (!temporal_enabled || temporal == TemporalSignal::Intra))
        {
            if nonzero_mask != 0 {
                // Dequantize here rather than in the layer decode: the
                // residual signal can be implied-Inter while the block
                // signal is Intra.
                let temporal_idx = temporal as usize;
                for layer in 0..num_layers {
                    let coeff = i32::from(coeffs[layer]);
                    if coeff > 0 {
                        coeffs[layer] = (coeff
                            * i32::from(dequant.step_width[temporal_idx][layer])
                            + i32::from(dequant.offset[temporal_idx][layer]))
                        .clamp(i32::from(i16::MIN), i32::from(i16::MAX))
                            as i16;
                    } else if coeff < 0 {
                        coeffs[layer] = (coeff
                            * i32::from(dequant.step_width[temporal_idx][layer])
                            - i32::from(dequant.offset[temporal_idx][layer]))
                        .clamp(i32::from(i16::MIN), i32::from(i16::MAX))
                            as i16;
                    }
                }

                transform(&coeffs[..num_layers], &mut residuals[..num_layers]);

                if loq == LoqIndex::Loq1 && dds && frame.deblock_enabled {
                    deblock_residuals(global.deblock.corner, global.deblock.side, &mut residuals);
                }
            } else {
                residuals[..num_layers].fill(0);
            }

            let current_index = if tu_raster_order {
                tu_index
            } else {
                tu_state.index_block_aligned(tu_index)
            };

            match &mut target {
                CmdBufferTarget::Cpu(buffer) => {
                    let command = if nonzero_mask == 0 && temporal == TemporalSignal::Intra {
                        CpuCmd::SetZero
                    } else if loq == LoqIndex::Loq0
                        && (temporal == TemporalSignal::Intra
                            || clear_block_queue > 0
                            || clear_block_remainder)
                    {
                        CpuCmd::Set
                    } else {
                        CpuCmd::Add
                    };
                    buffer.append(command, &residuals, current_index - last_tu_index)?;
                    last_tu_index = current_index;
                }
                CmdBufferTarget::Gpu(buffer, builder) => {
                    let operation = if nonzero_mask == 0 && temporal == TemporalSignal::Intra {
                        GpuOp::SetZero
                    } else if loq == LoqIndex::Loq0 && temporal == TemporalSignal::Intra {
                        GpuOp::Set
                    } else {
                        GpuOp::Add
                    };
                    builder.append(buffer, operation, &residuals, current_index, tu_raster_order)?;
                }
            }
        }

        // Find the next TU to jump to, keeping the temporal run accurate.
        // Without a temporal chunk (or at LOQ1) no special logic applies.
        if tile_has_temporal_decode {
            if cleared_block {
                // After a block clear, move to the next residual or the
                // start of the next block to clear.
                min_zero_count = min_zero_count.min(block_tu_count - 1);
                temporal_run -= min_zero_count + 1;
            } else if clear_block_queue > 0 {
                // An upcoming clear block or residual, whichever first.
                let next_block_start = if tu_index >= tu_state.max_whole_block_tu() {
                    block_tu_count
                        - ((tu_index - tu_state.max_whole_block_tu()) as i32 % block_tu_count)
                        - 1
                } else {
                    block_tu_count
                        - ((tu_index % tu_state.tu_per_row()) % tu_state.tu_per_block()) as i32
                        - 1
                };
                min_zero_count = min_zero_count.min(next_block_start);
                temporal_run -= min_zero_count + 1;
            } else if temporal == TemporalSignal::Inter
                || (clear_block_remainder && min_zero_count > temporal_run)
            {
                // Normal operation outside a clear block: move to the next
                // residual or the end of the temporal run.
                min_zero_count = min_zero_count.min(temporal_run);
                temporal_run -= min_zero_count;
            } else if !clear_block_remainder {
                // Always step one TU after an Intra TU.
                debug_assert_eq!(temporal, TemporalSignal::Intra);
                min_zero_count = 0;
            } else {
                // Residuals into the last block of a clear run: keep the
                // temporal run accurate and move to the next residual.
                temporal_run -= min_zero_count;
            }
        }

        tu_index += (min_zero_count + 1) as u32;

        if tu_index >= tu_state.tu_total {
            break;
        }

        if min_zero_count > 0 {
            for layer in 0..num_layers {
                zeros[layer] -= min_zero_count;
            }
        }
    }

    match target {
        CmdBufferTarget::Cpu(buffer) => {
            if !buffer.entry_points().is_empty() {
                buffer.split();
            }
        }
        CmdBufferTarget::Gpu(buffer, builder) => {
            builder.build(buffer, tu_raster_order)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Chroma, Chunk, LoqIndex, ScalingMode};

    /// A single-plane DD config over a 16x16 surface, one tile.
    fn test_global(temporal: bool) -> GlobalConfig {
        let mut global = GlobalConfig::default();
        global.initialized = true;
        global.width = 16;
        global.height = 16;
        global.num_planes = 1;
        global.chroma = Chroma::Monochrome;
        global.transform = TransformType::Dd;
        global.num_layers = 4;
        global.scaling_modes = [ScalingMode::Scale2D, ScalingMode::Scale0D];
        global.temporal_enabled = temporal;
        global.tile_width[0] = 16;
        global.tile_height[0] = 16;
        global.num_tiles[0] = [1, 1];
        global
    }

    /// A frame whose four layer chunks are RLE-only with the given bytes.
    fn rle_frame(global: &GlobalConfig, layer_data: &[Vec<u8>]) -> FrameConfig {
        let mut frame = FrameConfig::default();
        frame.entropy_enabled = true;
        frame.loq_enabled = [true, true];
        frame.step_widths = [100, 100];
        frame.dequant_offset = 0;
        frame.quant_matrix.set = true;

        let mut payload = Vec::new();
        for data in layer_data.iter().take(global.num_layers as usize) {
            frame.chunks.push(Chunk {
                offset: payload.len(),
                size: data.len(),
                rle_only: true,
                entropy_enabled: !data.is_empty(),
            });
            payload.extend_from_slice(data);
        }
        frame.payload = payload;
        frame
    }

    #[test]
    fn test_rejects_bad_indices() {
        let global = test_global(false);
        let frame = rle_frame(&global, &[vec![], vec![], vec![], vec![]]);
        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();

        assert!(decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq2,
            0,
            0,
            CmdBufferTarget::Cpu(&mut buffer)
        )
        .is_err());
        assert!(decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            3,
            0,
            CmdBufferTarget::Cpu(&mut buffer)
        )
        .is_err());
        assert!(decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            1,
            CmdBufferTarget::Cpu(&mut buffer)
        )
        .is_err());
    }

    #[test]
    fn test_disabled_loq_is_a_no_op() {
        let global = test_global(false);
        let mut frame = rle_frame(&global, &[vec![], vec![], vec![], vec![]]);
        frame.loq_enabled = [false, false];

        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Cpu(&mut buffer),
        )
        .unwrap();
        assert!(buffer.is_empty());
    }

    /// One coefficient at TU 0 in layer 0, then zeros to the end of the
    /// 64-TU surface.
    fn single_coeff_layers() -> Vec<Vec<u8>> {
        // LSB symbol 0xC6 -> value 3, run follows; run symbol 63 zeros.
        // Other layers: value 0 (symbol 0xC0) with the same run.
        vec![
            vec![0xC6, 63],
            vec![0xC0, 63],
            vec![0xC0, 63],
            vec![0xC0, 63],
        ]
    }

    #[test]
    fn test_decode_single_tu_into_cpu_buffer() {
        let global = test_global(false);
        let frame = rle_frame(&global, &single_coeff_layers());

        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Cpu(&mut buffer),
        )
        .unwrap();

        // One Add command at TU 0 carrying one DD residual payload.
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.commands(), &[0x00]);
        assert_eq!(buffer.residuals_size(), 8);

        // coeff 3 dequantizes to 3 * 100 = 300 (offset 0), and the DD
        // transform of [300, 0, 0, 0] is 300 everywhere.
        let stored: Vec<i16> = buffer
            .residuals()
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(stored, [300, 300, 300, 300]);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let global = test_global(false);
        let frame = rle_frame(&global, &single_coeff_layers());

        let mut first = CmdBufferCpu::new(0).unwrap();
        first.reset(4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Cpu(&mut first),
        )
        .unwrap();

        let mut second = CmdBufferCpu::new(0).unwrap();
        second.reset(4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Cpu(&mut second),
        )
        .unwrap();

        assert_eq!(first.commands(), second.commands());
        assert_eq!(first.residuals(), second.residuals());
    }

    #[test]
    fn test_decode_into_gpu_buffer() {
        let global = test_global(false);
        let frame = rle_frame(&global, &single_coeff_layers());

        let mut buffer = CmdBufferGpu::default();
        let mut builder = CmdBufferGpuBuilder::new();
        builder.reset(&mut buffer, 4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Gpu(&mut buffer, &mut builder),
        )
        .unwrap();

        assert_eq!(buffer.command_count(), 1);
        assert_eq!(buffer.commands()[0].operation, GpuOp::Add);
        assert_eq!(buffer.commands()[0].block_index, 0);
        assert_eq!(buffer.commands()[0].bit_count, 1);
        assert_eq!(buffer.residuals()[..4], [300, 300, 300, 300]);
    }

    #[test]
    fn test_temporal_intra_produces_set_commands() {
        let global = test_global(true);
        let mut frame = rle_frame(&global, &single_coeff_layers());
        frame.temporal_signalling_present = true;

        // Temporal chunk: initial state Intra, one 64-TU run.
        let temporal_data = vec![0x01, 64];
        let temporal_offset = frame.payload.len();
        frame.payload.extend_from_slice(&temporal_data);
        frame.tile_chunk_temporal_index[0] = frame.chunks.len() as u32;
        frame.chunks.push(Chunk {
            offset: temporal_offset,
            size: temporal_data.len(),
            rle_only: true,
            entropy_enabled: true,
        });

        let mut buffer = CmdBufferCpu::new(0).unwrap();
        buffer.reset(4).unwrap();
        decode_enhancement(
            &global,
            &frame,
            LoqIndex::Loq0,
            0,
            0,
            CmdBufferTarget::Cpu(&mut buffer),
        )
        .unwrap();

        // The non-zero TU becomes a Set (Intra at LOQ0); the remaining
        // Intra TUs with no coefficients become SetZero commands.
        assert!(buffer.count() > 1);
        let first_command = CpuCmd::from_byte(buffer.commands()[0]);
        assert_eq!(first_command, CpuCmd::Set);
        let second_command = CpuCmd::from_byte(buffer.commands()[1]);
        assert_eq!(second_command, CpuCmd::SetZero);
    }
}
