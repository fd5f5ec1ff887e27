//! Payload configuration parser
//!
//! A frame payload is a sequence of blocks, each headed by one byte holding
//! a 3-bit size code (with a multi-byte escape) and a 5-bit block type.
//! Sequence and global config blocks update the per-sequence state, the
//! picture config block updates per-frame state, encoded-data blocks carry
//! the chunk table, and additional-info blocks carry SEI/VUI/S-Filter/HDR
//! side data.
//!
//! Parsing follows a copy-then-commit discipline: the caller hands in a
//! scratch copy of the current global config, and only a fully successful
//! parse makes the result visible (see [`super::pool`]). Frame fields that
//! are stateful (quant matrix, dither flag) must be pre-seeded from the
//! previous frame before calling [`configs_parse`], since the payload may
//! only signal a delta.

use tracing::{debug, warn};

use crate::bitstream::{BitReader, ByteStream};
use crate::config::chunks::{
    calculate_tile_chunk_indices, chunk_table_resize, parse_chunk, parse_chunk_flags,
    temporal_chunk_enabled, TiledRleDecoder, TiledSizeDecoder,
};
use crate::config::{
    hdr_flags, plane_dimensions, vui_flags, BitDepth, BitstreamVersion, Chroma, DitherType,
    FieldType, FrameConfig, GlobalConfig, Kernel, LoqIndex, NalType, PictureType, QuantMatrixMode,
    ScalingMode, SharpenType, TileCompressionSizePerTile, TileDimensions, TransformType,
    UpscaleType, UserDataMode, VuiVideoFormat, DEFAULT_DEBLOCK_COEFFICIENT, LOQ_ENHANCED_COUNT,
    MAX_STEP_WIDTH,
};
use crate::dequant::quant_matrix_set_default;
use crate::error::{Error, Result};

/// Standard-defined common resolutions (7.4.3.3, Table 20).
const RESOLUTIONS: [(u16, u16); 51] = [
    (0, 0),
    (360, 200),
    (400, 240),
    (480, 320),
    (640, 360),
    (640, 480),
    (768, 480),
    (800, 600),
    (852, 480),
    (854, 480),
    (856, 480),
    (960, 540),
    (960, 640),
    (1024, 576),
    (1024, 600),
    (1024, 768),
    (1152, 864),
    (1280, 720),
    (1280, 800),
    (1280, 1024),
    (1360, 768),
    (1366, 768),
    (1400, 1050),
    (1440, 900),
    (1600, 1200),
    (1680, 1050),
    (1920, 1080),
    (1920, 1200),
    (2048, 1080),
    (2048, 1152),
    (2048, 1536),
    (2160, 1440),
    (2560, 1440),
    (2560, 1600),
    (2560, 2048),
    (3200, 1800),
    (3200, 2048),
    (3200, 2400),
    (3440, 1440),
    (3840, 1600),
    (3840, 2160),
    (3840, 2400),
    (4096, 2160),
    (4096, 3072),
    (5120, 2880),
    (5120, 3200),
    (5120, 4096),
    (6400, 4096),
    (6400, 4800),
    (7680, 4320),
    (7680, 4800),
];

const RESOLUTION_CUSTOM: u8 = 63;

/// Standard-defined upscale kernels (8.7), indexed by [`UpscaleType`].
fn standard_kernel(upscale: UpscaleType) -> Kernel {
    fn kernel(forward: &[i16], reverse: &[i16], approximated_pa: bool) -> Kernel {
        let mut k = Kernel {
            coeffs: [[0; 8]; 2],
            length: forward.len() as u8,
            approximated_pa,
        };
        k.coeffs[0][..forward.len()].copy_from_slice(forward);
        k.coeffs[1][..reverse.len()].copy_from_slice(reverse);
        k
    }

    match upscale {
        UpscaleType::Nearest => kernel(&[16384, 0], &[0, 16384], false),
        UpscaleType::Linear => kernel(&[12288, 4096], &[4096, 12288], false),
        UpscaleType::Cubic => kernel(
            &[-1382, 14285, 3942, -461],
            &[-461, 3942, 14285, -1382],
            false,
        ),
        UpscaleType::ModifiedCubic => kernel(
            &[-2360, 15855, 4165, -1276],
            &[-1276, 4165, 15855, -2360],
            false,
        ),
        UpscaleType::Lanczos => kernel(
            &[493, -2183, 14627, 4440, -1114, 121],
            &[121, -1114, 4440, 14627, -2183, 493],
            false,
        ),
        UpscaleType::CubicPrediction => kernel(
            &[231, -2662, 16384, 2662, -231, 0],
            &[0, -231, 2662, 16384, -2662, 231],
            true,
        ),
        UpscaleType::Mishus => kernel(
            &[-2048, 16384, 2048, 0],
            &[0, 2048, 16384, -2048],
            true,
        ),
        UpscaleType::AdaptiveCubic
        | UpscaleType::Reserved1
        | UpscaleType::Reserved2
        | UpscaleType::Unspecified => Kernel::default(),
    }
}

const VUI_ASPECT_RATIO_IDC_EXTENDED_SAR: u8 = 255;
const MAX_CONFORMANCE_WINDOW_VALUE: u64 = (1 << 16) - 1;

/// The registered ITU T.35 code designating SEI payloads that carry the
/// bitstream version (UK country code plus manufacturer code).
const REGISTERED_ITU_CODE: [u8; 4] = [0xB4, 0x00, 0x50, 0x00];

/// SEI payload types handled by the parser (D.2).
const SEI_MASTERING_DISPLAY_COLOUR_VOLUME: u8 = 1;
const SEI_CONTENT_LIGHT_LEVEL_INFO: u8 = 2;
const SEI_USER_DATA_REGISTERED: u8 = 4;

/// Additional-info block types (7.3.10).
const AI_SEI: u8 = 0;
const AI_VUI: u8 = 1;
const AI_SFILTER: u8 = 23;
const AI_HDR: u8 = 25;

/// Block types (7.3.2).
const BT_SEQUENCE_CONFIG: u8 = 0;
const BT_GLOBAL_CONFIG: u8 = 1;
const BT_PICTURE_CONFIG: u8 = 2;
const BT_ENCODED_DATA: u8 = 3;
const BT_ENCODED_DATA_TILED: u8 = 4;
const BT_ADDITIONAL_INFO: u8 = 5;
const BT_FILLER: u8 = 6;

fn parse_conformance_value(stream: &mut ByteStream<'_>) -> Result<u16> {
    let value = stream.read_multi_byte()?;
    if value > MAX_CONFORMANCE_WINDOW_VALUE {
        return Err(Error::invalid_input("Conformance window value out of range"));
    }
    Ok(value as u16)
}

fn check_depth_config(global: &GlobalConfig) -> Result<()> {
    // Only promoting base depth to enhancement depth is supported.
    if global.enhanced_depth < global.base_depth {
        return Err(Error::unsupported(
            "Enhancement depth below base depth is unsupported",
        ));
    }
    Ok(())
}

fn validate_resolution(global: &GlobalConfig) -> Result<()> {
    let scaling = global.scaling_modes[LoqIndex::Loq0 as usize];
    let chroma = global.chroma;

    // Monochrome should always signal a single plane; this is a safety net.
    let with_chroma = global.num_planes > 1 && chroma != Chroma::Monochrome;
    let transform_alignment: u16 = if global.transform == TransformType::Dd {
        2
    } else {
        4
    };

    let hori_scaling: u16 = if scaling != ScalingMode::Scale0D { 2 } else { 1 };
    let vert_scaling: u16 = if scaling == ScalingMode::Scale2D { 2 } else { 1 };
    let hori_chroma: u16 = if with_chroma && chroma != Chroma::C444 { 2 } else { 1 };
    let vert_chroma: u16 = if with_chroma && chroma == Chroma::C420 { 2 } else { 1 };

    let hori_alignment = transform_alignment * hori_scaling * hori_chroma;
    let vert_alignment = transform_alignment * vert_scaling * vert_chroma;

    // Alignments are powers of two.
    if global.width & (hori_alignment - 1) != 0 || global.height & (vert_alignment - 1) != 0 {
        return Err(Error::invalid_input(
            "Resolution must cover whole transforms at every scale",
        ));
    }

    Ok(())
}

/// Tile dimensions for the fixed tiling layouts.
fn tile_dimensions_from_type(tiling: TileDimensions) -> Result<(u16, u16)> {
    match tiling {
        TileDimensions::Tile512x256 => Ok((512, 256)),
        TileDimensions::Tile1024x512 => Ok((1024, 512)),
        TileDimensions::None | TileDimensions::Custom => {
            Err(Error::invalid_input("Tiling type carries no dimensions"))
        }
    }
}

/// Propagate plane-0 tile dimensions to the chroma planes so every plane
/// ends up with the same number of tiles regardless of subsampling.
fn calculate_tile_plane_dimensions(global: &mut GlobalConfig) {
    let (hshift, vshift) = match global.chroma {
        Chroma::C420 => (1u16, 1u16),
        Chroma::C422 => (1, 0),
        Chroma::Monochrome | Chroma::C444 => (0, 0),
    };

    let width = (global.tile_width[0] + hshift) >> hshift;
    let height = (global.tile_height[0] + vshift) >> vshift;
    global.tile_width[1] = width;
    global.tile_width[2] = width;
    global.tile_height[1] = height;
    global.tile_height[2] = height;
}

/// Count whole and partial tiles for each plane and LOQ.
fn calculate_tile_counts(global: &mut GlobalConfig) -> Result<()> {
    let tu_size = global.transform.tu_size() as u16;

    for plane in 0..global.num_planes as usize {
        if global.tile_width[plane] % tu_size != 0 || global.tile_height[plane] % tu_size != 0 {
            return Err(Error::invalid_input(
                "Tile dimensions must be divisible by the transform size",
            ));
        }

        for loq in 0..LOQ_ENHANCED_COUNT {
            let loq_index = if loq == 0 { LoqIndex::Loq0 } else { LoqIndex::Loq1 };
            let (loq_width, loq_height) = plane_dimensions(global, loq_index, plane);

            let tiles_across =
                u32::from((loq_width + global.tile_width[plane] - 1) / global.tile_width[plane]);
            let tiles_down =
                u32::from((loq_height + global.tile_height[plane] - 1) / global.tile_height[plane]);

            global.num_tiles[plane][loq] = tiles_across * tiles_down;

            // All planes at a given LOQ must have the same tile count.
            if plane > 1 && global.num_tiles[plane][loq] != global.num_tiles[0][loq] {
                return Err(Error::invalid_input(
                    "Planes disagree on tile counts",
                ));
            }
        }
    }

    Ok(())
}

/// Sequence config block (7.3.4, Table 8): profile/level plus the
/// conformance window.
fn parse_block_sequence_config(
    stream: &mut ByteStream<'_>,
    global: &mut GlobalConfig,
) -> Result<()> {
    let data = stream.read_u8()?;

    /* profile_idc: 4 bits, level_idc: 4 bits */
    let profile = (data >> 4) & 0x0F;
    let level = data & 0x0F;

    let data = stream.read_u8()?;

    /* sublevel_idc: 2 bits
     * conformance_window_flag: 1 bit */
    global.crop_enabled = (data >> 5) & 0x01 != 0;

    /* extended profile/level byte */
    if profile == 15 || level == 15 {
        stream.read_u8()?;
    }

    if global.crop_enabled {
        global.crop.left = parse_conformance_value(stream)?;
        global.crop.right = parse_conformance_value(stream)?;
        global.crop.top = parse_conformance_value(stream)?;
        global.crop.bottom = parse_conformance_value(stream)?;
    }

    Ok(())
}

fn set_user_data_config(global: &mut GlobalConfig, mode: UserDataMode) {
    global.user_data = Default::default();

    if mode != UserDataMode::None {
        global.user_data.enabled = true;
        global.user_data.layer_index = if global.transform == TransformType::Dds {
            5
        } else {
            1
        };
        global.user_data.shift = if mode == UserDataMode::With2Bits { 2 } else { 6 };
    }
}

/// Settle fields that depend on more than one parsed value: the implicit
/// single tile when tiling is off, and the chroma-scaled conformance
/// window.
fn post_parse_global_config(global: &mut GlobalConfig) -> Result<()> {
    // With tiling disabled there is one tile the size of the surface. This
    // cannot be done while parsing tiling data: the bitstream orders normal
    // resolution, then tiling, then custom resolution.
    if global.tile_dimensions == TileDimensions::None {
        global.tile_width[0] = global.width;
        global.tile_height[0] = global.height;
    }

    if global.crop_enabled {
        let shift_w = u16::from(global.chroma == Chroma::C420 || global.chroma == Chroma::C422);
        let shift_h = u16::from(global.chroma == Chroma::C420);

        global.crop.left <<= shift_w;
        global.crop.right <<= shift_w;
        global.crop.top <<= shift_h;
        global.crop.bottom <<= shift_h;

        if global.crop.left + global.crop.right >= global.width {
            return Err(Error::invalid_input(
                "Conformance window wider than the decode width",
            ));
        }
        if global.crop.top + global.crop.bottom >= global.height {
            return Err(Error::invalid_input(
                "Conformance window taller than the decode height",
            ));
        }
    }

    Ok(())
}

fn parse_num_planes(stream: &mut ByteStream<'_>, plane_mode_flag: bool) -> Result<u8> {
    if !plane_mode_flag {
        return Ok(1);
    }

    /* plane_type: 4 bits, reserved: 4 bits */
    let data = stream.read_u8()?;
    match (data >> 4) & 0x0F {
        0 => Ok(1),
        1 => Ok(3),
        other => Err(Error::invalid_input(format!(
            "Unrecognized plane type {}",
            other
        ))),
    }
}

/// Tiling fields of the global config block (7.3.5, from
/// `tile_dimensions_type > 0`).
fn parse_global_config_tiles(stream: &mut ByteStream<'_>, global: &mut GlobalConfig) -> Result<()> {
    if global.tile_dimensions == TileDimensions::None {
        // Handled in post_parse_global_config.
        return Ok(());
    }

    if global.tile_dimensions == TileDimensions::Custom {
        global.tile_width[0] = stream.read_u16()?;
        global.tile_height[0] = stream.read_u16()?;
    } else {
        let (width, height) = tile_dimensions_from_type(global.tile_dimensions)?;
        global.tile_width[0] = width;
        global.tile_height[0] = height;
    }

    /* reserved: 5 bits
     * compression_type_entropy_enabled_per_tile_flag: 1 bit
     * compression_type_size_per_tile: 2 bits */
    let data = stream.read_u8()?;
    global.per_tile_compression_enabled = (data >> 2) & 0x01 != 0;
    global.tile_size_compression = match data & 0x03 {
        0 => TileCompressionSizePerTile::None,
        1 => TileCompressionSizePerTile::Prefix,
        2 => TileCompressionSizePerTile::PrefixOnDiff,
        other => {
            return Err(Error::invalid_input(format!(
                "Invalid tile size compression {}",
                other
            )))
        }
    };

    Ok(())
}

/// Global config block (7.3.5, Table 9 & 7.4.3.3). Occurs once per IDR.
fn parse_block_global_config(stream: &mut ByteStream<'_>, global: &mut GlobalConfig) -> Result<()> {
    if !global.bitstream_version_set {
        // The registered SEI payload always precedes the global config when
        // a version is signalled; with none seen the version is pinned to
        // current from here on.
        global.bitstream_version_set = true;
        global.bitstream_version = BitstreamVersion::CURRENT;
    }

    let data = stream.read_u8()?;

    /* plane_mode_flag: 1 bit */
    let plane_mode_flag = (data >> 7) & 0x01 != 0;

    /* resolution_type: 6 bits */
    let res_type = (data >> 1) & 0x3F;
    if res_type > 0 && (res_type as usize) < RESOLUTIONS.len() {
        let (width, height) = RESOLUTIONS[res_type as usize];
        global.width = width;
        global.height = height;
    } else if res_type != RESOLUTION_CUSTOM {
        return Err(Error::invalid_input(format!(
            "Unsupported resolution type {}",
            res_type
        )));
    }

    /* transform_type: 1 bit */
    global.transform = if data & 0x01 != 0 {
        TransformType::Dds
    } else {
        TransformType::Dd
    };
    global.num_layers = global.transform.layer_count() as u8;

    let data = stream.read_u8()?;

    /* chroma_sampling_type: 2 bits */
    global.chroma = match (data >> 6) & 0x03 {
        0 => Chroma::Monochrome,
        1 => Chroma::C420,
        2 => Chroma::C422,
        _ => Chroma::C444,
    };

    /* base_depth_type: 2 bits, enhancement_depth_type: 2 bits */
    global.base_depth = BitDepth::from_raw((data >> 4) & 0x03)?;
    global.enhanced_depth = BitDepth::from_raw((data >> 2) & 0x03)?;

    /* temporal_step_width_modifier_signalled_flag: 1 bit */
    let use_temporal_step_width_modifier = (data >> 1) & 0x01 != 0;

    /* predicted_residual_mode_flag: 1 bit */
    global.predicted_average_enabled = data & 0x01 != 0;

    let data = stream.read_u8()?;

    /* temporal_tile_intra_signalling_enabled_flag: 1 bit */
    global.temporal_reduced_signalling_enabled = (data >> 7) & 0x01 != 0;

    /* temporal_enabled_flag: 1 bit */
    global.temporal_enabled = (data >> 6) & 0x01 != 0;

    /* upsample_type: 3 bits */
    let upsample = match (data >> 3) & 0x07 {
        0 => UpscaleType::Nearest,
        1 => UpscaleType::Linear,
        2 => UpscaleType::Cubic,
        3 => UpscaleType::ModifiedCubic,
        4 => UpscaleType::AdaptiveCubic,
        other => {
            return Err(Error::invalid_input(format!(
                "Unrecognized upscale type {}",
                other
            )))
        }
    };
    global.upscale = upsample;

    /* level1_filtering_signalled_flag: 1 bit */
    let deblocking_signalled = (data >> 2) & 0x01 != 0;

    /* scaling_mode_level1: 2 bits */
    global.scaling_modes[LoqIndex::Loq1 as usize] = parse_scaling_mode(data & 0x03)?;

    let data = stream.read_u8()?;

    /* scaling_mode_level2: 2 bits */
    global.scaling_modes[LoqIndex::Loq0 as usize] = parse_scaling_mode((data >> 6) & 0x03)?;

    /* tile_dimensions_type: 2 bits */
    global.tile_dimensions = match (data >> 4) & 0x03 {
        0 => TileDimensions::None,
        1 => TileDimensions::Tile512x256,
        2 => TileDimensions::Tile1024x512,
        _ => TileDimensions::Custom,
    };

    /* user_data_enabled: 2 bits */
    let user_data_mode = match (data >> 2) & 0x03 {
        0 => UserDataMode::None,
        1 => UserDataMode::With2Bits,
        2 => UserDataMode::With6Bits,
        other => {
            return Err(Error::invalid_input(format!(
                "Invalid user data mode {}",
                other
            )))
        }
    };
    set_user_data_config(global, user_data_mode);

    /* level1_depth_flag: 1 bit */
    global.loq1_use_enhanced_depth = (data >> 1) & 0x01 != 0;

    /* chroma_step_width_flag: 1 bit */
    let chroma_step_width_flag = data & 0x01 != 0;

    check_depth_config(global)?;

    global.num_planes = parse_num_planes(stream, plane_mode_flag)?;

    /* temporal_step_width_modifier: 8 bits; the default is already set. */
    if use_temporal_step_width_modifier {
        global.temporal_step_width_modifier = stream.read_u8()?;
    }

    if upsample == UpscaleType::AdaptiveCubic {
        /* adaptive kernel coefficients (8.6.7): 4 x 16 bits */
        const KERNEL_SIZE: usize = 4;
        global.kernel = Kernel {
            coeffs: [[0; 8]; 2],
            length: KERNEL_SIZE as u8,
            approximated_pa: false,
        };

        for i in 0..KERNEL_SIZE {
            // First and last coefficients are negative.
            let multiplier: i32 = if i % 3 == 0 { -1 } else { 1 };
            let coeff = stream.read_u16()?;
            let value = (multiplier * i32::from(coeff)) as i16;
            global.kernel.coeffs[0][i] = value;
            global.kernel.coeffs[1][KERNEL_SIZE - 1 - i] = value;
        }
    } else {
        global.kernel = standard_kernel(upsample);
    }

    if deblocking_signalled {
        /* level1_filtering_first_coefficient: 4 bits
         * level1_filtering_second_coefficient: 4 bits */
        let data = stream.read_u8()?;
        global.deblock.corner = 16 - u32::from((data >> 4) & 0x0F);
        global.deblock.side = 16 - u32::from(data & 0x0F);
    } else {
        global.deblock.corner = DEFAULT_DEBLOCK_COEFFICIENT;
        global.deblock.side = DEFAULT_DEBLOCK_COEFFICIENT;
    }

    parse_global_config_tiles(stream, global)?;

    if res_type == RESOLUTION_CUSTOM {
        global.width = stream.read_u16()?;
        global.height = stream.read_u16()?;
    }

    /* chroma_step_width_multiplier: 8 bits; the default is already set. */
    if chroma_step_width_flag {
        global.chroma_step_width_multiplier = stream.read_u8()?;
    }

    validate_resolution(global)?;
    post_parse_global_config(global)?;
    calculate_tile_plane_dimensions(global);
    calculate_tile_counts(global)?;

    global.initialized = true;

    debug!(
        width = global.width,
        height = global.height,
        planes = global.num_planes,
        transform = ?global.transform,
        temporal = global.temporal_enabled,
        "Parsed global config"
    );

    Ok(())
}

fn parse_scaling_mode(raw: u8) -> Result<ScalingMode> {
    match raw {
        0 => Ok(ScalingMode::Scale0D),
        1 => Ok(ScalingMode::Scale1D),
        2 => Ok(ScalingMode::Scale2D),
        other => Err(Error::invalid_input(format!(
            "Invalid scaling mode {}",
            other
        ))),
    }
}

fn parse_quant_matrix_values(
    stream: &mut ByteStream<'_>,
    loq: LoqIndex,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    for layer in 0..global.num_layers as usize {
        frame.quant_matrix.values[loq as usize][layer] = stream.read_u8()?;
    }
    Ok(())
}

fn parse_quant_matrix_loq0(
    stream: &mut ByteStream<'_>,
    mode: QuantMatrixMode,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    match mode {
        QuantMatrixMode::CustomLoq1 | QuantMatrixMode::UsePrevious => {
            if frame.nal_type == NalType::Idr || !frame.quant_matrix.set {
                quant_matrix_set_default(
                    &mut frame.quant_matrix,
                    global.scaling_modes[LoqIndex::Loq0 as usize],
                    global.transform,
                    LoqIndex::Loq0,
                );
            }
            Ok(())
        }
        QuantMatrixMode::UseDefault => {
            quant_matrix_set_default(
                &mut frame.quant_matrix,
                global.scaling_modes[LoqIndex::Loq0 as usize],
                global.transform,
                LoqIndex::Loq0,
            );
            Ok(())
        }
        QuantMatrixMode::CustomLoq0
        | QuantMatrixMode::CustomBoth
        | QuantMatrixMode::CustomBothUnique => {
            parse_quant_matrix_values(stream, LoqIndex::Loq0, frame, global)
        }
    }
}

fn parse_quant_matrix_loq1(
    stream: &mut ByteStream<'_>,
    mode: QuantMatrixMode,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    match mode {
        QuantMatrixMode::CustomLoq0 | QuantMatrixMode::UsePrevious => {
            if frame.nal_type == NalType::Idr || !frame.quant_matrix.set {
                quant_matrix_set_default(
                    &mut frame.quant_matrix,
                    global.scaling_modes[LoqIndex::Loq0 as usize],
                    global.transform,
                    LoqIndex::Loq1,
                );
            }
            Ok(())
        }
        QuantMatrixMode::UseDefault => {
            // The LOQ0 scaling mode still selects the default table here.
            quant_matrix_set_default(
                &mut frame.quant_matrix,
                global.scaling_modes[LoqIndex::Loq0 as usize],
                global.transform,
                LoqIndex::Loq1,
            );
            Ok(())
        }
        QuantMatrixMode::CustomLoq1 | QuantMatrixMode::CustomBothUnique => {
            parse_quant_matrix_values(stream, LoqIndex::Loq1, frame, global)
        }
        QuantMatrixMode::CustomBoth => {
            let loq0 = frame.quant_matrix.values[LoqIndex::Loq0 as usize];
            frame.quant_matrix.values[LoqIndex::Loq1 as usize] = loq0;
            Ok(())
        }
    }
}

/// Picture config fields outside the no-enhancement test (7.3.6, Table 10).
fn parse_picture_config_misc(
    stream: &mut ByteStream<'_>,
    mode: QuantMatrixMode,
    step_width_loq1_enabled: bool,
    dequant_offset_enabled: bool,
    dither_control_present: bool,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    if frame.picture_type == PictureType::Field {
        /* field_type: 1 bit, reserved: 7 bits */
        let data = stream.read_u8()?;
        frame.field_type = if (data >> 7) & 0x01 != 0 {
            FieldType::Bottom
        } else {
            FieldType::Top
        };
    }

    if step_width_loq1_enabled {
        /* step_width_sublayer1: 15 bits
         * level1_filtering_enabled_flag: 1 bit */
        let data = stream.read_u16()?;
        frame.step_widths[LoqIndex::Loq1 as usize] = i32::from((data >> 1) & 0x7FFF);
        frame.deblock_enabled = data & 0x0001 != 0;
    } else {
        frame.step_widths[LoqIndex::Loq1 as usize] = MAX_STEP_WIDTH;
    }

    parse_quant_matrix_loq0(stream, mode, frame, global)?;
    parse_quant_matrix_loq1(stream, mode, frame, global)?;
    frame.quant_matrix.set = true;

    if dequant_offset_enabled {
        /* dequant_offset_mode_flag: 1 bit
         * dequant_offset: 7 bits */
        let data = stream.read_u8()?;
        frame.dequant_offset_mode = if (data >> 7) & 0x01 != 0 {
            crate::config::DequantOffsetMode::ConstOffset
        } else {
            crate::config::DequantOffsetMode::Default
        };
        frame.dequant_offset = i32::from(data & 0x7F);
    } else {
        frame.dequant_offset = -1;
    }

    let dithering_enabled = if global.bitstream_version >= BitstreamVersion::AlignWithSpec {
        if !dither_control_present && frame.nal_type == NalType::Idr {
            // 7.4.3.4: absent flag on an IDR frame disables dithering.
            frame.dither_enabled = false;
        }
        frame.dither_enabled
    } else {
        // Older streams sent the dither control flag on every frame with
        // dithering enabled.
        dither_control_present && frame.dither_enabled
    };

    if dithering_enabled {
        /* dithering_type: 2 bits, reserved_zero: 1 bit */
        let data = stream.read_u8()?;
        frame.dither_type = if (data >> 6) & 0x03 != 0 {
            DitherType::Uniform
        } else {
            DitherType::None
        };

        if frame.dither_type != DitherType::None {
            /* dithering_strength: 5 bits */
            frame.dither_strength = data & 0x1F;
        }
    }

    Ok(())
}

/// Picture config block (7.3.6, Table 10 & 7.4.3.4).
fn parse_block_picture_config(
    stream: &mut ByteStream<'_>,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    /* no_enhancement_bit_flag: 1 bit; inverted into "enabled". */
    let data = stream.read_u8()?;
    frame.entropy_enabled = data & 0x80 == 0;

    let mut mode = QuantMatrixMode::UsePrevious; /* default, 7.4.3.4 */
    let mut step_width_loq1_enabled = false;
    let mut dequant_offset_enabled = false;
    let mut dither_control_present = false;

    if frame.entropy_enabled {
        /* quant_matrix_mode: 3 bits */
        mode = QuantMatrixMode::from_raw((data >> 4) & 0x07)?;

        /* dequant_offset_signalled_flag: 1 bit */
        dequant_offset_enabled = (data >> 3) & 0x01 != 0;

        /* picture_type_bit_flag: 1 bit */
        frame.picture_type = if (data >> 2) & 0x01 != 0 {
            PictureType::Field
        } else {
            PictureType::Frame
        };

        /* temporal_refresh_bit_flag: 1 bit */
        frame.temporal_refresh = (data >> 1) & 0x01 != 0;

        /* temporal_signalling_present is inferred rather than read here */
        frame.temporal_signalling_present = global.temporal_enabled && !frame.temporal_refresh;

        /* step_width_sublayer1_enabled_flag: 1 bit */
        step_width_loq1_enabled = data & 0x01 != 0;

        /* step_width_sublayer2: 15 bits
         * dithering_control_flag: 1 bit */
        let data = stream.read_u16()?;
        frame.step_widths[LoqIndex::Loq0 as usize] = i32::from((data >> 1) & 0x7FFF);
        dither_control_present = true;
        frame.dither_enabled = data & 0x0001 != 0;
    } else {
        /* reserved: 4 bits */

        /* picture_type_bit_flag: 1 bit */
        frame.picture_type = if (data >> 2) & 0x01 != 0 {
            PictureType::Field
        } else {
            PictureType::Frame
        };

        /* temporal_refresh_bit_flag: 1 bit */
        frame.temporal_refresh = (data >> 1) & 0x01 != 0;

        /* temporal_signalling_present_flag: 1 bit */
        frame.temporal_signalling_present = data & 0x01 != 0;

        if frame.global_config_set {
            // Same dither reset as with enhancement enabled, except the
            // control flag is implicitly unsignalled.
            frame.dither_type = DitherType::None;
            frame.dither_strength = 0;
        }
    }

    // Older streams only sent this data when enhancement was enabled.
    if global.bitstream_version >= BitstreamVersion::AlignWithSpec || frame.entropy_enabled {
        parse_picture_config_misc(
            stream,
            mode,
            step_width_loq1_enabled,
            dequant_offset_enabled,
            dither_control_present,
            frame,
            global,
        )?;
    }

    frame.frame_config_set = true;

    Ok(())
}

/// Untiled encoded data block: chunk flags then chunk payloads, LOQ1 first.
fn parse_encoded_data(
    stream: &mut ByteStream<'_>,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    if !global.initialized {
        return Err(Error::invalid_state("No global config block received yet"));
    }
    if !frame.frame_config_set {
        return Err(Error::invalid_state("No picture config block received yet"));
    }

    calculate_tile_chunk_indices(frame, global);
    chunk_table_resize(frame, global);

    // Chunk enabled & RLE-only flag bits, two per chunk.
    let mut flag_reader = BitReader::new(stream.remaining_slice())?;
    for plane in 0..global.num_planes as usize {
        if frame.entropy_enabled {
            for loq in [LoqIndex::Loq1, LoqIndex::Loq0] {
                let start = frame.layer_chunk_index(global, loq, plane, 0, 0);
                let end = start + global.num_layers as usize;
                parse_chunk_flags(&mut flag_reader, &mut frame.chunks[start..end])?;
            }
        }

        if temporal_chunk_enabled(frame, global) {
            let index = frame.tile_chunk_temporal_index[plane] as usize;
            parse_chunk_flags(&mut flag_reader, &mut frame.chunks[index..index + 1])?;
        }
    }

    // Byte-align the bytestream past the flag bits.
    stream.seek(flag_reader.consumed_bytes())?;

    // Chunk payloads.
    for plane in 0..global.num_planes as usize {
        if frame.entropy_enabled {
            for loq in [LoqIndex::Loq1, LoqIndex::Loq0] {
                let start = frame.layer_chunk_index(global, loq, plane, 0, 0);
                for layer in 0..global.num_layers as usize {
                    let mut chunk = frame.chunks[start + layer];
                    parse_chunk(
                        stream,
                        &mut chunk,
                        Some(&mut frame.loq_enabled[loq as usize]),
                        None,
                    )?;
                    frame.chunks[start + layer] = chunk;
                }
            }
        }

        if temporal_chunk_enabled(frame, global) {
            let index = frame.tile_chunk_temporal_index[plane] as usize;
            let mut chunk = frame.chunks[index];
            parse_chunk(
                stream,
                &mut chunk,
                Some(&mut frame.loq_enabled[LoqIndex::Loq0 as usize]),
                None,
            )?;
            frame.chunks[index] = chunk;
        }
    }

    Ok(())
}

/// One per-tile entropy-enabled flag, from whichever compression the
/// stream selected.
fn read_enabled_flag<'a>(
    stream: &mut ByteStream<'a>,
    rle: &mut Option<TiledRleDecoder>,
    bits: &mut Option<BitReader<'a>>,
) -> Result<bool> {
    if let Some(decoder) = rle {
        decoder.read(stream)
    } else {
        Ok(bits.as_mut().unwrap().read_bit()? != 0)
    }
}

/// Tiled encoded data block: per-layer RLE-only flags, per-tile
/// entropy-enabled flags (raw bits or prefix RLE), then chunk payloads with
/// optionally compressed sizes.
fn parse_encoded_data_tiled(
    stream: &mut ByteStream<'_>,
    frame: &mut FrameConfig,
    global: &GlobalConfig,
) -> Result<()> {
    if !global.initialized {
        return Err(Error::invalid_state("No global config block received yet"));
    }
    if !frame.frame_config_set {
        return Err(Error::invalid_state("No picture config block received yet"));
    }
    if global.tile_width[0] == 0 || global.tile_height[0] == 0 {
        return Err(Error::invalid_input("Tile dimensions must not be zero"));
    }

    calculate_tile_chunk_indices(frame, global);
    chunk_table_resize(frame, global);

    if !frame.entropy_enabled && !temporal_chunk_enabled(frame, global) {
        return Ok(());
    }

    // --- RLE-only flags, one per layer, broadcast to all tiles ---
    let mut rle_reader = BitReader::new(stream.remaining_slice())?;
    for plane in 0..global.num_planes as usize {
        if frame.entropy_enabled {
            for loq in [LoqIndex::Loq1, LoqIndex::Loq0] {
                let tile_count = global.num_tiles[plane][loq as usize];
                for layer in 0..u32::from(global.num_layers) {
                    let rle_only = rle_reader.read_bit()? != 0;
                    for tile in 0..tile_count {
                        let index = frame.layer_chunk_index(global, loq, plane, tile, layer);
                        frame.chunks[index].rle_only = rle_only;
                    }
                }
            }
        }

        if temporal_chunk_enabled(frame, global) {
            let rle_only = rle_reader.read_bit()? != 0;
            let tile_count = global.num_tiles[plane][LoqIndex::Loq0 as usize];
            let start = frame.tile_chunk_temporal_index[plane] as usize;
            for tile in 0..tile_count as usize {
                frame.chunks[start + tile].rle_only = rle_only;
            }
        }
    }
    stream.seek(rle_reader.consumed_bytes())?;

    // --- Entropy-enabled flags, one per tile ---
    let mut enabled_rle = if global.per_tile_compression_enabled {
        Some(TiledRleDecoder::new(stream)?)
    } else {
        None
    };
    let mut enabled_bits = if global.per_tile_compression_enabled {
        None
    } else {
        Some(BitReader::new(stream.remaining_slice())?)
    };

    for plane in 0..global.num_planes as usize {
        if frame.entropy_enabled {
            for loq in [LoqIndex::Loq1, LoqIndex::Loq0] {
                let tile_count = global.num_tiles[plane][loq as usize];
                for layer in 0..u32::from(global.num_layers) {
                    for tile in 0..tile_count {
                        let enabled = read_enabled_flag(stream, &mut enabled_rle, &mut enabled_bits)?;
                        let index = frame.layer_chunk_index(global, loq, plane, tile, layer);
                        frame.chunks[index].entropy_enabled = enabled;
                    }
                }
            }
        }

        if temporal_chunk_enabled(frame, global) {
            let tile_count = global.num_tiles[plane][LoqIndex::Loq0 as usize];
            let start = frame.tile_chunk_temporal_index[plane] as usize;
            for tile in 0..tile_count as usize {
                let enabled = read_enabled_flag(stream, &mut enabled_rle, &mut enabled_bits)?;
                frame.chunks[start + tile].entropy_enabled = enabled;
            }
        }
    }

    if let Some(bits) = &enabled_bits {
        stream.seek(bits.consumed_bytes())?;
    }
    drop(enabled_bits);

    // --- Chunk payloads ---
    let mut size_decoder = TiledSizeDecoder::default();
    let sizes_compressed = global.tile_size_compression != TileCompressionSizePerTile::None;

    for plane in 0..global.num_planes as usize {
        if frame.entropy_enabled {
            for loq in [LoqIndex::Loq1, LoqIndex::Loq0] {
                let tile_count = global.num_tiles[plane][loq as usize];
                for layer in 0..u32::from(global.num_layers) {
                    if sizes_compressed {
                        let mut enabled_count = 0;
                        for tile in 0..tile_count {
                            let index = frame.layer_chunk_index(global, loq, plane, tile, layer);
                            enabled_count += u32::from(frame.chunks[index].entropy_enabled);
                        }
                        size_decoder.initialize(
                            enabled_count,
                            stream,
                            global.tile_size_compression,
                            global.bitstream_version,
                        )?;
                    }

                    for tile in 0..tile_count {
                        let index = frame.layer_chunk_index(global, loq, plane, tile, layer);
                        let mut chunk = frame.chunks[index];
                        parse_chunk(
                            stream,
                            &mut chunk,
                            Some(&mut frame.loq_enabled[loq as usize]),
                            sizes_compressed.then_some(&mut size_decoder),
                        )?;
                        frame.chunks[index] = chunk;
                    }
                }
            }
        }

        if temporal_chunk_enabled(frame, global) {
            let tile_count = global.num_tiles[plane][LoqIndex::Loq0 as usize];
            let start = frame.tile_chunk_temporal_index[plane] as usize;

            if sizes_compressed {
                let mut enabled_count = 0;
                for tile in 0..tile_count as usize {
                    enabled_count += u32::from(frame.chunks[start + tile].entropy_enabled);
                }
                size_decoder.initialize(
                    enabled_count,
                    stream,
                    global.tile_size_compression,
                    global.bitstream_version,
                )?;
            }

            for tile in 0..tile_count as usize {
                let mut chunk = frame.chunks[start + tile];
                parse_chunk(
                    stream,
                    &mut chunk,
                    Some(&mut frame.loq_enabled[LoqIndex::Loq0 as usize]),
                    sizes_compressed.then_some(&mut size_decoder),
                )?;
                frame.chunks[start + tile] = chunk;
            }
        }
    }

    Ok(())
}

/// SEI payload (D.2): mastering display, content light level, or the
/// registered payload carrying the bitstream version.
fn parse_sei_payload(
    stream: &mut ByteStream<'_>,
    global: &mut GlobalConfig,
    block_size: u32,
) -> Result<()> {
    let payload_type = stream.read_u8()?;

    match payload_type {
        SEI_MASTERING_DISPLAY_COLOUR_VOLUME => {
            let info = &mut global.hdr_info.mastering_display;
            for i in 0..crate::config::MDCV_NUM_PRIMARIES {
                info.display_primaries_x[i] = stream.read_u16()?;
                info.display_primaries_y[i] = stream.read_u16()?;
            }
            info.white_point_x = stream.read_u16()?;
            info.white_point_y = stream.read_u16()?;
            info.max_display_mastering_luminance = stream.read_u32()?;
            info.min_display_mastering_luminance = stream.read_u32()?;
            global.hdr_info.flags |= hdr_flags::MASTERING_DISPLAY_COLOUR_VOLUME_PRESENT;
        }
        SEI_CONTENT_LIGHT_LEVEL_INFO => {
            global.hdr_info.content_light_level.max_content_light_level = stream.read_u16()?;
            global.hdr_info.content_light_level.max_pic_average_light_level = stream.read_u16()?;
            global.hdr_info.flags |= hdr_flags::CONTENT_LIGHT_LEVEL_INFO_PRESENT;
        }
        SEI_USER_DATA_REGISTERED => {
            let mut itu_header = [0u8; 4];
            itu_header[0] = stream.read_u8()?;

            // Country code first; anything else is another vendor's payload.
            if itu_header[0] != REGISTERED_ITU_CODE[0] {
                return stream.seek(block_size as usize - 1);
            }
            itu_header[1] = stream.read_u8()?;
            itu_header[2] = stream.read_u8()?;
            itu_header[3] = stream.read_u8()?;
            if itu_header != REGISTERED_ITU_CODE {
                return stream.seek(block_size as usize - 4);
            }

            if global.bitstream_version_set {
                // The stream shouldn't provide the version more than once;
                // additional payloads are skipped harmlessly.
                stream.seek(1)?;
                debug!(
                    version = ?global.bitstream_version,
                    "Ignoring repeated or late bitstream version payload"
                );
            } else {
                let raw = stream.read_u8()?;
                global.bitstream_version = BitstreamVersion::from_raw(raw)?;
                global.bitstream_version_set = true;
            }
        }
        other => {
            warn!(payload_type = other, "Unsupported SEI payload type, skipping");
            return stream.seek(block_size as usize - 1);
        }
    }

    Ok(())
}

/// VUI parameters (E.2).
fn parse_vui_parameters(
    stream: &mut ByteStream<'_>,
    global: &mut GlobalConfig,
    vui_size: u32,
) -> Result<()> {
    let vui = &mut global.vui_info;
    if vui_size as usize > stream.remaining() {
        return Err(Error::bitstream("VUI block larger than remaining payload"));
    }
    let mut reader = BitReader::new(&stream.remaining_slice()[..vui_size as usize])?;

    /* aspect_ratio_info_present_flag: 1 bit */
    if reader.read_bit()? != 0 {
        vui.flags |= vui_flags::ASPECT_RATIO_INFO_PRESENT;

        /* aspect_ratio_idc: 8 bits */
        vui.aspect_ratio_idc = reader.read_bits(8)? as u8;
        if vui.aspect_ratio_idc == VUI_ASPECT_RATIO_IDC_EXTENDED_SAR {
            vui.sar_width = reader.read_bits(16)? as u16;
            vui.sar_height = reader.read_bits(16)? as u16;
        }
    }

    /* overscan_info_present_flag: 1 bit */
    if reader.read_bit()? != 0 {
        vui.flags |= vui_flags::OVERSCAN_INFO_PRESENT;
        if reader.read_bit()? != 0 {
            vui.flags |= vui_flags::OVERSCAN_APPROPRIATE;
        }
    }

    /* video_signal_type_present_flag: 1 bit */
    if reader.read_bit()? != 0 {
        vui.flags |= vui_flags::VIDEO_SIGNAL_TYPE_PRESENT;

        /* video_format: 3 bits */
        vui.video_format = match reader.read_bits(3)? {
            0 => VuiVideoFormat::Component,
            1 => VuiVideoFormat::Pal,
            2 => VuiVideoFormat::Ntsc,
            3 => VuiVideoFormat::Secam,
            4 => VuiVideoFormat::Mac,
            6 => VuiVideoFormat::Reserved0,
            7 => VuiVideoFormat::Reserved1,
            _ => VuiVideoFormat::Unspecified,
        };

        /* video_full_range_flag: 1 bit */
        if reader.read_bit()? != 0 {
            vui.flags |= vui_flags::VIDEO_SIGNAL_FULL_RANGE;
        }

        /* colour_description_present_flag: 1 bit */
        if reader.read_bit()? != 0 {
            vui.flags |= vui_flags::VIDEO_SIGNAL_COLOR_DESC_PRESENT;
            vui.colour_primaries = reader.read_bits(8)? as u8;
            vui.transfer_characteristics = reader.read_bits(8)? as u8;
            vui.matrix_coefficients = reader.read_bits(8)? as u8;
        }
    }

    /* chroma_loc_info_present_flag: 1 bit */
    if reader.read_bit()? != 0 {
        vui.flags |= vui_flags::CHROMA_LOC_INFO_PRESENT;
        vui.chroma_sample_loc_type_top_field = reader.read_exp_golomb()?;
        vui.chroma_sample_loc_type_bottom_field = reader.read_exp_golomb()?;
    }

    stream.seek(vui_size as usize)
}

/// S-Filter payload: sharpen type and strength.
fn parse_sfilter_payload(stream: &mut ByteStream<'_>, frame: &mut FrameConfig) -> Result<()> {
    let data = stream.read_u8()?;

    frame.sharpen_type = match (data & 0xE0) >> 5 {
        0 => SharpenType::Disabled,
        1 => SharpenType::InLoop,
        2 => SharpenType::OutOfLoop,
        other => {
            return Err(Error::invalid_input(format!(
                "Invalid sharpen type {}",
                other
            )))
        }
    };
    let signalled_strength = data & 0x1F;
    frame.sharpen_strength = (f32::from(signalled_strength) + 1.0) * 0.01;

    Ok(())
}

/// HDR payload: tone mapper selection and deinterlacer settings.
fn parse_hdr_payload(stream: &mut ByteStream<'_>, global: &mut GlobalConfig) -> Result<()> {
    let byte = stream.read_u8()?;

    /* tone_mapper_location: 1 bit */
    let tone_mapper_location = (byte >> 7) & 0x01;
    /* tone_mapper_type: 5 bits */
    let mut tone_mapper_type = (byte >> 2) & 0x1F;
    /* tone_mapper_data_present_flag: 1 bit */
    let tone_mapper_data_present = (byte >> 1) & 0x01 != 0;
    /* deinterlacer_enabled_flag: 1 bit */
    let deinterlacer_enabled = byte & 0x01 != 0;

    if tone_mapper_data_present {
        // Tone mapper data is not interpreted, only skipped.
        let size = stream.read_multi_byte()?;
        stream.seek(size as usize)?;
    }
    if tone_mapper_type == 31 {
        /* tone_mapper_type_extended: 8 bits */
        tone_mapper_type = stream.read_u8()?;
    }

    let mut deinterlacer_type = 0u8;
    let mut top_field_first = false;
    if deinterlacer_enabled {
        let byte = stream.read_u8()?;

        /* deinterlacer_type: 4 bits, top_field_first_flag: 1 bit */
        deinterlacer_type = (byte >> 4) & 0x0F;
        top_field_first = (byte >> 3) & 0x01 != 0;

        /* reserved_zeros_3bit */
        if byte & 0x07 != 0 {
            return Err(Error::invalid_input(
                "HDR payload reserved bits must be zero",
            ));
        }
    }

    global.hdr_info.flags |= hdr_flags::PAYLOAD_GLOBAL_CONFIG_PRESENT;
    global.hdr_info.tonemapper_config[tone_mapper_location as usize].tone_mapper_type =
        tone_mapper_type;
    if tone_mapper_data_present {
        global.hdr_info.flags |= hdr_flags::TONE_MAPPER_DATA_PRESENT;
    }
    if deinterlacer_enabled {
        global.hdr_info.flags |= hdr_flags::DEINTERLACER_ENABLED;
        global.deinterlacing_info.deinterlacer_type = deinterlacer_type;
        global.deinterlacing_info.top_field_first = top_field_first;
    }

    Ok(())
}

/// Additional info block (7.3.10, Table 14).
fn parse_block_additional_info(
    stream: &mut ByteStream<'_>,
    block_size: u32,
    global: &mut GlobalConfig,
    frame: &mut FrameConfig,
    global_config_modified: &mut bool,
) -> Result<()> {
    if block_size == 0 {
        return Err(Error::invalid_input("Additional info block size is zero"));
    }

    let info_type = stream.read_u8()?;
    match info_type {
        AI_SEI => {
            *global_config_modified = true;
            parse_sei_payload(stream, global, block_size - 1)
        }
        AI_VUI => parse_vui_parameters(stream, global, block_size - 1),
        AI_SFILTER => parse_sfilter_payload(stream, frame),
        AI_HDR => {
            *global_config_modified = true;
            parse_hdr_payload(stream, global)
        }
        other => {
            warn!(info_type = other, "Unsupported additional info type, skipping");
            stream.seek(block_size as usize - 1)
        }
    }
}

/// Parse one block: header byte, size, then the typed body. Verifies the
/// body consumed exactly the declared size.
fn parse_block(
    stream: &mut ByteStream<'_>,
    global: &mut GlobalConfig,
    frame: &mut FrameConfig,
    global_config_modified: &mut bool,
) -> Result<()> {
    /* payload_size_type: 3 bits, payload_type: 5 bits */
    let data = stream.read_u8()?;
    let block_type = data & 0x1F;
    let block_size_signal = (data & 0xE0) >> 5;

    let block_size: u32 = match block_size_signal {
        0..=5 => u32::from(block_size_signal),
        7 => {
            let custom = stream.read_multi_byte()?;
            if custom > u64::from(u32::MAX) {
                return Err(Error::invalid_input("Custom block size out of range"));
            }
            custom as u32
        }
        _ => {
            return Err(Error::invalid_input(format!(
                "Reserved block size signal {}",
                block_size_signal
            )))
        }
    };

    let initial_offset = stream.offset();

    match block_type {
        BT_SEQUENCE_CONFIG => {
            *global_config_modified = true;
            parse_block_sequence_config(stream, global)?;
        }
        BT_GLOBAL_CONFIG => {
            *global_config_modified = true;
            frame.global_config_set = true;
            parse_block_global_config(stream, global)?;
        }
        BT_PICTURE_CONFIG => parse_block_picture_config(stream, frame, global)?,
        BT_ENCODED_DATA => parse_encoded_data(stream, frame, global)?,
        BT_ENCODED_DATA_TILED => parse_encoded_data_tiled(stream, frame, global)?,
        BT_ADDITIONAL_INFO => {
            parse_block_additional_info(stream, block_size, global, frame, global_config_modified)?;
        }
        BT_FILLER => {
            stream.seek(block_size as usize)?;
        }
        other => {
            warn!(block_type = other, "Unrecognized block type, skipping");
            stream.seek(block_size as usize)?;
        }
    }

    if stream.offset() - initial_offset != block_size as usize {
        return Err(Error::bitstream(format!(
            "Block type {} consumed {} bytes, declared {}",
            block_type,
            stream.offset() - initial_offset,
            block_size
        )));
    }

    Ok(())
}

/// Parse a frame payload into `global` and `frame`.
///
/// `payload` must already be unescaped by the NAL extraction collaborator,
/// which also supplies `nal_type`. `global` is the caller's scratch copy of
/// the current config; it is updated in place and
/// `Ok(global_config_modified)` reports whether any block touched it. On
/// error the caller must discard the scratch copy, which keeps failed
/// parses invisible.
///
/// The stateful frame fields (quant matrix, dither flag) must be seeded
/// from the previous frame before calling.
pub fn configs_parse(
    payload: &[u8],
    nal_type: NalType,
    global: &mut GlobalConfig,
    frame: &mut FrameConfig,
) -> Result<bool> {
    if payload.is_empty() {
        return Err(Error::invalid_input("Empty frame payload"));
    }

    let payload_copy = payload.to_vec();

    let mut global_config_modified = false;
    frame.frame_config_set = false;
    frame.global_config_set = false;
    frame.nal_type = nal_type;
    frame.loq_enabled = [false; LOQ_ENHANCED_COUNT];
    frame.chunks.clear();

    {
        let mut stream = ByteStream::new(&payload_copy)?;
        while stream.remaining() > 0 {
            parse_block(&mut stream, global, frame, &mut global_config_modified)?;
        }
    }

    frame.payload = payload_copy;

    Ok(global_config_modified)
}

/// Bake the predicted-average computation into the upscale kernel.
///
/// Only symmetric 2-tap (zero padded to 4) and 4-tap kernels have an
/// approximation; other kernel shapes are left untouched.
pub fn approximate_pa(global: &mut GlobalConfig) -> Result<()> {
    if !global.initialized {
        return Err(Error::invalid_state(
            "Global config must be initialized before approximating PA",
        ));
    }
    if !global.predicted_average_enabled {
        return Ok(());
    }

    match global.upscale {
        UpscaleType::Linear => approximate_pa_2tap_zero_pad(&mut global.kernel),
        UpscaleType::Cubic | UpscaleType::ModifiedCubic | UpscaleType::AdaptiveCubic => {
            approximate_pa_4tap(&mut global.kernel)
        }
        _ => Ok(()),
    }
}

fn approximate_pa_4tap(kernel: &mut Kernel) -> Result<()> {
    debug_assert_eq!(kernel.length, 4);

    let d0 = kernel.coeffs[0][0];
    let c0 = kernel.coeffs[0][1];
    let b0 = kernel.coeffs[0][2];
    let a0 = kernel.coeffs[0][3];

    let d1 = kernel.coeffs[1][3];
    let c1 = kernel.coeffs[1][2];
    let b1 = kernel.coeffs[1][1];
    let a1 = kernel.coeffs[1][0];

    if a0 != a1 || b0 != b1 || c0 != c1 || d0 != d1 {
        return Err(Error::invalid_input(
            "Kernel is not symmetric; cannot approximate PA",
        ));
    }

    let half_bd_diff = (b0 - d0) / 2;

    kernel.coeffs[0][0] = -half_bd_diff;
    kernel.coeffs[0][1] = 16384;
    kernel.coeffs[0][2] = half_bd_diff;
    kernel.coeffs[0][3] = 0;

    kernel.coeffs[1][0] = 0;
    kernel.coeffs[1][1] = half_bd_diff;
    kernel.coeffs[1][2] = 16384;
    kernel.coeffs[1][3] = -half_bd_diff;

    kernel.approximated_pa = true;

    Ok(())
}

fn approximate_pa_2tap_zero_pad(kernel: &mut Kernel) -> Result<()> {
    debug_assert_eq!(kernel.length, 2);

    kernel.coeffs[0][2] = kernel.coeffs[0][1];
    kernel.coeffs[0][1] = kernel.coeffs[0][0];
    kernel.coeffs[0][0] = 0;
    kernel.coeffs[0][3] = 0;

    kernel.coeffs[1][2] = kernel.coeffs[1][1];
    kernel.coeffs[1][1] = kernel.coeffs[1][0];
    kernel.coeffs[1][0] = 0;
    kernel.coeffs[1][3] = 0;

    kernel.length = 4;
    kernel.approximated_pa = true;

    approximate_pa_4tap(kernel)
}
