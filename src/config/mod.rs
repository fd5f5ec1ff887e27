//! Stream and frame configuration
//!
//! Two configuration scopes exist. `GlobalConfig` holds per-sequence
//! parameters that change rarely (only ever on IDR boundaries in standard
//! streams) and is shared read-only between in-flight frames through the
//! [`pool::ConfigPool`]. `FrameConfig` holds per-frame parameters and the
//! chunk table and is owned exclusively by the frame that requested it.
//!
//! A handful of frame parameters are *stateful*: the quantization matrix and
//! the dither-enabled flag persist from frame to frame until re-signalled,
//! so the pool seeds them into each new `FrameConfig` before parsing.

pub mod chunks;
pub mod parser;
pub mod pool;

use crate::error::{Error, Result};

/// Number of enhancement LOQs that carry residual data (LOQ0 and LOQ1;
/// LOQ2 is a scaling-only placeholder).
pub const LOQ_ENHANCED_COUNT: usize = 2;

/// Residual layer counts and limits.
pub const LAYER_COUNT_DD: usize = 4;
pub const LAYER_COUNT_DDS: usize = 16;
pub const MAX_LAYER_COUNT: usize = LAYER_COUNT_DDS;
pub const MAX_PLANES: usize = 3;

/// A temporal block is 32x32 pixels.
pub const BLOCK_SIZE: u32 = 32;
pub const BLOCK_SIZE_SHIFT: u32 = 5;

/// Step-width clamp range used by the quantizer.
pub const MIN_STEP_WIDTH: i32 = 1;
pub const MAX_STEP_WIDTH: i32 = 32767;

/// Level of Quality: an enhancement resolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoqIndex {
    /// Full target resolution enhancement.
    Loq0 = 0,
    /// Lower-resolution enhancement.
    Loq1 = 1,
    /// Scaling-only placeholder; carries no residual data.
    Loq2 = 2,
}

/// Chroma subsampling of the enhancement stream.
///
/// Used for picture size math only, not to decide whether chroma planes
/// carry residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chroma {
    Monochrome = 0,
    #[default]
    C420,
    C422,
    C444,
}

/// Revisions of the bitstream standard that require parsing differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BitstreamVersion {
    Initial = 0,
    NewCodeLengths = 1,
    AlignWithSpec = 2,
}

impl BitstreamVersion {
    /// The newest supported revision.
    pub const CURRENT: BitstreamVersion = BitstreamVersion::AlignWithSpec;

    /// Map a raw signalled version number.
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(BitstreamVersion::Initial),
            1 => Ok(BitstreamVersion::NewCodeLengths),
            2 => Ok(BitstreamVersion::AlignWithSpec),
            other => Err(Error::unsupported(format!(
                "Unsupported bitstream version {}",
                other
            ))),
        }
    }
}

/// Bit depths signalled for base and enhanced pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BitDepth {
    #[default]
    Depth8 = 0,
    Depth10,
    Depth12,
    Depth14,
}

impl BitDepth {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(BitDepth::Depth8),
            1 => Ok(BitDepth::Depth10),
            2 => Ok(BitDepth::Depth12),
            3 => Ok(BitDepth::Depth14),
            other => Err(Error::invalid_input(format!("Invalid bit depth {}", other))),
        }
    }
}

/// Frame or interlaced field picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    Frame,
    Field,
}

/// Top or bottom interlaced field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    Top,
    Bottom,
}

/// Upscale kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpscaleType {
    Nearest = 0,
    #[default]
    Linear,
    Cubic,
    ModifiedCubic,
    AdaptiveCubic,
    Reserved1,
    Reserved2,
    Unspecified,
    // Non-standard kernels.
    Lanczos,
    CubicPrediction,
    Mishus,
}

/// Dithering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DitherType {
    #[default]
    None = 0,
    Uniform,
}

/// The two standardized inverse transform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformType {
    /// 2x2, four coefficient layers.
    #[default]
    Dd = 0,
    /// 4x4, sixteen coefficient layers.
    Dds,
}

impl TransformType {
    /// Number of coefficient layers for this transform shape.
    pub fn layer_count(self) -> usize {
        match self {
            TransformType::Dd => LAYER_COUNT_DD,
            TransformType::Dds => LAYER_COUNT_DDS,
        }
    }

    /// Pixel width (and height) of one transform unit.
    pub fn tu_size(self) -> u32 {
        match self {
            TransformType::Dd => 2,
            TransformType::Dds => 4,
        }
    }

    /// log2 of the transform unit width.
    pub fn tu_width_shift(self) -> u8 {
        match self {
            TransformType::Dd => 1,
            TransformType::Dds => 2,
        }
    }
}

/// Quant-matrix signalling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMatrixMode {
    UsePrevious = 0,
    UseDefault,
    CustomBoth,
    /// LOQ1 uses previous in this case.
    CustomLoq0,
    /// LOQ0 uses previous in this case.
    CustomLoq1,
    CustomBothUnique,
}

impl QuantMatrixMode {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(QuantMatrixMode::UsePrevious),
            1 => Ok(QuantMatrixMode::UseDefault),
            2 => Ok(QuantMatrixMode::CustomBoth),
            3 => Ok(QuantMatrixMode::CustomLoq0),
            4 => Ok(QuantMatrixMode::CustomLoq1),
            5 => Ok(QuantMatrixMode::CustomBothUnique),
            other => Err(Error::invalid_input(format!(
                "Invalid quant matrix mode {}",
                other
            ))),
        }
    }
}

/// Dimensional scaling between LOQs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    #[default]
    Scale0D = 0,
    Scale1D,
    Scale2D,
}

/// Tiling layout of the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileDimensions {
    #[default]
    None = 0,
    Tile512x256,
    Tile1024x512,
    Custom,
}

/// Compression applied to per-tile chunk sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileCompressionSizePerTile {
    #[default]
    None = 0,
    Prefix,
    PrefixOnDiff,
}

/// User-data embedding modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserDataMode {
    #[default]
    None = 0,
    With2Bits,
    With6Bits,
}

/// Sharpening filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharpenType {
    #[default]
    Disabled = 0,
    InLoop = 1,
    OutOfLoop = 2,
}

/// Dequantization offset modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequantOffsetMode {
    #[default]
    Default = 0,
    ConstOffset,
}

/// NAL unit type relevant to enhancement parsing, derived by the NAL
/// extraction collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NalType {
    #[default]
    NonIdr,
    Idr,
}

/// Temporal prediction signal for one transform unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalSignal {
    /// Residual is added to the temporal buffer.
    #[default]
    Inter = 0,
    /// Residual overwrites the temporal buffer.
    Intra = 1,
}

/// Number of temporal signal types.
pub const TEMPORAL_COUNT: usize = 2;

/// Upscale kernel coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Kernel {
    /// Forward then reverse kernel, `length` taps each.
    pub coeffs: [[i16; 8]; 2],
    /// Number of taps.
    pub length: u8,
    /// True once predicted-average computation has been pre-baked in.
    pub approximated_pa: bool,
}

/// Deblocking filter coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deblock {
    pub corner: u32,
    pub side: u32,
}

/// Conformance-window crop amounts per picture edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Crop {
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
}

/// User-data embedding configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserDataConfig {
    pub enabled: bool,
    pub layer_index: u32,
    pub shift: i16,
}

/// The 2 (LOQ) x 16 (layer) quantization matrix, stateful across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuantMatrix {
    pub values: [[u8; MAX_LAYER_COUNT]; LOQ_ENHANCED_COUNT],
    pub set: bool,
}

/// Number of primaries in the mastering display colour volume SEI message.
pub const MDCV_NUM_PRIMARIES: usize = 3;

/// HDR info validity flags.
pub mod hdr_flags {
    pub const MASTERING_DISPLAY_COLOUR_VOLUME_PRESENT: u32 = 0x0000_0001;
    pub const CONTENT_LIGHT_LEVEL_INFO_PRESENT: u32 = 0x0000_0002;
    pub const PAYLOAD_GLOBAL_CONFIG_PRESENT: u32 = 0x0000_0004;
    pub const TONE_MAPPER_DATA_PRESENT: u32 = 0x0000_0008;
    pub const DEINTERLACER_ENABLED: u32 = 0x0000_0010;
}

/// VUI info validity flags.
pub mod vui_flags {
    pub const ASPECT_RATIO_INFO_PRESENT: u32 = 0x0000_0001;
    pub const OVERSCAN_INFO_PRESENT: u32 = 0x0000_0010;
    pub const OVERSCAN_APPROPRIATE: u32 = 0x0000_0020;
    pub const VIDEO_SIGNAL_TYPE_PRESENT: u32 = 0x0000_0100;
    pub const VIDEO_SIGNAL_FULL_RANGE: u32 = 0x0000_0200;
    pub const VIDEO_SIGNAL_COLOR_DESC_PRESENT: u32 = 0x0000_0400;
    pub const CHROMA_LOC_INFO_PRESENT: u32 = 0x0000_1000;
}

/// Mastering display colour volume (SEI payload D.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MasteringDisplayColorVolume {
    pub display_primaries_x: [u16; MDCV_NUM_PRIMARIES],
    pub display_primaries_y: [u16; MDCV_NUM_PRIMARIES],
    pub white_point_x: u16,
    pub white_point_y: u16,
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

/// Content light level (SEI payload D.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentLightLevel {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

/// Tone mapper configuration from the HDR payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TonemapperConfig {
    pub tone_mapper_type: u8,
}

/// HDR parameters signalled through additional-info blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrInfo {
    /// Combination of [`hdr_flags`] values marking which fields are valid.
    pub flags: u32,
    pub mastering_display: MasteringDisplayColorVolume,
    pub content_light_level: ContentLightLevel,
    pub tonemapper_config: [TonemapperConfig; 2],
}

/// VUI video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VuiVideoFormat {
    Component = 0,
    Pal,
    Ntsc,
    Secam,
    Mac,
    #[default]
    Unspecified,
    Reserved0,
    Reserved1,
}

/// VUI parameters signalled through additional-info blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VuiInfo {
    /// Combination of [`vui_flags`] values marking which fields are valid.
    pub flags: u32,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_format: VuiVideoFormat,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
}

/// Deinterlacing parameters for interlaced HDR streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeinterlacingInfo {
    pub deinterlacer_type: u8,
    pub top_field_first: bool,
}

/// A read-only view of one entropy-coded sub-stream within the frame's
/// payload buffer, identified by byte range rather than pointer so
/// [`FrameConfig`] can own the payload without self-reference. The bytes are
/// never copied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunk {
    /// Byte offset into the frame payload.
    pub offset: usize,
    /// Chunk size in bytes.
    pub size: usize,
    /// True if the chunk is raw run-length data with no Huffman tables.
    pub rle_only: bool,
    /// False when the layer carries no data at all.
    pub entropy_enabled: bool,
}

/// Per-sequence configuration. Immutable once published to the config pool;
/// the parser produces a fresh copy when a change is detected.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    /// Tracks if the config has been initialized by a global config block.
    pub initialized: bool,
    /// Tracks if the version has been pinned, either by the caller or from
    /// the stream.
    pub bitstream_version_set: bool,
    /// Standard revision this stream was encoded against.
    pub bitstream_version: BitstreamVersion,

    pub chroma: Chroma,
    pub base_depth: BitDepth,
    pub enhanced_depth: BitDepth,
    /// Use `enhanced_depth` for residuals on the base layer.
    pub loq1_use_enhanced_depth: bool,

    /// Pixel width of the frame.
    pub width: u16,
    /// Pixel height of the frame (progressive).
    pub height: u16,
    pub upscale: UpscaleType,

    /// Dimensional scaling modes for each enhanced LOQ.
    pub scaling_modes: [ScalingMode; LOQ_ENHANCED_COUNT],

    /// Number of enhanced planes.
    pub num_planes: u8,
    pub temporal_enabled: bool,
    pub predicted_average_enabled: bool,
    /// Enable 'reduced signalling' for temporal block clears.
    pub temporal_reduced_signalling_enabled: bool,
    pub transform: TransformType,
    /// Number of entropy-coded coefficient layers (chunks per tile).
    pub num_layers: u8,

    /// Temporal modifier constant for dequantization.
    pub temporal_step_width_modifier: u8,
    /// Chroma modifier constant for dequantization.
    pub chroma_step_width_multiplier: u8,
    pub kernel: Kernel,
    pub deblock: Deblock,
    pub crop_enabled: bool,
    pub crop: Crop,
    pub user_data: UserDataConfig,

    pub hdr_info: HdrInfo,
    pub vui_info: VuiInfo,
    pub deinterlacing_info: DeinterlacingInfo,

    pub tile_dimensions: TileDimensions,
    pub tile_width: [u16; MAX_PLANES],
    pub tile_height: [u16; MAX_PLANES],
    /// Whether custom tile sizes themselves are compressed.
    pub tile_size_compression: TileCompressionSizePerTile,
    /// True if each tile is encoded separately.
    pub per_tile_compression_enabled: bool,
    /// Total number of tiles on each plane and LOQ.
    pub num_tiles: [[u32; LOQ_ENHANCED_COUNT]; MAX_PLANES],
}

/// Default deblock coefficient (8.9.2).
pub const DEFAULT_DEBLOCK_COEFFICIENT: u32 = 16;
/// Default temporal step-width modifier (7.4.3.3).
pub const DEFAULT_TEMPORAL_STEP_WIDTH_MODIFIER: u8 = 48;
/// Default chroma step-width multiplier (7.4.3.3).
pub const DEFAULT_CHROMA_STEP_WIDTH_MULTIPLIER: u8 = 64;

impl GlobalConfig {
    /// Create a config with standard-mandated defaults.
    ///
    /// When `version` is `None`, the version is picked up from the stream's
    /// first registered SEI payload; the current revision is assumed until
    /// one arrives.
    pub fn new(version: Option<BitstreamVersion>) -> Self {
        GlobalConfig {
            initialized: false,
            bitstream_version_set: version.is_some(),
            bitstream_version: version.unwrap_or(BitstreamVersion::CURRENT),
            chroma: Chroma::C420,
            base_depth: BitDepth::Depth8,
            enhanced_depth: BitDepth::Depth8,
            loq1_use_enhanced_depth: false,
            width: 0,
            height: 0,
            upscale: UpscaleType::Linear,
            scaling_modes: [ScalingMode::Scale2D, ScalingMode::Scale0D],
            num_planes: 0,
            temporal_enabled: false,
            predicted_average_enabled: false,
            temporal_reduced_signalling_enabled: false,
            transform: TransformType::Dd,
            num_layers: 0,
            temporal_step_width_modifier: DEFAULT_TEMPORAL_STEP_WIDTH_MODIFIER,
            chroma_step_width_multiplier: DEFAULT_CHROMA_STEP_WIDTH_MULTIPLIER,
            kernel: Kernel::default(),
            deblock: Deblock::default(),
            crop_enabled: false,
            crop: Crop::default(),
            user_data: UserDataConfig::default(),
            hdr_info: HdrInfo::default(),
            vui_info: VuiInfo::default(),
            deinterlacing_info: DeinterlacingInfo::default(),
            tile_dimensions: TileDimensions::None,
            tile_width: [0; MAX_PLANES],
            tile_height: [0; MAX_PLANES],
            tile_size_compression: TileCompressionSizePerTile::None,
            per_tile_compression_enabled: false,
            num_tiles: [[0; LOQ_ENHANCED_COUNT]; MAX_PLANES],
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig::new(None)
    }
}

/// Per-frame configuration: picture parameters plus the chunk table.
///
/// Owned exclusively by the frame that requested it. The raw payload is
/// owned here too; chunks reference it by byte range.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    /// Tracks if a picture config block has been parsed.
    pub frame_config_set: bool,
    /// Set if a global config block was also present for this frame.
    pub global_config_set: bool,

    /// The raw payload the chunk table points into.
    pub payload: Vec<u8>,
    /// Entropy-coded chunks (layers), indexed via the tile chunk indices.
    pub chunks: Vec<Chunk>,

    pub nal_type: NalType,
    pub picture_type: PictureType,
    /// Only meaningful for field pictures.
    pub field_type: FieldType,
    /// Signals whether any coefficient data was sent this frame. Use
    /// `loq_enabled` for high level enhancement on/off checks.
    pub entropy_enabled: bool,
    /// True if the temporal plane should be reset at the start of this frame.
    pub temporal_refresh: bool,
    /// Internal flag for locating the temporal chunk.
    pub temporal_signalling_present: bool,
    /// Whether residuals are enabled on LOQ0 and LOQ1.
    pub loq_enabled: [bool; LOQ_ENHANCED_COUNT],

    /// First residual chunk index for a given plane and LOQ.
    pub tile_chunk_residual_index: [[u32; LOQ_ENHANCED_COUNT]; MAX_PLANES],
    /// First temporal chunk index for a given plane.
    pub tile_chunk_temporal_index: [u32; MAX_PLANES],

    /// Stateful: carried over from the previous frame unless re-signalled.
    pub quant_matrix: QuantMatrix,
    pub step_widths: [i32; LOQ_ENHANCED_COUNT],
    pub dequant_offset_mode: DequantOffsetMode,
    /// -1 when no offset was signalled.
    pub dequant_offset: i32,
    pub deblock_enabled: bool,

    /// Stateful: carried over from the previous frame unless re-signalled.
    pub dither_enabled: bool,
    pub dither_type: DitherType,
    pub dither_strength: u8,
    pub sharpen_type: SharpenType,
    pub sharpen_strength: f32,
}

impl FrameConfig {
    /// Bytes of one chunk within this frame's payload.
    pub fn chunk_data(&self, chunk: &Chunk) -> &[u8] {
        &self.payload[chunk.offset..chunk.offset + chunk.size]
    }

    /// The residual chunk index for a given plane, LOQ, tile and layer.
    pub fn layer_chunk_index(
        &self,
        global: &GlobalConfig,
        loq: LoqIndex,
        plane_idx: usize,
        tile_idx: u32,
        layer: u32,
    ) -> usize {
        (self.tile_chunk_residual_index[plane_idx][loq as usize]
            + tile_idx * u32::from(global.num_layers)
            + layer) as usize
    }

    /// The `num_layers` residual chunks for a (plane, LOQ, tile), or `None`
    /// if the frame carries no coefficient data.
    pub fn layer_chunks(
        &self,
        global: &GlobalConfig,
        plane_idx: usize,
        loq: LoqIndex,
        tile_idx: u32,
    ) -> Result<Option<&[Chunk]>> {
        if plane_idx >= global.num_planes as usize {
            return Err(Error::invalid_input("Plane index out of range"));
        }
        if loq != LoqIndex::Loq0 && loq != LoqIndex::Loq1 {
            return Err(Error::invalid_input("Residual chunks only exist for LOQ0/LOQ1"));
        }

        if !self.entropy_enabled || self.chunks.is_empty() {
            return Ok(None);
        }
        if tile_idx >= global.num_tiles[plane_idx][loq as usize] {
            return Err(Error::invalid_input("Tile index out of range"));
        }

        let start = self.layer_chunk_index(global, loq, plane_idx, tile_idx, 0);
        Ok(Some(&self.chunks[start..start + global.num_layers as usize]))
    }

    /// The temporal chunk for a (plane, tile), or `None` if temporal
    /// signalling is absent this frame.
    pub fn temporal_chunk(
        &self,
        global: &GlobalConfig,
        plane_idx: usize,
        tile_idx: u32,
    ) -> Result<Option<&Chunk>> {
        if plane_idx > global.num_planes as usize {
            return Err(Error::invalid_input("Plane index out of range"));
        }

        if !chunks::temporal_chunk_enabled(self, global) || self.chunks.is_empty() {
            return Ok(None);
        }
        if tile_idx >= global.num_tiles[plane_idx][LoqIndex::Loq0 as usize] {
            return Err(Error::invalid_input("Tile index out of range"));
        }

        let index = (self.tile_chunk_temporal_index[plane_idx] + tile_idx) as usize;
        Ok(Some(&self.chunks[index]))
    }
}

/// Plane dimensions at a given LOQ, derived from the scaling modes and
/// chroma subsampling.
pub fn plane_dimensions(global: &GlobalConfig, loq: LoqIndex, plane_idx: usize) -> (u16, u16) {
    let mut width = global.width;
    let mut height = global.height;

    for loq_idx in 0..(loq as usize) {
        let scaling = global.scaling_modes[loq_idx];
        if scaling != ScalingMode::Scale0D {
            width = (width + 1) >> 1;
            if scaling == ScalingMode::Scale2D {
                height = (height + 1) >> 1;
            }
        }
    }

    if plane_idx > 0 {
        match global.chroma {
            Chroma::C420 => {
                width = (width + 1) >> 1;
                height = (height + 1) >> 1;
            }
            Chroma::C422 => {
                width = (width + 1) >> 1;
            }
            Chroma::Monochrome | Chroma::C444 => {}
        }
    }

    (width, height)
}

fn divide_ceil(numerator: u16, denominator: u16) -> u16 {
    (numerator + denominator - 1) / denominator
}

/// Width and height of one tile, accounting for partial edge tiles.
pub fn tile_dimensions(
    global: &GlobalConfig,
    loq: LoqIndex,
    plane_idx: usize,
    tile_idx: u32,
) -> (u16, u16) {
    let (plane_width, plane_height) = plane_dimensions(global, loq, plane_idx);
    let tile_width = global.tile_width[plane_idx];
    let tile_height = global.tile_height[plane_idx];

    let tiles_across = u32::from(divide_ceil(plane_width, tile_width));
    let tile_x = (tile_idx % tiles_across) as u16;
    let tile_y = (tile_idx / tiles_across) as u16;

    (
        tile_width.min(plane_width - tile_x * tile_width),
        tile_height.min(plane_height - tile_y * tile_height),
    )
}

/// Top-left pixel origin of one tile within its plane.
pub fn tile_start(
    global: &GlobalConfig,
    loq: LoqIndex,
    plane_idx: usize,
    tile_idx: u32,
) -> (u16, u16) {
    if tile_idx == 0 {
        return (0, 0);
    }

    let (plane_width, _) = plane_dimensions(global, loq, plane_idx);
    let (tile_width, tile_height) = tile_dimensions(global, loq, plane_idx, 0);
    let tiles_across = u32::from(divide_ceil(plane_width, global.tile_width[plane_idx]));

    (
        ((tile_idx % tiles_across) as u16) * tile_width,
        ((tile_idx / tiles_across) as u16) * tile_height,
    )
}

/// Total tile count over all planes and enhanced LOQs.
pub fn total_num_tiles(global: &GlobalConfig) -> u32 {
    let mut total = 0;
    for plane_idx in 0..global.num_planes as usize {
        for loq in 0..LOQ_ENHANCED_COUNT {
            total += global.num_tiles[plane_idx][loq];
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_dimensions_scaling() {
        let mut global = GlobalConfig::default();
        global.width = 1920;
        global.height = 1080;
        global.scaling_modes = [ScalingMode::Scale2D, ScalingMode::Scale0D];
        global.chroma = Chroma::C420;

        assert_eq!(plane_dimensions(&global, LoqIndex::Loq0, 0), (1920, 1080));
        assert_eq!(plane_dimensions(&global, LoqIndex::Loq1, 0), (960, 540));
        // 0D scaling between LOQ1 and LOQ2 leaves dimensions alone.
        assert_eq!(plane_dimensions(&global, LoqIndex::Loq2, 0), (960, 540));
        // Chroma planes halve both ways for 4:2:0.
        assert_eq!(plane_dimensions(&global, LoqIndex::Loq0, 1), (960, 540));
    }

    #[test]
    fn test_tile_dimensions_partial_edges() {
        let mut global = GlobalConfig::default();
        global.width = 1920;
        global.height = 1080;
        global.num_planes = 1;
        global.scaling_modes = [ScalingMode::Scale0D, ScalingMode::Scale0D];
        global.chroma = Chroma::Monochrome;
        global.tile_width[0] = 512;
        global.tile_height[0] = 256;

        // 4 x 5 tile grid; right column is 1920 - 3*512 = 384 wide, bottom
        // row is 1080 - 4*256 = 56 high.
        assert_eq!(tile_dimensions(&global, LoqIndex::Loq0, 0, 0), (512, 256));
        assert_eq!(tile_dimensions(&global, LoqIndex::Loq0, 0, 3), (384, 256));
        assert_eq!(tile_dimensions(&global, LoqIndex::Loq0, 0, 16), (512, 56));
        assert_eq!(tile_dimensions(&global, LoqIndex::Loq0, 0, 19), (384, 56));

        assert_eq!(tile_start(&global, LoqIndex::Loq0, 0, 0), (0, 0));
        assert_eq!(tile_start(&global, LoqIndex::Loq0, 0, 5), (512, 256));
    }

    #[test]
    fn test_transform_type_properties() {
        assert_eq!(TransformType::Dd.layer_count(), 4);
        assert_eq!(TransformType::Dds.layer_count(), 16);
        assert_eq!(TransformType::Dd.tu_width_shift(), 1);
        assert_eq!(TransformType::Dds.tu_width_shift(), 2);
    }
}
