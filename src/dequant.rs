//! Dequantization parameter derivation
//!
//! Turns the signalled quant matrix, step-widths and offset mode into the
//! per-temporal-type, per-layer (step-width, offset) pairs the decode loop
//! multiplies coefficients by. All of the arithmetic is fixed point with
//! shift amounts and rounding constants mandated by the standard (8.5.3);
//! the only floating point is the `f64`-based natural log the reference
//! also computes in floating point.

use crate::config::{
    DequantOffsetMode, FrameConfig, GlobalConfig, LoqIndex, QuantMatrix, ScalingMode,
    TransformType, LOQ_ENHANCED_COUNT, MAX_LAYER_COUNT, MAX_STEP_WIDTH, MIN_STEP_WIDTH,
    TEMPORAL_COUNT,
};

/// Default quant matrices per transform shape and LOQ0 scaling mode (8.5.2).
const QM_DEFAULT_DD_1D: [[u8; 4]; LOQ_ENHANCED_COUNT] = [[0, 2, 0, 0], [0, 3, 0, 32]];

const QM_DEFAULT_DD_2D: [[u8; 4]; LOQ_ENHANCED_COUNT] = [[32, 3, 0, 32], [0, 3, 0, 32]];

const QM_DEFAULT_DDS_1D: [[u8; 16]; LOQ_ENHANCED_COUNT] = [
    [13, 26, 19, 32, 52, 1, 78, 9, 13, 26, 19, 32, 150, 91, 91, 19],
    [0, 0, 0, 2, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
];

const QM_DEFAULT_DDS_2D: [[u8; 16]; LOQ_ENHANCED_COUNT] = [
    [13, 26, 19, 32, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
    [0, 0, 0, 2, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
];

/// Constants for the step-width and offset formulas (8.5.3). The divisors
/// cannot be replaced with shifts since they operate on signed values.
const K_A: i32 = 39; /* 0.0006 in U16.16 */
const K_B: i32 = 126_484; /* 1.9200 in U16.16 */
const K_C: i32 = 5_242; /* 0.0800 in U16.16 */
const K_D: i32 = 99_614; /* 1.5200 in U16.16 */
const SW_DIVISOR: i64 = 32_768; /* like >> 15, unambiguous on signed values */
const SW_DIVISOR_NO_DQ_OFFSET: i64 = 2_147_483_648; /* like >> 31 */
const QM_SCALE_MAX: i64 = 196_608; /* 3 << 16 */
/// Largest step-width that does not overflow the deadzone calculation.
const DEADZONE_SW_LIMIT: i32 = 12_249;
/// 1/255 as U0.16 fixed point.
const FP_ONE_OVER_255: u32 = 257;

/// Restore the supplied quant matrix to the standard default values for one
/// LOQ. The LOQ0 scaling mode selects the table for both LOQs.
pub fn quant_matrix_set_default(
    matrix: &mut QuantMatrix,
    loq0_scaling: ScalingMode,
    transform: TransformType,
    loq: LoqIndex,
) {
    let layer_count = transform.layer_count();
    let values = &mut matrix.values[loq as usize];

    match (transform, loq0_scaling) {
        (TransformType::Dds, ScalingMode::Scale1D) => {
            values[..layer_count].copy_from_slice(&QM_DEFAULT_DDS_1D[loq as usize])
        }
        (TransformType::Dds, _) => {
            values[..layer_count].copy_from_slice(&QM_DEFAULT_DDS_2D[loq as usize])
        }
        (TransformType::Dd, ScalingMode::Scale1D) => {
            values[..layer_count].copy_from_slice(&QM_DEFAULT_DD_1D[loq as usize])
        }
        (TransformType::Dd, _) => {
            values[..layer_count].copy_from_slice(&QM_DEFAULT_DD_2D[loq as usize])
        }
    }
}

/// Copy the LOQ0 quant matrix into LOQ1.
pub fn quant_matrix_duplicate_loqs(matrix: &mut QuantMatrix) {
    matrix.values[LoqIndex::Loq1 as usize] = matrix.values[LoqIndex::Loq0 as usize];
}

/// Dequantization settings for a single plane and LOQ: step-width and
/// offset per temporal type per layer. Purely derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dequant {
    pub step_width: [[i16; MAX_LAYER_COUNT]; TEMPORAL_COUNT],
    pub offset: [[i16; MAX_LAYER_COUNT]; TEMPORAL_COUNT],
}

/// Natural log of `step_width` with U12.4 fixed-point precision, computed
/// in `f64` like the reference.
fn fixed_point_u12_4_ln(step_width: i32) -> f64 {
    let ln = f64::ln(step_width as f64);
    let integer_part = ln.floor();
    let fractional_part = ((ln - integer_part) * 4096.0).floor() / 4096.0;
    integer_part + fractional_part
}

/// Modified temporal step-width, treating the modifier as a U0.16 fraction
/// clamped to [0, 0.5].
fn fixed_point_temporal_sw(modifier: u32, unmodified: i16) -> i32 {
    let step_width_modifier = ((modifier * FP_ONE_OVER_255) as u16).min(1 << 15);
    let multiplier = (1u32 << 16) - u32::from(step_width_modifier);
    let floored = (multiplier * unmodified as u32) >> 16;
    (floored as i32).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
}

fn dequant_offset_actual(
    layer_sw: i32,
    master_sw: i32,
    dequant_offset: i32,
    mode: DequantOffsetMode,
) -> i32 {
    if dequant_offset == -1 || dequant_offset == 0 {
        return 0;
    }

    let log_layer_sw = (-(K_C as f64) * fixed_point_u12_4_ln(layer_sw)) as i32;
    let log_master_sw = (K_C as f64 * fixed_point_u12_4_ln(master_sw)) as i32;

    let offset_actual: i64 = match mode {
        DequantOffsetMode::Default => i64::from(dequant_offset) << 11,
        DequantOffsetMode::ConstOffset => i64::from(dequant_offset) << 9,
    };

    let offset_actual =
        (i64::from(log_layer_sw) + offset_actual + i64::from(log_master_sw)) * i64::from(layer_sw);

    (offset_actual >> 16) as i32
}

fn step_width_modifier(
    layer_sw: i32,
    dequant_offset_actual: i32,
    offset: i32,
    mode: DequantOffsetMode,
) -> i32 {
    if offset == -1 {
        let log_by_layer_sw = (K_D as f64 - K_C as f64 * fixed_point_u12_4_ln(layer_sw)) as i64;
        let log_by_layer_sw_pow = log_by_layer_sw * i64::from(layer_sw) * i64::from(layer_sw);
        return (log_by_layer_sw_pow / SW_DIVISOR_NO_DQ_OFFSET) as i32;
    }

    match mode {
        DequantOffsetMode::Default => {
            ((i64::from(dequant_offset_actual) * i64::from(layer_sw)) / SW_DIVISOR) as i32
        }
        DequantOffsetMode::ConstOffset => 0,
    }
}

fn deadzone_width(master_sw: i32, layer_sw: i32) -> i32 {
    if master_sw <= 16 {
        return master_sw >> 1;
    }

    if layer_sw > DEADZONE_SW_LIMIT {
        return i32::MAX;
    }

    // 32-bit arithmetic, wrap included: step-widths at the limit above push
    // the product past i32 range and the reference relies on two's
    // complement wrap-around there.
    ((1i32 << 16) - ((K_A * layer_sw + K_B) >> 1)).wrapping_mul(layer_sw) >> 16
}

fn applied_dequant_offset(
    dequant_offset_actual: i32,
    deadzone: i32,
    offset: i32,
    mode: DequantOffsetMode,
) -> i16 {
    if offset == -1 || mode == DequantOffsetMode::Default {
        return deadzone.wrapping_neg() as i16;
    }

    // mode == ConstOffset
    dequant_offset_actual.wrapping_sub(deadzone) as i16
}

fn chroma_step_width(step_width: i32, multiplier: u8) -> i32 {
    ((step_width * i32::from(multiplier)) >> 6).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
}

/// Calculate the dequantization parameters for one plane and LOQ.
///
/// Deterministic: identical inputs produce bit-identical tables.
pub fn calculate_dequant(
    global: &GlobalConfig,
    frame: &FrameConfig,
    plane_idx: usize,
    loq: LoqIndex,
) -> Dequant {
    debug_assert!(loq == LoqIndex::Loq0 || loq == LoqIndex::Loq1);

    let mut dequant = Dequant::default();
    let quant_matrix = &frame.quant_matrix.values[loq as usize];
    let layer_count = global.num_layers as usize;

    let loq_sw = if plane_idx > 0 && loq == LoqIndex::Loq0 {
        chroma_step_width(
            frame.step_widths[loq as usize],
            global.chroma_step_width_multiplier,
        )
    } else {
        frame.step_widths[loq as usize]
    };

    for temporal_idx in 0..TEMPORAL_COUNT {
        let mut temporal_sw = loq_sw;

        // Inter step-widths at LOQ0 are reduced by the temporal modifier.
        if temporal_idx == 0
            && loq == LoqIndex::Loq0
            && global.temporal_enabled
            && !frame.temporal_refresh
        {
            temporal_sw = fixed_point_temporal_sw(
                u32::from(global.temporal_step_width_modifier),
                temporal_sw as i16,
            );
        }

        for layer_idx in 0..layer_count {
            // Scaled quant matrix value, rounded up and clamped; qm_p in the
            // standard's terms. Safe in i64: layer_qm and temporal_sw are at
            // most 17 and 16 bits.
            let mut layer_qm = i64::from(quant_matrix[layer_idx]);
            layer_qm *= i64::from(temporal_sw);
            layer_qm += 1 << 16;
            layer_qm = layer_qm.clamp(0, QM_SCALE_MAX);
            layer_qm *= i64::from(temporal_sw);
            layer_qm >>= 16;

            let mut layer_sw =
                layer_qm.clamp(i64::from(MIN_STEP_WIDTH), i64::from(MAX_STEP_WIDTH)) as i32;

            let offset_actual = dequant_offset_actual(
                layer_sw,
                temporal_sw,
                frame.dequant_offset,
                frame.dequant_offset_mode,
            );
            let sw_modifier = step_width_modifier(
                layer_sw,
                offset_actual,
                frame.dequant_offset,
                frame.dequant_offset_mode,
            );

            layer_sw = (layer_sw + sw_modifier).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH);
            dequant.step_width[temporal_idx][layer_idx] = layer_sw as i16;

            let deadzone = deadzone_width(temporal_sw, layer_sw);
            dequant.offset[temporal_idx][layer_idx] = applied_dequant_offset(
                offset_actual,
                deadzone,
                frame.dequant_offset,
                frame.dequant_offset_mode,
            );
        }
    }

    dequant
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_configs(step_width: i32) -> (GlobalConfig, FrameConfig) {
        let mut global = GlobalConfig::default();
        global.transform = TransformType::Dds;
        global.num_layers = 16;
        let mut frame = FrameConfig::default();
        frame.step_widths = [step_width, step_width];
        frame.dequant_offset = -1;
        quant_matrix_set_default(
            &mut frame.quant_matrix,
            ScalingMode::Scale2D,
            TransformType::Dds,
            LoqIndex::Loq0,
        );
        quant_matrix_set_default(
            &mut frame.quant_matrix,
            ScalingMode::Scale2D,
            TransformType::Dds,
            LoqIndex::Loq1,
        );
        (global, frame)
    }

    #[test]
    fn test_default_matrices_layer_counts() {
        let mut matrix = QuantMatrix::default();
        quant_matrix_set_default(
            &mut matrix,
            ScalingMode::Scale1D,
            TransformType::Dd,
            LoqIndex::Loq0,
        );
        assert_eq!(&matrix.values[0][..4], &[0, 2, 0, 0]);

        quant_matrix_set_default(
            &mut matrix,
            ScalingMode::Scale2D,
            TransformType::Dds,
            LoqIndex::Loq1,
        );
        assert_eq!(matrix.values[1][..4], [0, 0, 0, 2]);
    }

    #[test]
    fn test_duplicate_loqs() {
        let mut matrix = QuantMatrix::default();
        matrix.values[0] = [7; 16];
        quant_matrix_duplicate_loqs(&mut matrix);
        assert_eq!(matrix.values[1], [7; 16]);
    }

    #[test]
    fn test_dequant_is_deterministic() {
        let (global, frame) = test_configs(1000);
        let a = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        let b = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_step_widths_clamped() {
        let (global, frame) = test_configs(32767);
        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        for temporal in 0..TEMPORAL_COUNT {
            for layer in 0..16 {
                let sw = i32::from(dequant.step_width[temporal][layer]);
                assert!((MIN_STEP_WIDTH..=MAX_STEP_WIDTH).contains(&sw));
            }
        }
    }

    #[test]
    fn test_zero_qm_layer_tracks_master_step_width() {
        // A zero quant-matrix entry leaves layer_qm = (1 << 16) after the
        // rounding constant, so the layer step-width equals the master. A
        // zero signalled offset keeps the step-width modifier at zero.
        let (global, mut frame) = test_configs(500);
        frame.dequant_offset = 0;
        frame.quant_matrix.values[0] = [0; 16];
        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        // Temporal is disabled, so Inter and Intra agree.
        assert_eq!(dequant.step_width[0][0], 500);
        assert_eq!(dequant.step_width[1][0], 500);
    }

    #[test]
    fn test_unset_offset_applies_log_modifier() {
        // With no signalled offset the step-width modifier formula applies:
        // ln_fp(500) = 6 + floor(0.214608 * 4096) / 4096, and
        // ((99614 - 5242 * ln_fp) * 500 * 500) / 2^31 = 7.
        let (global, mut frame) = test_configs(500);
        frame.quant_matrix.values[0] = [0; 16];
        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        assert_eq!(dequant.step_width[0][0], 507);
        assert_eq!(dequant.step_width[1][0], 507);
    }

    #[test]
    fn test_small_master_deadzone() {
        // master_sw <= 16 short-circuits the deadzone to master >> 1 and the
        // unset offset applies it negated.
        let (global, mut frame) = test_configs(16);
        frame.quant_matrix.values[0] = [0; 16];
        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        assert_eq!(dequant.offset[0][0], -8);
    }

    #[test]
    fn test_temporal_modifier_reduces_inter_step_width() {
        let (mut global, mut frame) = test_configs(1000);
        global.temporal_enabled = true;
        global.temporal_step_width_modifier = 48;
        frame.temporal_refresh = false;
        frame.dequant_offset = 0;
        frame.quant_matrix.values[0] = [0; 16];

        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        // modifier = 48 * 257 = 12336; multiplier = 65536 - 12336 = 53200;
        // inter sw = (53200 * 1000) >> 16 = 811.
        assert_eq!(dequant.step_width[0][0], 811);
        assert_eq!(dequant.step_width[1][0], 1000);
    }

    #[test]
    fn test_chroma_multiplier_applies_to_loq0_chroma_planes() {
        let (mut global, mut frame) = test_configs(1000);
        global.chroma_step_width_multiplier = 128;
        frame.dequant_offset = 0;
        frame.quant_matrix.values[0] = [0; 16];
        frame.quant_matrix.values[1] = [0; 16];

        let luma = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        let chroma = calculate_dequant(&global, &frame, 1, LoqIndex::Loq0);
        assert_eq!(luma.step_width[1][0], 1000);
        // (1000 * 128) >> 6 = 2000.
        assert_eq!(chroma.step_width[1][0], 2000);

        // LOQ1 chroma planes are not scaled.
        let chroma_loq1 = calculate_dequant(&global, &frame, 1, LoqIndex::Loq1);
        assert_eq!(chroma_loq1.step_width[1][0], 1000);
    }

    #[test]
    fn test_const_offset_mode() {
        let (global, mut frame) = test_configs(1000);
        frame.dequant_offset = 32;
        frame.dequant_offset_mode = DequantOffsetMode::ConstOffset;
        frame.quant_matrix.values[0] = [0; 16];

        let dequant = calculate_dequant(&global, &frame, 0, LoqIndex::Loq0);
        // ConstOffset never applies a step-width modifier.
        assert_eq!(dequant.step_width[1][0], 1000);
    }
}
