//! Command buffer output formats
//!
//! Decoded residuals are packaged into one of two machine-consumable
//! encodings for the downstream apply stage: a byte-oriented sequential
//! format for scalar/CPU consumption ([`cpu::CmdBufferCpu`]) and a
//! fixed-width block-bitmask format for GPU consumption
//! ([`gpu::CmdBufferGpu`]).

pub mod cpu;
pub mod gpu;

pub use cpu::{CmdBufferCpu, CpuCmd, EntryPoint};
pub use gpu::{CmdBufferGpu, CmdBufferGpuBuilder, GpuCmd, GpuOp};

/// Reorder DDS residuals into 2x2 quads as the apply stage consumes them.
/// The non-command-buffer pipeline reorders at apply time instead; here it
/// happens once at residual-generation time.
pub(crate) const DDS_RESIDUAL_ORDER: [usize; 16] =
    [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];
