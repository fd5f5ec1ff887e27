//! ZVE - enhancement-layer video decoding in pure Rust
//!
//! ZVE decodes the compressed enhancement layer of an LCEVC-style video
//! stream: per-tile entropy-coded residual data is turned into fully
//! dequantized, inverse-transformed residual values, packaged into one of
//! two command buffer encodings for a downstream pixel-apply stage.
//!
//! # Architecture
//!
//! - `bitstream`: byte and bit level readers over the raw payload
//! - `huffman`: canonical Huffman tables and table-driven decoding
//! - `entropy`: coefficient, temporal and size stream decoders
//! - `config`: global/frame configuration, the payload parser and the
//!   config pool that shares global configs across in-flight frames
//! - `dequant`: quant-matrix handling and dequantization tables
//! - `transform`: the standardized DD (2x2) and DDS (4x4) inverse
//!   transforms
//! - `transform_unit`: traversal of the transform-unit layouts
//! - `cmdbuffer`: the CPU and GPU command buffer output formats
//! - `decode`: the per-tile decode loop tying the stages together
//!
//! # Usage
//!
//! Feed each frame's payload through a [`config::pool::ConfigPool`] to get
//! its configuration, then call [`decode::decode_enhancement`] once per
//! (LOQ, plane, tile) with a [`decode::CmdBufferTarget`] to fill:
//!
//! ```no_run
//! use zve_lib::config::pool::ConfigPool;
//! use zve_lib::config::{LoqIndex, NalType};
//! use zve_lib::cmdbuffer::CmdBufferCpu;
//! use zve_lib::decode::{decode_enhancement, CmdBufferTarget};
//!
//! # fn run(payload: &[u8]) -> zve_lib::Result<()> {
//! let mut pool = ConfigPool::new(None);
//! let (global, frame) = pool.frame_insert(0, NalType::Idr, payload)?;
//!
//! let mut buffer = CmdBufferCpu::new(0)?;
//! buffer.reset(global.transform.layer_count() as u8)?;
//! decode_enhancement(
//!     &global,
//!     &frame,
//!     LoqIndex::Loq0,
//!     0,
//!     0,
//!     CmdBufferTarget::Cpu(&mut buffer),
//! )?;
//!
//! pool.frame_release(frame, global);
//! # Ok(())
//! # }
//! ```
//!
//! No component here spawns threads or blocks; calls are synchronous and
//! CPU bound. Tiles decode independently, so callers are free to fan
//! decode calls out across a thread pool with one command buffer per tile.

pub mod bitstream;
pub mod cmdbuffer;
pub mod config;
pub mod decode;
pub mod dequant;
pub mod entropy;
pub mod error;
pub mod huffman;
pub mod transform;
pub mod transform_unit;

pub use error::{Error, Result};

/// ZVE version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
