//! Chunk table bookkeeping and tiled chunk parsing
//!
//! Each frame's payload carries one entropy-coded chunk per (plane, LOQ,
//! tile, layer) plus, when temporal prediction is signalled, one temporal
//! chunk per (plane, tile). This module derives the chunk index layout,
//! parses the per-chunk flag and size tables, and hosts the two small
//! decoders the tiled encoded-data block uses for compressed
//! entropy-enabled flags and compressed chunk sizes.

use crate::bitstream::{BitReader, ByteStream};
use crate::config::{
    Chunk, FrameConfig, GlobalConfig, LoqIndex, TileCompressionSizePerTile, LOQ_ENHANCED_COUNT,
};
use crate::entropy::{EntropyDecoder, EntropyDecoderType};
use crate::error::{Error, Result};

/// Whether this frame carries temporal chunks (8.3.5.2).
pub fn temporal_chunk_enabled(frame: &FrameConfig, global: &GlobalConfig) -> bool {
    if frame.entropy_enabled {
        global.temporal_enabled && !frame.temporal_refresh
    } else {
        global.temporal_enabled && !frame.temporal_refresh && frame.temporal_signalling_present
    }
}

/// Precompute the per-plane chunk table offsets for quick chunk lookup.
pub fn calculate_tile_chunk_indices(frame: &mut FrameConfig, global: &GlobalConfig) {
    let mut offset = 0u32;

    frame.tile_chunk_residual_index = Default::default();
    frame.tile_chunk_temporal_index = Default::default();

    for plane in 0..global.num_planes as usize {
        // num_layers chunks per plane-loq-tile.
        if frame.entropy_enabled {
            for loq in 0..LOQ_ENHANCED_COUNT {
                let chunk_count = global.num_tiles[plane][loq] * u32::from(global.num_layers);
                frame.tile_chunk_residual_index[plane][loq] = offset;
                offset += chunk_count;
            }
        }

        // One chunk per plane-tile.
        if temporal_chunk_enabled(frame, global) {
            frame.tile_chunk_temporal_index[plane] = offset;
            offset += global.num_tiles[plane][LoqIndex::Loq0 as usize];
        }
    }
}

/// Size the frame's chunk table to match the current configuration.
pub fn chunk_table_resize(frame: &mut FrameConfig, global: &GlobalConfig) {
    let mut chunk_count = 0u32;

    if frame.entropy_enabled {
        for plane in 0..global.num_planes as usize {
            chunk_count += (global.num_tiles[plane][LoqIndex::Loq0 as usize]
                + global.num_tiles[plane][LoqIndex::Loq1 as usize])
                * u32::from(global.num_layers);
        }
    }

    if frame.temporal_signalling_present {
        for plane in 0..global.num_planes as usize {
            chunk_count += global.num_tiles[plane][LoqIndex::Loq0 as usize];
        }
    }

    frame.chunks.clear();
    frame.chunks.resize(chunk_count as usize, Chunk::default());
}

/// Parse one chunk's size and record its byte range within the payload.
///
/// `size_decoder` supplies compressed sizes for tiled streams; otherwise
/// the size is a multi-byte varint preceding the chunk data.
pub fn parse_chunk(
    stream: &mut ByteStream<'_>,
    chunk: &mut Chunk,
    loq_enabled: Option<&mut bool>,
    size_decoder: Option<&mut TiledSizeDecoder>,
) -> Result<()> {
    chunk.size = 0;

    if !chunk.entropy_enabled {
        return Ok(());
    }

    if let Some(decoder) = size_decoder {
        let size = decoder.read();
        if size < 0 {
            return Err(Error::bitstream("Failed to decode compressed chunk size"));
        }
        chunk.size = size as usize;
    } else {
        let size = stream.read_multi_byte()?;
        if size > i32::MAX as u64 {
            return Err(Error::bitstream("Chunk size exceeds supported range"));
        }
        chunk.size = size as usize;
    }

    // The LOQ has some data.
    if let Some(enabled) = loq_enabled {
        *enabled = true;
    }

    chunk.offset = stream.offset();
    stream.seek(chunk.size)?;

    Ok(())
}

/// Read the (entropy-enabled, RLE-only) flag pair for a run of chunks.
pub fn parse_chunk_flags(reader: &mut BitReader<'_>, chunks: &mut [Chunk]) -> Result<()> {
    for chunk in chunks {
        chunk.entropy_enabled = reader.read_bit()? != 0;
        chunk.rle_only = reader.read_bit()? != 0;
    }
    Ok(())
}

/// Run-length decoder for per-tile entropy-enabled flags: an initial raw
/// symbol (0 or 1) followed by multi-byte run lengths, flipping the symbol
/// between runs.
pub struct TiledRleDecoder {
    current_symbol: u8,
    run_length: u64,
}

impl TiledRleDecoder {
    /// Decode the initial symbol and first run from `stream`.
    pub fn new(stream: &mut ByteStream<'_>) -> Result<Self> {
        let current_symbol = stream.read_u8()?;
        if current_symbol > 1 {
            return Err(Error::bitstream("Tiled RLE initial symbol must be 0 or 1"));
        }
        let run_length = stream.read_multi_byte()?;

        Ok(TiledRleDecoder {
            current_symbol,
            run_length,
        })
    }

    /// Read the next flag.
    pub fn read(&mut self, stream: &mut ByteStream<'_>) -> Result<bool> {
        if self.run_length == 0 {
            self.run_length = stream.read_multi_byte()?;
            self.current_symbol ^= 1;

            if self.run_length == 0 {
                return Ok(self.current_symbol != 0);
            }
        }

        self.run_length -= 1;
        Ok(self.current_symbol != 0)
    }
}

/// Decoder for compressed per-tile chunk sizes: an entropy-coded size
/// stream, optionally delta-coded against the previous size.
#[derive(Default)]
pub struct TiledSizeDecoder {
    sizes: Vec<i16>,
    current_index: usize,
}

impl TiledSizeDecoder {
    /// Decode `num_sizes` sizes from the head of `stream` and advance it
    /// past the consumed bytes.
    pub fn initialize(
        &mut self,
        num_sizes: u32,
        stream: &mut ByteStream<'_>,
        compression: TileCompressionSizePerTile,
        version: crate::config::BitstreamVersion,
    ) -> Result<()> {
        let decoder_type = if compression == TileCompressionSizePerTile::Prefix {
            EntropyDecoderType::SizeUnsigned
        } else {
            EntropyDecoderType::SizeSigned
        };

        self.sizes.clear();
        self.current_index = 0;

        if num_sizes == 0 {
            return Ok(());
        }

        let chunk = Chunk {
            offset: 0,
            size: stream.remaining(),
            rle_only: false,
            entropy_enabled: true,
        };
        let mut decoder =
            EntropyDecoder::new(&chunk, stream.remaining_slice(), decoder_type, version)?;

        for _ in 0..num_sizes {
            self.sizes.push(decoder.decode_size()?);
        }

        stream.seek(decoder.consumed_bytes())?;

        if compression == TileCompressionSizePerTile::PrefixOnDiff {
            for i in 1..self.sizes.len() {
                self.sizes[i] = self.sizes[i].wrapping_add(self.sizes[i - 1]);
            }
        }

        Ok(())
    }

    /// Next decoded size, or -1 once exhausted.
    pub fn read(&mut self) -> i16 {
        if self.current_index < self.sizes.len() {
            let size = self.sizes[self.current_index];
            self.current_index += 1;
            size
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformType;

    fn test_global(num_planes: u8, temporal: bool) -> GlobalConfig {
        let mut global = GlobalConfig::default();
        global.num_planes = num_planes;
        global.num_layers = TransformType::Dds.layer_count() as u8;
        global.temporal_enabled = temporal;
        for plane in 0..num_planes as usize {
            global.num_tiles[plane] = [1, 1];
        }
        global
    }

    #[test]
    fn test_chunk_index_layout_single_plane() {
        let global = test_global(1, true);
        let mut frame = FrameConfig::default();
        frame.entropy_enabled = true;
        frame.temporal_signalling_present = true;

        calculate_tile_chunk_indices(&mut frame, &global);
        chunk_table_resize(&mut frame, &global);

        assert_eq!(frame.tile_chunk_residual_index[0][0], 0);
        assert_eq!(frame.tile_chunk_residual_index[0][1], 16);
        assert_eq!(frame.tile_chunk_temporal_index[0], 32);
        assert_eq!(frame.chunks.len(), 33);
    }

    #[test]
    fn test_chunk_index_layout_three_planes_no_temporal() {
        let global = test_global(3, false);
        let mut frame = FrameConfig::default();
        frame.entropy_enabled = true;

        calculate_tile_chunk_indices(&mut frame, &global);
        chunk_table_resize(&mut frame, &global);

        assert_eq!(frame.tile_chunk_residual_index[1][0], 32);
        assert_eq!(frame.tile_chunk_residual_index[2][1], 80);
        assert_eq!(frame.chunks.len(), 96);
    }

    #[test]
    fn test_temporal_chunk_enabled_rules() {
        let global = test_global(1, true);
        let mut frame = FrameConfig::default();

        frame.entropy_enabled = true;
        frame.temporal_refresh = false;
        assert!(temporal_chunk_enabled(&frame, &global));

        frame.temporal_refresh = true;
        assert!(!temporal_chunk_enabled(&frame, &global));

        // Without coefficient data, the signalling-present flag decides.
        frame.entropy_enabled = false;
        frame.temporal_refresh = false;
        frame.temporal_signalling_present = false;
        assert!(!temporal_chunk_enabled(&frame, &global));
        frame.temporal_signalling_present = true;
        assert!(temporal_chunk_enabled(&frame, &global));
    }

    #[test]
    fn test_parse_chunk_records_range() {
        let payload = [0x03, 0xAA, 0xBB, 0xCC, 0x99];
        let mut stream = ByteStream::new(&payload).unwrap();
        let mut chunk = Chunk {
            entropy_enabled: true,
            ..Chunk::default()
        };
        let mut loq_enabled = false;

        parse_chunk(&mut stream, &mut chunk, Some(&mut loq_enabled), None).unwrap();
        assert_eq!(chunk.offset, 1);
        assert_eq!(chunk.size, 3);
        assert!(loq_enabled);
        assert_eq!(stream.offset(), 4);
    }

    #[test]
    fn test_parse_chunk_disabled_reads_nothing() {
        let payload = [0x03, 0xAA];
        let mut stream = ByteStream::new(&payload).unwrap();
        let mut chunk = Chunk::default();
        let mut loq_enabled = false;

        parse_chunk(&mut stream, &mut chunk, Some(&mut loq_enabled), None).unwrap();
        assert_eq!(chunk.size, 0);
        assert!(!loq_enabled);
        assert_eq!(stream.offset(), 0);
    }

    #[test]
    fn test_parse_chunk_truncated_payload_fails() {
        let payload = [0x09, 0xAA];
        let mut stream = ByteStream::new(&payload).unwrap();
        let mut chunk = Chunk {
            entropy_enabled: true,
            ..Chunk::default()
        };
        assert!(parse_chunk(&mut stream, &mut chunk, None, None).is_err());
    }

    #[test]
    fn test_tiled_rle_decoder() {
        // Initial symbol 1 with run 3, then symbol 0 with run 2.
        let payload = [0x01, 0x03, 0x02];
        let mut stream = ByteStream::new(&payload).unwrap();
        let mut decoder = TiledRleDecoder::new(&mut stream).unwrap();

        for _ in 0..3 {
            assert!(decoder.read(&mut stream).unwrap());
        }
        for _ in 0..2 {
            assert!(!decoder.read(&mut stream).unwrap());
        }
    }

    #[test]
    fn test_tiled_rle_rejects_bad_symbol() {
        let payload = [0x02, 0x01];
        let mut stream = ByteStream::new(&payload).unwrap();
        assert!(TiledRleDecoder::new(&mut stream).is_err());
    }
}
