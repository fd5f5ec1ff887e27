//! Entropy decoding of coefficient, temporal and size chunks
//!
//! Coefficients are s8.7 fixed point values split across up to three
//! Huffman symbol streams interleaved in one chunk: the low bits (LSB),
//! the optional high bits (MSB) and the run of zeros that follows. Bit 0 of
//! an LSB symbol signals that an MSB symbol follows; bit 7 of any symbol
//! signals that a run-length symbol follows.
//!
//! Temporal chunks carry a run-length coded binary signal (Inter/Intra),
//! and size chunks carry the compressed per-tile chunk sizes. A chunk
//! flagged RLE-only skips the Huffman tables entirely and feeds the same
//! symbol algebra from raw bytes.

use crate::config::{BitstreamVersion, Chunk, TemporalSignal};
use crate::error::{Error, Result};
use crate::huffman::{next_symbol_is_msb, next_symbol_is_rl, HuffmanStream, HuffmanTable};

/// Entropy decoder flavours. The flavour decides how many Huffman streams
/// the chunk head carries and which decode entry point is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyDecoderType {
    /// Coefficient decoding: LSB, MSB and run-length streams.
    Default,
    /// Temporal signal runs: one stream per temporal context.
    Temporal,
    /// Unsigned compressed sizes: LSB and MSB streams.
    SizeUnsigned,
    /// Signed compressed sizes: LSB and MSB streams.
    SizeSigned,
}

/// Temporal context indices: one Huffman stream per current signal value.
const HUFF_TEMPORAL_COUNT: usize = 2;

/// Decoder over one chunk of entropy-coded data.
///
/// States: freshly constructed decoders are `Ready`; decode calls yield
/// symbols until the chunk's data is exhausted, after which the surrounding
/// zero-run bookkeeping prevents further calls. A disabled chunk yields
/// `None` from every decode call.
pub struct EntropyDecoder<'a> {
    /// Current temporal Huffman context (0 or 1).
    curr_context: usize,
    /// Symbols read so far; the first temporal symbol is sent raw.
    raw_offset: usize,
    /// One table per symbol stream: [LSB, MSB, RL] for `Default`, two for
    /// the other flavours.
    tables: Vec<HuffmanTable>,
    stream: Option<HuffmanStream<'a>>,
    rle_only: bool,
    rle_data: &'a [u8],
    entropy_enabled: bool,
    decoder_type: EntropyDecoderType,
}

impl<'a> EntropyDecoder<'a> {
    /// Initialize a decoder for `chunk`, whose bytes are `data`.
    ///
    /// For RLE-only chunks no Huffman tables are read and all decodes
    /// degrade to the raw path; otherwise the canonical tables are parsed
    /// from the head of the chunk. Construction is O(alphabet size).
    pub fn new(
        chunk: &Chunk,
        data: &'a [u8],
        decoder_type: EntropyDecoderType,
        version: BitstreamVersion,
    ) -> Result<Self> {
        let mut decoder = EntropyDecoder {
            curr_context: 0,
            raw_offset: 0,
            tables: Vec::new(),
            stream: None,
            rle_only: false,
            rle_data: &[],
            entropy_enabled: chunk.entropy_enabled,
            decoder_type,
        };

        if !chunk.entropy_enabled || data.is_empty() {
            decoder.entropy_enabled = decoder.entropy_enabled && !data.is_empty();
            return Ok(decoder);
        }

        if chunk.rle_only {
            decoder.rle_only = true;
            decoder.rle_data = data;
            return Ok(decoder);
        }

        let mut stream = HuffmanStream::new(data)?;
        let table_count = match decoder_type {
            EntropyDecoderType::Default => 3,
            _ => HUFF_TEMPORAL_COUNT,
        };
        for _ in 0..table_count {
            decoder.tables.push(HuffmanTable::parse(&mut stream, version)?);
        }
        decoder.stream = Some(stream);

        Ok(decoder)
    }

    /// Next raw symbol in RLE-only mode.
    fn next_rle_symbol(&mut self) -> Result<u8> {
        let symbol = *self
            .rle_data
            .get(self.raw_offset)
            .ok_or_else(|| Error::bitstream("RLE chunk exhausted"))?;
        self.raw_offset += 1;
        Ok(symbol)
    }

    /// Decode one symbol from the given Huffman stream index.
    fn next_huffman_symbol(&mut self, table: usize) -> Result<u8> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::invalid_state("Entropy decoder has no stream"))?;
        self.tables[table].decode(stream)
    }

    /// Flip the temporal context when a run completes. The first symbol
    /// carries the initial context in bit 0.
    fn toggle_temporal_context(&mut self, symbol: u8) {
        if self.raw_offset == 1 {
            self.curr_context = usize::from(symbol & 0x01);
        } else if symbol & 0x80 == 0 {
            self.curr_context ^= 1;
        }
    }

    fn next_temporal_symbol(&mut self) -> Result<u8> {
        let symbol = if self.rle_only {
            self.next_rle_symbol()?
        } else if self.raw_offset == 0 {
            // First byte is sent raw to establish the initial context.
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::invalid_state("Entropy decoder has no stream"))?;
            let symbol = stream.read_bits(8)? as u8;
            self.raw_offset += 1;
            symbol
        } else {
            let symbol = self.next_huffman_symbol(self.curr_context)?;
            self.raw_offset += 1;
            symbol
        };

        self.toggle_temporal_context(symbol);
        Ok(symbol)
    }

    /// Decode the next coefficient and the run of zero coefficients that
    /// follows it.
    ///
    /// Returns `None` when the chunk carries no data at all (the caller
    /// treats the whole surface as one zero run).
    pub fn decode(&mut self) -> Result<Option<(i16, u32)>> {
        debug_assert_eq!(self.decoder_type, EntropyDecoderType::Default);

        if !self.entropy_enabled {
            return Ok(None);
        }

        let mut symbol = if self.rle_only {
            self.next_rle_symbol()?
        } else {
            self.next_huffman_symbol(0)?
        };

        let mut value: i16;
        if next_symbol_is_msb(symbol) {
            value = i16::from(symbol & 0xFE);

            symbol = if self.rle_only {
                self.next_rle_symbol()?
            } else {
                self.next_huffman_symbol(1)?
            };

            let exp = i32::from(symbol & 0x7F) << 8 | i32::from(value);
            value = (exp - 0x4000) as i16;
            value >>= 1;
        } else {
            value = i16::from(symbol & 0x7E) - 0x40;
            value >>= 1;
        }

        let mut zeros = 0u32;
        while next_symbol_is_rl(symbol) {
            symbol = if self.rle_only {
                self.next_rle_symbol()?
            } else {
                self.next_huffman_symbol(2)?
            };
            zeros = (zeros << 7) | u32::from(symbol & 0x7F);
        }

        Ok(Some((value, zeros)))
    }

    /// Decode the next temporal signal and its run length (inclusive of the
    /// current transform unit).
    ///
    /// Returns `None` when the chunk carries no data at all.
    pub fn decode_temporal(&mut self) -> Result<Option<(TemporalSignal, u32)>> {
        debug_assert_eq!(self.decoder_type, EntropyDecoderType::Temporal);

        if !self.entropy_enabled {
            return Ok(None);
        }

        // The signal we are in when this run completes.
        let mut value = self.curr_context as u8;
        if self.raw_offset == 0 {
            let symbol = self.next_temporal_symbol()?;
            value = symbol & 0x01;
        }

        let mut count = 0u32;
        loop {
            let symbol = self.next_temporal_symbol()?;
            count = (count << 7) | u32::from(symbol & 0x7F);
            if symbol & 0x80 == 0 {
                break;
            }
        }

        let signal = if value == 0 {
            TemporalSignal::Inter
        } else {
            TemporalSignal::Intra
        };
        Ok(Some((signal, count)))
    }

    /// Decode the next compressed chunk size.
    pub fn decode_size(&mut self) -> Result<i16> {
        debug_assert!(matches!(
            self.decoder_type,
            EntropyDecoderType::SizeUnsigned | EntropyDecoderType::SizeSigned
        ));
        debug_assert!(!self.rle_only);

        let lsb = self.next_huffman_symbol(0)?;

        if lsb & 0x01 != 0 {
            let msb = self.next_huffman_symbol(1)?;
            let value = u16::from(msb) << 7 | u16::from(lsb >> 1);

            if self.decoder_type == EntropyDecoderType::SizeSigned {
                // Sign-extend from 15 bits.
                Ok((((value & 0x4000) << 1) | value) as i16)
            } else {
                Ok(value as i16)
            }
        } else if self.decoder_type == EntropyDecoderType::SizeSigned {
            // Sign-extend the 7-bit value: broadcast bit 6 to bit 7, then
            // widen through i8.
            let value = lsb >> 1;
            Ok(i16::from((((value & 0x40) << 1) | value) as i8))
        } else {
            Ok(i16::from(lsb >> 1))
        }
    }

    /// Number of bytes the decoder has consumed from the chunk.
    pub fn consumed_bytes(&self) -> usize {
        match &self.stream {
            Some(stream) => stream.consumed_bytes(),
            None => self.raw_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rle_chunk(size: usize) -> Chunk {
        Chunk {
            offset: 0,
            size,
            rle_only: true,
            entropy_enabled: true,
        }
    }

    #[test]
    fn test_disabled_chunk_yields_no_data() {
        let chunk = Chunk {
            offset: 0,
            size: 0,
            rle_only: false,
            entropy_enabled: false,
        };
        let mut decoder = EntropyDecoder::new(
            &chunk,
            &[],
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_rle_only_coefficient_decode() {
        // LSB symbol 0x46: bit0 clear (no MSB), bit7 clear (no run).
        // value = ((0x46 & 0x7E) - 0x40) >> 1 = 3.
        let data = [0x46];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (value, zeros) = decoder.decode().unwrap().unwrap();
        assert_eq!(value, 3);
        assert_eq!(zeros, 0);
    }

    #[test]
    fn test_rle_only_coefficient_with_run() {
        // LSB 0xC6: bit7 set -> run follows; value = ((0xC6 & 0x7E) - 0x40) >> 1 = 3.
        // Run symbols: 0x81, 0x05 -> zeros = (1 << 7) | 5 = 133.
        let data = [0xC6, 0x81, 0x05];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (value, zeros) = decoder.decode().unwrap().unwrap();
        assert_eq!(value, 3);
        assert_eq!(zeros, 133);
    }

    #[test]
    fn test_rle_only_coefficient_with_msb() {
        // LSB 0x03: bit0 set -> MSB follows. MSB 0x41.
        // exp = (0x41 & 0x7F) << 8 | (0x03 & 0xFE) = 0x4102
        // value = (0x4102 - 0x4000) >> 1 = 0x102 >> 1 = 129.
        let data = [0x03, 0x41];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (value, zeros) = decoder.decode().unwrap().unwrap();
        assert_eq!(value, 129);
        assert_eq!(zeros, 0);
    }

    #[test]
    fn test_rle_only_negative_coefficient() {
        // LSB 0x00: value = ((0x00 & 0x7E) - 0x40) >> 1 = -32.
        let data = [0x00];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (value, _) = decoder.decode().unwrap().unwrap();
        assert_eq!(value, -32);
    }

    #[test]
    fn test_rle_exhaustion_is_an_error() {
        let data = [0xC6]; // promises a run symbol that never arrives
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Default,
            BitstreamVersion::CURRENT,
        )
        .unwrap();
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_temporal_rle_decode() {
        // First byte raw: bit0 = 1 -> start Intra. Runs: 0x05 (5, ends ->
        // flip to Inter context), then 0x03 (3).
        let data = [0x01, 0x05, 0x03];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Temporal,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (signal, count) = decoder.decode_temporal().unwrap().unwrap();
        assert_eq!(signal, TemporalSignal::Intra);
        assert_eq!(count, 5);

        let (signal, count) = decoder.decode_temporal().unwrap().unwrap();
        assert_eq!(signal, TemporalSignal::Inter);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_temporal_multi_group_count() {
        // Initial context Inter; run = (2 << 7) | 1 = 257 over two groups.
        let data = [0x00, 0x82, 0x01];
        let mut decoder = EntropyDecoder::new(
            &rle_chunk(data.len()),
            &data,
            EntropyDecoderType::Temporal,
            BitstreamVersion::CURRENT,
        )
        .unwrap();

        let (signal, count) = decoder.decode_temporal().unwrap().unwrap();
        assert_eq!(signal, TemporalSignal::Inter);
        assert_eq!(count, 257);
    }

    /// Build a size chunk whose two Huffman tables are single-symbol, so
    /// the payload needs no code bits at all.
    fn single_symbol_size_chunk(lsb: u8, msb: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut acc = 0u32;
        let mut bits = 0u8;
        let mut push = |acc: &mut u32, bits: &mut u8, value: u32, width: u8| {
            for i in (0..width).rev() {
                *acc = (*acc << 1) | ((value >> i) & 1);
                *bits += 1;
                if *bits == 8 {
                    bytes.push(*acc as u8);
                    *acc = 0;
                    *bits = 0;
                }
            }
        };
        // LSB table: min 0, max 0, symbol.
        push(&mut acc, &mut bits, 0, 5);
        push(&mut acc, &mut bits, 0, 5);
        push(&mut acc, &mut bits, u32::from(lsb), 8);
        // MSB table.
        push(&mut acc, &mut bits, 0, 5);
        push(&mut acc, &mut bits, 0, 5);
        push(&mut acc, &mut bits, u32::from(msb), 8);
        if bits > 0 {
            bytes.push((acc << (8 - bits)) as u8);
        }
        bytes
    }

    #[test]
    fn test_size_decode_unsigned() {
        // lsb = 0x15: bit0 set -> msb follows; value = (2 << 7) | (0x15 >> 1) = 266.
        let data = single_symbol_size_chunk(0x15, 2);
        let chunk = Chunk {
            offset: 0,
            size: data.len(),
            rle_only: false,
            entropy_enabled: true,
        };
        let mut decoder = EntropyDecoder::new(
            &chunk,
            &data,
            EntropyDecoderType::SizeUnsigned,
            BitstreamVersion::CURRENT,
        )
        .unwrap();
        assert_eq!(decoder.decode_size().unwrap(), 266);
    }

    #[test]
    fn test_size_decode_signed_seven_bit() {
        // lsb = 0xFE: bit0 clear; 7-bit value 0x7F sign-extends to -1.
        let data = single_symbol_size_chunk(0xFE, 0);
        let chunk = Chunk {
            offset: 0,
            size: data.len(),
            rle_only: false,
            entropy_enabled: true,
        };
        let mut decoder = EntropyDecoder::new(
            &chunk,
            &data,
            EntropyDecoderType::SizeSigned,
            BitstreamVersion::CURRENT,
        )
        .unwrap();
        assert_eq!(decoder.decode_size().unwrap(), -1);
    }

    #[test]
    fn test_size_decode_signed_fifteen_bit() {
        // lsb = 0xFF: bit0 set; msb = 0xFF -> value = 0x7FFF -> sign-extends to -1.
        let data = single_symbol_size_chunk(0xFF, 0xFF);
        let chunk = Chunk {
            offset: 0,
            size: data.len(),
            rle_only: false,
            entropy_enabled: true,
        };
        let mut decoder = EntropyDecoder::new(
            &chunk,
            &data,
            EntropyDecoderType::SizeSigned,
            BitstreamVersion::CURRENT,
        )
        .unwrap();
        assert_eq!(decoder.decode_size().unwrap(), -1);
    }
}
