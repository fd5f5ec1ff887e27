//! Canonical Huffman decoding for entropy-coded chunks
//!
//! Each entropy-coded chunk starts with one code-length table per symbol
//! stream. The table header stores the minimum and maximum code length
//! (5 bits each) followed by either a 256-entry presence bitmap or an
//! explicit (symbol, length) list, with lengths coded as deltas from the
//! minimum in a version-dependent bit width.
//!
//! Code words are canonical: symbols are ordered by (length ascending,
//! symbol descending) and codes counted up starting from the longest
//! length, so a table can be rebuilt from lengths alone.
//!
//! Decoding is table-driven to avoid per-bit tree walks: a first-level
//! 256-entry table indexed by the next 8 bits resolves every code of up to
//! 8 bits directly, and longer codes link to a secondary table indexed by
//! the bits beyond the shared 8-bit prefix.

use crate::config::BitstreamVersion;
use crate::error::{Error, Result};

/// Maximum number of symbols a table can carry, fixed by the stream format:
/// the dense encoding is a 256-bit presence bitmap.
pub const MAX_NUM_SYMBOLS: usize = 256;

/// Code lengths are stored in 5 bits, so 31 is the largest length a stream
/// can signal.
pub const MAX_CODE_LENGTH: u8 = 31;

/// Width of the first-level lookup table index in bits.
const PRIMARY_BITS: u8 = 8;

/// True when the symbol signals that an MSB symbol follows.
#[inline]
pub fn next_symbol_is_msb(symbol: u8) -> bool {
    symbol & 0x01 != 0
}

/// True when the symbol signals that a run-length symbol follows.
#[inline]
pub fn next_symbol_is_rl(symbol: u8) -> bool {
    symbol & 0x80 != 0
}

/// Bit window over a chunk's bytes for Huffman decoding.
///
/// Keeps up to 56 bits buffered left-aligned in a 64-bit accumulator so the
/// decoder can peek whole code words at once. Bits past the end of the chunk
/// read as zero; the consumed-bit count keeps advancing so byte accounting
/// stays exact.
#[derive(Debug, Clone)]
pub struct HuffmanStream<'a> {
    data: &'a [u8],
    byte_offset: usize,
    /// Buffered bits, left-aligned (next bit to read is bit 63).
    acc: u64,
    /// Number of valid bits in `acc`.
    acc_bits: u8,
    /// Total bits consumed from the stream, padding included.
    bits_consumed: u64,
}

impl<'a> HuffmanStream<'a> {
    /// Create a stream over `data`. Fails on an empty slice.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_input("Huffman stream must not be empty"));
        }
        Ok(HuffmanStream {
            data,
            byte_offset: 0,
            acc: 0,
            acc_bits: 0,
            bits_consumed: 0,
        })
    }

    fn refill(&mut self) {
        while self.acc_bits <= 56 && self.byte_offset < self.data.len() {
            self.acc |= u64::from(self.data[self.byte_offset]) << (56 - self.acc_bits);
            self.acc_bits += 8;
            self.byte_offset += 1;
        }
    }

    /// Peek the next `num_bits` (1..=32) without consuming. Bits beyond the
    /// stream end read as zero.
    #[inline]
    pub fn peek_bits(&mut self, num_bits: u8) -> u32 {
        debug_assert!(num_bits >= 1 && num_bits <= 32);
        self.refill();
        (self.acc >> (64 - num_bits)) as u32
    }

    /// Consume `num_bits`, which may run into the zero padding at the end of
    /// the stream.
    #[inline]
    pub fn consume(&mut self, num_bits: u8) {
        self.acc = if num_bits >= 64 { 0 } else { self.acc << num_bits };
        self.acc_bits = self.acc_bits.saturating_sub(num_bits);
        self.bits_consumed += u64::from(num_bits);
    }

    /// Bounds-checked read used while parsing table headers, where running
    /// into the padding indicates a truncated chunk.
    pub fn read_bits(&mut self, num_bits: u8) -> Result<u32> {
        if num_bits == 0 {
            return Ok(0);
        }
        if self.remaining_bits() < num_bits as usize {
            return Err(Error::bitstream("Huffman stream exhausted"));
        }
        let value = self.peek_bits(num_bits);
        self.consume(num_bits);
        Ok(value)
    }

    /// Bits not yet consumed (real bits, not padding).
    pub fn remaining_bits(&self) -> usize {
        self.acc_bits as usize + (self.data.len() - self.byte_offset) * 8
    }

    /// Bytes consumed so far, partially consumed bytes rounded up.
    pub fn consumed_bytes(&self) -> usize {
        ((self.bits_consumed + 7) >> 3) as usize
    }
}

/// A symbol with its canonical code word.
#[derive(Debug, Clone, Copy, Default)]
struct CodeEntry {
    code: u32,
    symbol: u8,
    bits: u8,
}

/// First-level lookup table entry.
#[derive(Debug, Clone, Copy)]
enum PrimaryEntry {
    /// No code starts with these 8 bits.
    Invalid,
    /// A code of up to 8 bits: symbol plus its true length.
    Leaf { symbol: u8, bits: u8 },
    /// Codes longer than 8 bits share this prefix; index of the secondary
    /// table covering them.
    Link { table: u16 },
}

/// Secondary table covering all codes that share one 8-bit prefix.
#[derive(Debug, Clone)]
struct SecondaryTable {
    /// Bits to index with beyond the primary 8.
    extra_bits: u8,
    /// (symbol, total bits) per slot; bits of 0 marks an invalid code.
    entries: Vec<(u8, u8)>,
}

/// Code-length bit widths per bitstream version, `ceil(log2(x + 1))` as laid
/// down by the standard revisions (each of the first three versions changed
/// the table).
fn length_delta_bits(delta: u8, version: BitstreamVersion) -> Result<u8> {
    const TABLES: [[u8; 32]; 3] = [
        [
            1, 1, 2, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, //
            5, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
        ],
        [
            1, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
            5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
        ],
        [
            0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
            5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
        ],
    ];

    // Older streams indexed the table with max - min + 1, newer ones with
    // max - min.
    let index = if version < BitstreamVersion::NewCodeLengths {
        delta as usize + 1
    } else {
        delta as usize
    };

    if index > 31 {
        return Err(Error::bitstream("Huffman code length delta out of range"));
    }

    let table = (version as usize).min(BitstreamVersion::AlignWithSpec as usize);
    Ok(TABLES[table][index])
}

/// A fully constructed canonical Huffman decoder for one symbol stream.
#[derive(Debug, Clone)]
pub struct HuffmanTable {
    primary: Vec<PrimaryEntry>,
    secondary: Vec<SecondaryTable>,
    /// Set when the alphabet has exactly one symbol; decoding consumes no bits.
    single_symbol: Option<u8>,
    /// Set when the table was signalled empty.
    empty: bool,
}

impl HuffmanTable {
    /// Parse a code-length table from the head of `stream` and build the
    /// lookup tables.
    pub fn parse(stream: &mut HuffmanStream<'_>, version: BitstreamVersion) -> Result<Self> {
        let min_length = stream.read_bits(5)? as u8;
        let max_length = stream.read_bits(5)? as u8;

        if max_length < min_length {
            return Err(Error::bitstream(format!(
                "Huffman max code length {} below min length {}",
                max_length, min_length
            )));
        }

        if min_length == MAX_CODE_LENGTH && max_length == MAX_CODE_LENGTH {
            // Signalled empty table.
            return Ok(HuffmanTable {
                primary: Vec::new(),
                secondary: Vec::new(),
                single_symbol: None,
                empty: true,
            });
        }

        if min_length == 0 && max_length == 0 {
            // Single symbol alphabet, sent raw.
            let symbol = stream.read_bits(8)? as u8;
            return Ok(HuffmanTable {
                primary: Vec::new(),
                secondary: Vec::new(),
                single_symbol: Some(symbol),
                empty: false,
            });
        }

        let delta_bits = length_delta_bits(max_length - min_length, version)?;

        let mut entries: Vec<CodeEntry> = Vec::new();

        // A presence bitmap is used when many symbols appear; otherwise a
        // 5-bit count of explicit (symbol, length) pairs.
        let use_bitmap = stream.read_bits(1)? != 0;
        if use_bitmap {
            for symbol in 0..MAX_NUM_SYMBOLS {
                if stream.read_bits(1)? != 0 {
                    let delta = stream.read_bits(delta_bits)? as u8;
                    entries.push(CodeEntry {
                        code: 0,
                        symbol: symbol as u8,
                        bits: delta + min_length,
                    });
                }
            }
        } else {
            let symbol_count = stream.read_bits(5)?;
            if symbol_count == 0 {
                return Err(Error::bitstream("Huffman table with zero symbols"));
            }
            for _ in 0..symbol_count {
                let symbol = stream.read_bits(8)? as u8;
                let delta = stream.read_bits(delta_bits)? as u8;
                entries.push(CodeEntry {
                    code: 0,
                    symbol,
                    bits: delta + min_length,
                });
            }
        }

        // Ascending length, then descending symbol.
        entries.sort_by(|a, b| a.bits.cmp(&b.bits).then(b.symbol.cmp(&a.symbol)));

        assign_canonical_codes(&mut entries, max_length);

        Self::build(&entries)
    }

    /// Build the two-level lookup tables from assigned canonical codes.
    fn build(entries: &[CodeEntry]) -> Result<Self> {
        let mut primary = vec![PrimaryEntry::Invalid; 1 << PRIMARY_BITS];
        let mut secondary: Vec<SecondaryTable> = Vec::new();

        // Longest code under each 8-bit prefix sizes that prefix's
        // secondary table.
        let mut prefix_max = [0u8; 1 << PRIMARY_BITS];
        for entry in entries {
            if entry.bits == 0 || entry.bits > MAX_CODE_LENGTH {
                return Err(Error::bitstream("Huffman code length out of range"));
            }
            if entry.bits > PRIMARY_BITS {
                let prefix = (entry.code >> (entry.bits - PRIMARY_BITS)) as usize;
                prefix_max[prefix] = prefix_max[prefix].max(entry.bits);
            }
        }

        for entry in entries {
            if entry.bits <= PRIMARY_BITS {
                // Replicate across every index sharing this code as a prefix.
                let shift = PRIMARY_BITS - entry.bits;
                let start = (entry.code << shift) as usize;
                for slot in &mut primary[start..start + (1usize << shift)] {
                    *slot = PrimaryEntry::Leaf {
                        symbol: entry.symbol,
                        bits: entry.bits,
                    };
                }
            } else {
                let prefix = (entry.code >> (entry.bits - PRIMARY_BITS)) as usize;
                let extra_bits = prefix_max[prefix] - PRIMARY_BITS;

                let table_index = match primary[prefix] {
                    PrimaryEntry::Link { table } => table as usize,
                    PrimaryEntry::Invalid => {
                        let table = secondary.len();
                        secondary.push(SecondaryTable {
                            extra_bits,
                            entries: vec![(0, 0); 1usize << extra_bits],
                        });
                        primary[prefix] = PrimaryEntry::Link {
                            table: table as u16,
                        };
                        table
                    }
                    PrimaryEntry::Leaf { .. } => {
                        return Err(Error::bitstream("Huffman code prefix collision"));
                    }
                };

                let sub = &mut secondary[table_index];
                let suffix_bits = entry.bits - PRIMARY_BITS;
                let suffix = entry.code & ((1u32 << suffix_bits) - 1);
                let shift = sub.extra_bits - suffix_bits;
                let start = (suffix << shift) as usize;
                for slot in &mut sub.entries[start..start + (1usize << shift)] {
                    *slot = (entry.symbol, entry.bits);
                }
            }
        }

        Ok(HuffmanTable {
            primary,
            secondary,
            single_symbol: None,
            empty: false,
        })
    }

    /// True when the table was signalled empty.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// The table's single symbol, when the alphabet has exactly one entry.
    pub fn single_symbol(&self) -> Option<u8> {
        self.single_symbol
    }

    /// Decode the next symbol from `stream`.
    ///
    /// A single-symbol table consumes no bits. Per-symbol cost is O(1):
    /// one primary lookup, plus one secondary lookup for codes longer than
    /// 8 bits.
    pub fn decode(&self, stream: &mut HuffmanStream<'_>) -> Result<u8> {
        if let Some(symbol) = self.single_symbol {
            return Ok(symbol);
        }
        if self.empty {
            return Err(Error::bitstream("Decode from empty Huffman table"));
        }

        let index = stream.peek_bits(PRIMARY_BITS) as usize;
        match self.primary[index] {
            PrimaryEntry::Leaf { symbol, bits } => {
                stream.consume(bits);
                Ok(symbol)
            }
            PrimaryEntry::Link { table } => {
                let sub = &self.secondary[table as usize];
                let window = stream.peek_bits(PRIMARY_BITS + sub.extra_bits);
                let sub_index = (window & ((1u32 << sub.extra_bits) - 1)) as usize;
                let (symbol, bits) = sub.entries[sub_index];
                if bits == 0 {
                    return Err(Error::bitstream("Invalid Huffman code"));
                }
                stream.consume(bits);
                Ok(symbol)
            }
            PrimaryEntry::Invalid => Err(Error::bitstream("Invalid Huffman code")),
        }
    }
}

/// Assign canonical code words: iterate from the longest codes (end of the
/// sorted list) counting up, shifting right each time the length steps down.
fn assign_canonical_codes(entries: &mut [CodeEntry], max_length: u8) {
    let mut current_length = max_length;
    let mut current_code = 0u32;

    for entry in entries.iter_mut().rev() {
        if entry.bits < current_length {
            current_code >>= current_length - entry.bits;
            current_length = entry.bits;
        }
        entry.code = current_code;
        current_code += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-level writer for building table headers in tests.
    struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            BitWriter {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        fn push(&mut self, value: u32, bits: u8) {
            for i in (0..bits).rev() {
                if self.bit == 0 {
                    self.bytes.push(0);
                }
                let byte = self.bytes.last_mut().unwrap();
                *byte |= (((value >> i) & 1) as u8) << (7 - self.bit);
                self.bit = (self.bit + 1) % 8;
            }
        }

        fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    #[test]
    fn test_stream_peek_and_consume() {
        let data = [0b1010_1010, 0b0101_0101];
        let mut stream = HuffmanStream::new(&data).unwrap();

        assert_eq!(stream.peek_bits(4), 0b1010);
        stream.consume(4);
        assert_eq!(stream.peek_bits(8), 0b1010_0101);
        stream.consume(8);
        assert_eq!(stream.consumed_bytes(), 2);
    }

    #[test]
    fn test_stream_pads_zeros_past_end() {
        let data = [0xFF];
        let mut stream = HuffmanStream::new(&data).unwrap();
        stream.consume(8);
        assert_eq!(stream.peek_bits(8), 0);
        assert_eq!(stream.remaining_bits(), 0);
    }

    #[test]
    fn test_single_symbol_table() {
        // min = 0, max = 0 (5 bits each), then the 8-bit symbol.
        let mut writer = BitWriter::new();
        writer.push(0, 5);
        writer.push(0, 5);
        writer.push(0x42, 8);
        let data = writer.finish();

        let mut stream = HuffmanStream::new(&data).unwrap();
        let table = HuffmanTable::parse(&mut stream, BitstreamVersion::AlignWithSpec).unwrap();
        assert_eq!(table.single_symbol(), Some(0x42));

        // Decoding consumes no bits.
        let consumed = stream.consumed_bytes();
        assert_eq!(table.decode(&mut stream).unwrap(), 0x42);
        assert_eq!(stream.consumed_bytes(), consumed);
    }

    #[test]
    fn test_empty_table() {
        let mut writer = BitWriter::new();
        writer.push(31, 5);
        writer.push(31, 5);
        let data = writer.finish();

        let mut stream = HuffmanStream::new(&data).unwrap();
        let table = HuffmanTable::parse(&mut stream, BitstreamVersion::AlignWithSpec).unwrap();
        assert!(table.is_empty());
        assert!(table.decode(&mut stream).is_err());
    }

    #[test]
    fn test_rejects_inverted_lengths() {
        let mut writer = BitWriter::new();
        writer.push(5, 5);
        writer.push(2, 5);
        let data = writer.finish();

        let mut stream = HuffmanStream::new(&data).unwrap();
        assert!(HuffmanTable::parse(&mut stream, BitstreamVersion::AlignWithSpec).is_err());
    }

    /// Encode a symbol-count style table with the given (symbol, length)
    /// pairs and decode each symbol back.
    fn round_trip(lengths: &[(u8, u8)], version: BitstreamVersion) -> HuffmanTable {
        let min = lengths.iter().map(|&(_, b)| b).min().unwrap();
        let max = lengths.iter().map(|&(_, b)| b).max().unwrap();
        let delta_bits = length_delta_bits(max - min, version).unwrap();

        let mut writer = BitWriter::new();
        writer.push(min as u32, 5);
        writer.push(max as u32, 5);
        writer.push(0, 1); // explicit list, not a bitmap
        writer.push(lengths.len() as u32, 5);
        for &(symbol, bits) in lengths {
            writer.push(symbol as u32, 8);
            writer.push((bits - min) as u32, delta_bits);
        }
        let data = writer.finish();

        let mut stream = HuffmanStream::new(&data).unwrap();
        HuffmanTable::parse(&mut stream, version).unwrap()
    }

    #[test]
    fn test_canonical_decode() {
        // Lengths: a=1, b=2, c=3, d=3. Canonical assignment counts up from
        // the longest codes: sorted (asc bits, desc symbol) is
        // [a:1, b:2, d:3, c:3] so c=0b000, d=0b001, b=0b01, a=0b1.
        let table = round_trip(
            &[(b'a', 1), (b'b', 2), (b'c', 3), (b'd', 3)],
            BitstreamVersion::AlignWithSpec,
        );

        // Stream: a b c d a -> 1 01 000 001 1, packed MSB first.
        let data = [0b1010_0000, 0b1100_0000];
        let mut stream = HuffmanStream::new(&data).unwrap();
        assert_eq!(table.decode(&mut stream).unwrap(), b'a');
        assert_eq!(table.decode(&mut stream).unwrap(), b'b');
        assert_eq!(table.decode(&mut stream).unwrap(), b'c');
        assert_eq!(table.decode(&mut stream).unwrap(), b'd');
        assert_eq!(table.decode(&mut stream).unwrap(), b'a');
    }

    #[test]
    fn test_long_codes_use_secondary_table() {
        // A complete code with lengths 1..=10 plus a second 10-bit code.
        // Canonical assignment gives every length below 10 the code 0..01
        // and the two 10-bit codes 0000000000 / 0000000001.
        let lengths: Vec<(u8, u8)> = (1u8..=10).map(|i| (i, i)).chain([(11, 10)]).collect();
        let table = round_trip(&lengths, BitstreamVersion::AlignWithSpec);

        // Stream: symbol 10 (0000000000), symbol 9 (000000001), symbol 1 (1).
        let data = [0x00, 0x00, 0b1100_0000];
        let mut stream = HuffmanStream::new(&data).unwrap();
        assert_eq!(table.decode(&mut stream).unwrap(), 10);
        assert_eq!(table.decode(&mut stream).unwrap(), 9);
        assert_eq!(table.decode(&mut stream).unwrap(), 1);
    }

    #[test]
    fn test_version_length_bit_widths() {
        // delta 1: version Initial indexes entry 2 (width 2), NewCodeLengths
        // indexes entry 1 (width 1).
        assert_eq!(length_delta_bits(1, BitstreamVersion::Initial).unwrap(), 2);
        assert_eq!(
            length_delta_bits(1, BitstreamVersion::NewCodeLengths).unwrap(),
            1
        );
        assert_eq!(
            length_delta_bits(0, BitstreamVersion::AlignWithSpec).unwrap(),
            0
        );
    }
}
