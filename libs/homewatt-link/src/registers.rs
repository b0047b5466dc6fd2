//! Modbus register decoding
//!
//! Multi-word values use big-endian word order: the first register holds the
//! most significant 16 bits. Signed values are two's complement.

/// Reinterpret one register as a signed 16-bit value
pub fn to_i16(word: u16) -> i16 {
    i16::from_ne_bytes(word.to_ne_bytes())
}

/// Two registers as an unsigned 32-bit value
pub fn to_u32(words: [u16; 2]) -> u32 {
    (u32::from(words[0]) << 16) | u32::from(words[1])
}

/// Two registers as a signed 32-bit value
pub fn to_i32(words: [u16; 2]) -> i32 {
    i32::from_ne_bytes(to_u32(words).to_ne_bytes())
}

/// Four registers as an unsigned 64-bit composite
pub fn to_u64(words: [u16; 4]) -> u64 {
    (u64::from(words[0]) << 48)
        | (u64::from(words[1]) << 32)
        | (u64::from(words[2]) << 16)
        | u64::from(words[3])
}

/// Four registers as a signed 64-bit value
pub fn to_i64(words: [u16; 4]) -> i64 {
    i64::from_ne_bytes(to_u64(words).to_ne_bytes())
}

/// Two registers as an IEEE-754 single precision float
pub fn to_f32(words: [u16; 2]) -> f32 {
    f32::from_bits(to_u32(words))
}

/// One character per register, taken from the low byte
pub fn to_string(words: &[u16]) -> String {
    words.iter().map(|w| char::from(*w as u8)).collect()
}

/// 16 flag bits from one register; bit 0 is the least significant bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitSet16(pub u16);

impl BitSet16 {
    pub fn is_set(&self, bit: u32) -> bool {
        bit < 16 && self.0 & (1 << bit) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.0.count_ones()
    }
}

/// 32 flag bits from two registers (first register is the high half)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitSet32(pub u32);

impl BitSet32 {
    pub fn is_set(&self, bit: u32) -> bool {
        bit < 32 && self.0 & (1 << bit) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.0.count_ones()
    }
}

pub fn to_bitset16(word: u16) -> BitSet16 {
    BitSet16(word)
}

pub fn to_bitset32(words: [u16; 2]) -> BitSet32 {
    BitSet32(to_u32(words))
}
