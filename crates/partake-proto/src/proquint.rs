//! Proquint rendering of 64-bit tokens.
//!
//! A proquint is a pronounceable spelling of a 16-bit value: five characters
//! alternating consonant-vowel-consonant-vowel-consonant, encoding 4+2+4+2+4
//! bits MSB-first. A 64-bit token renders as four such groups separated by
//! hyphens, 23 characters total, e.g. `lusab-babad-gutih-tugad`. Used only in
//! log output; the wire always carries raw 64-bit tokens.

const CONSONANTS: &[u8; 16] = b"bdfghjklmnprstvz";
const VOWELS: &[u8; 4] = b"aiou";

/// Length of the rendering of a 64-bit value: four 5-character groups plus
/// three hyphens.
pub const PROQUINT_LEN: usize = 23;

fn push_u16(value: u16, out: &mut String) {
    out.push(CONSONANTS[usize::from(value >> 12) & 0xf] as char);
    out.push(VOWELS[usize::from(value >> 10) & 0x3] as char);
    out.push(CONSONANTS[usize::from(value >> 6) & 0xf] as char);
    out.push(VOWELS[usize::from(value >> 4) & 0x3] as char);
    out.push(CONSONANTS[usize::from(value) & 0xf] as char);
}

/// Encodes a 64-bit value as a 23-character proquint string.
pub fn encode_u64(value: u64) -> String {
    let mut out = String::with_capacity(PROQUINT_LEN);
    for group in 0..4 {
        if group > 0 {
            out.push('-');
        }
        push_u16((value >> (48 - 16 * group)) as u16, &mut out);
    }
    out
}

fn consonant_bits(ch: u8) -> Option<u16> {
    CONSONANTS.iter().position(|&c| c == ch).map(|i| i as u16)
}

fn vowel_bits(ch: u8) -> Option<u16> {
    VOWELS.iter().position(|&v| v == ch).map(|i| i as u16)
}

fn decode_group(group: &[u8]) -> Option<u16> {
    if group.len() != 5 {
        return None;
    }
    let mut value = consonant_bits(group[0])?;
    value = value << 2 | vowel_bits(group[1])?;
    value = value << 4 | consonant_bits(group[2])?;
    value = value << 2 | vowel_bits(group[3])?;
    value = value << 4 | consonant_bits(group[4])?;
    Some(value)
}

/// Decodes a 23-character proquint string back to its 64-bit value.
///
/// Returns `None` unless the input is exactly four valid groups separated by
/// single hyphens.
pub fn decode_u64(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    if bytes.len() != PROQUINT_LEN || bytes[5] != b'-' || bytes[11] != b'-' || bytes[17] != b'-' {
        return None;
    }
    let mut value = 0u64;
    for group in bytes.split(|&b| b == b'-') {
        value = value << 16 | u64::from(decode_group(group)?);
    }
    Some(value)
}
