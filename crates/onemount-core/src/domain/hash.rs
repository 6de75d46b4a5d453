//! QuickXorHash content hash
//!
//! Streaming implementation of the service's content hash: a 160-bit value
//! where each input byte is XORed into a window that rotates by 11 bits per
//! byte, and the total length is XORed into the last eight bytes on
//! finalization. Output is Base64, matching the `quickXorHash` strings the
//! service reports.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Width of the hash window in bits.
const WIDTH_BITS: usize = 160;

/// Rotation per input byte.
const SHIFT: usize = 11;

/// Streaming QuickXorHash state.
///
/// Feed bytes with [`update`](Self::update) in any chunking; the result is
/// identical to a single-shot hash of the concatenation.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    data: [u64; 3],
    shift_so_far: usize,
    length: u64,
}

impl QuickXorHasher {
    /// Fresh hasher state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0; 3],
            shift_so_far: 0,
            length: 0,
        }
    }

    /// Absorbs a chunk of content bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        let mut vector_array_index = self.shift_so_far / 64;
        let mut vector_offset = self.shift_so_far % 64;
        let iterations = bytes.len().min(WIDTH_BITS);

        for i in 0..iterations {
            let is_last_cell = vector_array_index == self.data.len() - 1;
            let bits_in_vector_cell = if is_last_cell { WIDTH_BITS % 64 } else { 64 };

            if vector_offset <= bits_in_vector_cell - 8 {
                let mut j = i;
                while j < bytes.len() {
                    self.data[vector_array_index] ^= u64::from(bytes[j]) << vector_offset;
                    j += WIDTH_BITS;
                }
            } else {
                let index1 = vector_array_index;
                let index2 = if is_last_cell { 0 } else { vector_array_index + 1 };
                let low = (bits_in_vector_cell - vector_offset) as u32;

                let mut xored_byte = 0u8;
                let mut j = i;
                while j < bytes.len() {
                    xored_byte ^= bytes[j];
                    j += WIDTH_BITS;
                }
                self.data[index1] ^= u64::from(xored_byte) << vector_offset;
                self.data[index2] ^= u64::from(xored_byte) >> low;
            }

            vector_offset += SHIFT;
            while vector_offset >= bits_in_vector_cell {
                vector_array_index = if is_last_cell {
                    0
                } else {
                    vector_array_index + 1
                };
                vector_offset -= bits_in_vector_cell;
            }
        }

        self.shift_so_far = (self.shift_so_far + SHIFT * (bytes.len() % WIDTH_BITS)) % WIDTH_BITS;
        self.length = self.length.wrapping_add(bytes.len() as u64);
    }

    /// Produces the 20-byte digest.
    #[must_use]
    pub fn finalize_bytes(&self) -> [u8; 20] {
        let mut rgb = [0u8; 20];
        rgb[0..8].copy_from_slice(&self.data[0].to_le_bytes());
        rgb[8..16].copy_from_slice(&self.data[1].to_le_bytes());
        rgb[16..20].copy_from_slice(&self.data[2].to_le_bytes()[..4]);

        let length_bytes = self.length.to_le_bytes();
        for (i, b) in length_bytes.iter().enumerate() {
            rgb[WIDTH_BITS / 8 - length_bytes.len() + i] ^= b;
        }
        rgb
    }

    /// Produces the Base64 digest string the service compares against.
    #[must_use]
    pub fn finalize_base64(&self) -> String {
        BASE64.encode(self.finalize_bytes())
    }

    /// One-shot hash of a byte slice.
    #[must_use]
    pub fn hash_base64(bytes: &[u8]) -> String {
        let mut hasher = Self::new();
        hasher.update(bytes);
        hasher.finalize_base64()
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_all_zero() {
        let hasher = QuickXorHasher::new();
        assert_eq!(hasher.finalize_bytes(), [0u8; 20]);
        assert_eq!(
            hasher.finalize_base64(),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAA="
        );
    }

    #[test]
    fn test_single_byte_placement() {
        let mut hasher = QuickXorHasher::new();
        hasher.update(&[0x01]);
        let rgb = hasher.finalize_bytes();

        // byte lands at bit 0; length 1 is XORed into byte 12
        assert_eq!(rgb[0], 0x01);
        assert_eq!(rgb[12], 0x01);
        for (i, b) in rgb.iter().enumerate() {
            if i != 0 && i != 12 {
                assert_eq!(*b, 0, "byte {i} should be zero");
            }
        }
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let content: Vec<u8> = (0u16..10_000).map(|i| (i % 251) as u8).collect();
        let one_shot = QuickXorHasher::hash_base64(&content);

        let mut incremental = QuickXorHasher::new();
        for chunk in content.chunks(173) {
            incremental.update(chunk);
        }
        assert_eq!(incremental.finalize_base64(), one_shot);

        // a different chunking again agrees
        let mut by_one = QuickXorHasher::new();
        for b in &content {
            by_one.update(std::slice::from_ref(b));
        }
        assert_eq!(by_one.finalize_base64(), one_shot);
    }

    #[test]
    fn test_length_distinguishes_trailing_zeroes() {
        let a = QuickXorHasher::hash_base64(b"data");
        let b = QuickXorHasher::hash_base64(b"data\0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_deterministic() {
        let a = QuickXorHasher::hash_base64(b"hello world");
        let b = QuickXorHasher::hash_base64(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, QuickXorHasher::hash_base64(b"hello worle"));
    }

    #[test]
    fn test_digest_is_20_bytes() {
        let digest = QuickXorHasher::hash_base64(b"some content");
        let raw = BASE64.decode(digest).unwrap();
        assert_eq!(raw.len(), 20);
    }
}
