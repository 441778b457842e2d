//! Payload masking (RFC 6455 §5.3).
//!
//! The key cycles with period 4 starting at payload offset 0, so applying the same
//! key twice is the identity.

/// Mask or unmask `buf` in place with `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }

    // the remainder starts on a multiple of 4, so the key restarts at index 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i];
    }
}

/// Byte-at-a-time reference implementation.
#[cfg(test)]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
