//! WebSocket frame masking utilities
//!
//! Masking XORs payload bytes with a repeating 4-byte key. Applying the same
//! key twice restores the original bytes, so one function serves both directions.
//!
//! Supports multiple RNG backends via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG

/// Apply a WebSocket mask in place
///
/// Processes 8 bytes at a time, then finishes the tail byte by byte.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a WebSocket mask starting at `offset` bytes into the key cycle
///
/// Useful when a payload is masked in several chunks.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    let rotated = [
        mask[offset & 3],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    let mask_u64 = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Chunks of 8 keep the key phase, so the tail starts at phase 0 again
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a random mask for WebSocket client frames.
///
/// If both features are enabled, `getrandom` wins.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];
    fill_random(&mut mask);
    mask
}

/// Fill `buf` with random bytes from the selected RNG backend
///
/// Falls back to `fastrand` if the OS entropy source is unavailable.
#[cfg(feature = "getrandom")]
pub(crate) fn fill_random(buf: &mut [u8]) {
    if let Err(e) = getrandom::getrandom(buf) {
        tracing::warn!(error = %e, "OS entropy unavailable, using fastrand");
        fastrand::fill(buf);
    }
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
pub(crate) fn fill_random(buf: &mut [u8]) {
    fastrand::fill(buf);
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
pub(crate) fn fill_random(_buf: &mut [u8]) {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}
