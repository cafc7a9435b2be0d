//! Small helpers shared by the on-disk/on-wire formats: little-endian field
//! packing used by the connect header, command header, and metadata file.

/// Reads a little-endian `u64` out of `buf` at `offset`.
pub fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
}

/// Reads a little-endian `u32` out of `buf` at `offset`.
pub fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"))
}

/// Writes a little-endian `u64` into `buf` at `offset`.
pub fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u32` into `buf` at `offset`.
pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// CRC-32C (Castagnoli) over `data`, as used by the connect header and the
/// metadata file sections.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}
