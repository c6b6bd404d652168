#![forbid(unsafe_code)]

/// Checksum of one storage block, salted with its block number so a block
/// copied to the wrong position fails verification.
pub fn block_crc32(block_no: u64, header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block_no.to_be_bytes());
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a file store header, computed over every byte before the
/// trailing checksum field.
pub fn header_crc32(header: &[u8]) -> u32 {
    crc32fast::hash(header)
}
