//! Firmware file loading and block access.
//!
//! The upgrade orchestrator never reads the file during transfer; the whole
//! image is validated and loaded up front, and blocks are served from memory
//! in answer to device requests.

use crate::error::{Error, Result};
use log::debug;
use std::path::Path;

/// Maximum accepted firmware file size (50 MB).
pub const MAX_FIRMWARE_SIZE: usize = 50 * 1024 * 1024;

/// Number of leading bytes sent to the device when asking whether the
/// image is acceptable.
pub const HEADER_LEN: usize = 32;

/// Validate and load a firmware file.
///
/// The file must exist, be non-empty, and not exceed [`MAX_FIRMWARE_SIZE`].
pub fn validate(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(Error::FirmwareInvalid(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let data = std::fs::read(path)?;

    if data.is_empty() {
        return Err(Error::FirmwareInvalid(format!(
            "file is empty: {}",
            path.display()
        )));
    }
    if data.len() > MAX_FIRMWARE_SIZE {
        return Err(Error::FirmwareInvalid(format!(
            "file is {} bytes, maximum is {} bytes",
            data.len(),
            MAX_FIRMWARE_SIZE
        )));
    }

    debug!("Loaded firmware: {} ({} bytes)", path.display(), data.len());
    Ok(data)
}

/// Read a block out of the firmware image, clamped to the available length.
///
/// Requests past the end of the image yield an empty slice.
pub fn read_block(data: &[u8], offset: u32, length: u16) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = (start + length as usize).min(data.len());
    &data[start..end]
}

/// The image header bytes used by the can-update inquiry.
pub fn header(data: &[u8]) -> &[u8] {
    &data[..data.len().min(HEADER_LEN)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_missing_file() {
        let result = validate(Path::new("/nonexistent/firmware.bin"));
        assert!(matches!(result, Err(Error::FirmwareInvalid(_))));
    }

    #[test]
    fn test_validate_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = validate(file.path());
        assert!(matches!(result, Err(Error::FirmwareInvalid(_))));
    }

    #[test]
    fn test_validate_ok() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAA; 128]).unwrap();
        let data = validate(file.path()).unwrap();
        assert_eq!(data.len(), 128);
        assert_eq!(data[0], 0xAA);
    }

    #[test]
    fn test_read_block_clamps_to_length() {
        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(read_block(&data, 0, 3), &[1, 2, 3]);
        assert_eq!(read_block(&data, 3, 10), &[4, 5]);
        assert_eq!(read_block(&data, 5, 4), &[] as &[u8]);
        assert_eq!(read_block(&data, 100, 4), &[] as &[u8]);
    }

    #[test]
    fn test_header_short_image() {
        let data = [7u8; 10];
        assert_eq!(header(&data), &data[..]);

        let data = [7u8; 100];
        assert_eq!(header(&data).len(), HEADER_LEN);
    }
}
