//! AUX channel read/write primitives
//!
//! This module provides low-level DPCD access through the kernel's
//! `/dev/drm_dp_auxN` character devices, where the file offset is the DPCD
//! address. For shared, locked access use the handle types in dplink-agent.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;

pub type Result<T> = std::result::Result<T, AuxError>;

/// Size of the DPCD address space (20-bit addresses)
pub const DPCD_ADDRESS_SPACE: u32 = 0x10_0000;

/// Errors that can occur during AUX operations
#[derive(Debug, thiserror::Error)]
pub enum AuxError {
    #[error("Failed to open AUX device {path}: {source}")]
    OpenFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to read DPCD 0x{address:05X} ({len} bytes): {source}")]
    ReadFailed {
        address: u32,
        len: usize,
        source: std::io::Error,
    },

    #[error("Failed to write DPCD 0x{address:05X} ({len} bytes): {source}")]
    WriteFailed {
        address: u32,
        len: usize,
        source: std::io::Error,
    },

    #[error("Failed to seek to DPCD 0x{address:05X}: {source}")]
    SeekFailed {
        address: u32,
        source: std::io::Error,
    },

    #[error("DPCD range 0x{address:05X}+{len} is outside the address space")]
    AddressOutOfRange { address: u32, len: usize },
}

/// Path of the AUX character device with the given index
pub fn aux_device_path(index: u32) -> String {
    format!("/dev/drm_dp_aux{index}")
}

/// Open an AUX character device for reading and writing
///
/// # Errors
///
/// Returns an error if the device does not exist or the caller lacks
/// permission (usually root is required).
pub fn open_aux(index: u32) -> Result<File> {
    let path = aux_device_path(index);
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC) // Every DPCD write is its own AUX transaction
        .open(&path)
        .map_err(|e| AuxError::OpenFailed { path, source: e })
}

fn check_range(address: u32, len: usize) -> Result<()> {
    let end = address as u64 + len as u64;
    if end > DPCD_ADDRESS_SPACE as u64 {
        return Err(AuxError::AddressOutOfRange { address, len });
    }
    Ok(())
}

/// Read `buf.len()` bytes of DPCD starting at `address`
///
/// # Example
///
/// ```ignore
/// use dplink_raw::{open_aux, read_dpcd};
///
/// let mut aux = open_aux(0)?;
/// let mut rev = [0u8; 1];
/// read_dpcd(&mut aux, 0x000, &mut rev)?;
/// println!("DPCD rev {:x}", rev[0]);
/// ```
pub fn read_dpcd(file: &mut File, address: u32, buf: &mut [u8]) -> Result<()> {
    check_range(address, buf.len())?;

    file.seek(SeekFrom::Start(address as u64))
        .map_err(|e| AuxError::SeekFailed { address, source: e })?;

    file.read_exact(buf).map_err(|e| AuxError::ReadFailed {
        address,
        len: buf.len(),
        source: e,
    })
}

/// Write `data` to DPCD starting at `address`
///
/// # Errors
///
/// Returns an error if the sink NAKs or defers the transaction past the
/// kernel's retry budget, or if the range is outside the DPCD address space.
pub fn write_dpcd(file: &mut File, address: u32, data: &[u8]) -> Result<()> {
    check_range(address, data.len())?;

    file.seek(SeekFrom::Start(address as u64))
        .map_err(|e| AuxError::SeekFailed { address, source: e })?;

    file.write_all(data).map_err(|e| AuxError::WriteFailed {
        address,
        len: data.len(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aux_error_display() {
        let err = AuxError::OpenFailed {
            path: aux_device_path(3),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("/dev/drm_dp_aux3"));
    }

    #[test]
    fn test_range_check() {
        assert!(check_range(0xF_FFFF, 1).is_ok());
        assert!(matches!(
            check_range(0xF_FFFF, 2),
            Err(AuxError::AddressOutOfRange { .. })
        ));
    }
}
