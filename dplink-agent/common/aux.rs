use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::io::AsRawFd;

use dplink_raw::register::{DpcdLayout, Register};

use crate::error::{DplinkError, Result};

/// A DPCD management channel
///
/// Implemented by the kernel AUX character device and by the simulated
/// endpoint in [`crate::sim`]. Every call is one transaction on the wire.
pub trait DpAux: Send + Sync {
    /// Name used in log prefixes, e.g. `AUX A/DDI A`
    fn name(&self) -> &str;

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&self, address: u32, data: &[u8]) -> Result<()>;

    fn read_byte(&self, address: u32) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&self, address: u32, value: u8) -> Result<()> {
        self.write(address, &[value])
    }
}

/// Read a typed single-byte register
pub fn read_layout<T: DpcdLayout>(aux: &dyn DpAux, address: u32) -> Result<Register<T>> {
    let value = aux.read_byte(address)?;
    Ok(Register::new(address, T::from_dpcd(value)))
}

/// Validate and write a typed single-byte register
pub fn write_layout<T: DpcdLayout>(aux: &dyn DpAux, reg: &Register<T>) -> Result<()> {
    reg.validate().map_err(|e| {
        DplinkError::HardwareError(format!("DPCD 0x{:05X}: {}", reg.address, e))
    })?;
    aux.write_byte(reg.address, reg.to_dpcd())
}

/// AUX channel backed by `/dev/drm_dp_auxN`
pub struct DevAux {
    file: Mutex<File>,
    name: String,
}

impl DevAux {
    pub fn open(index: u32) -> Result<Self> {
        let file = dplink_raw::open_aux(index)?;

        tracing::info!("Opened AUX handle {} for drm_dp_aux{}", file.as_raw_fd(), index);

        Ok(Self {
            file: Mutex::new(file),
            name: format!("drm_dp_aux{index}"),
        })
    }
}

impl DpAux for DevAux {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        dplink_raw::read_dpcd(&mut file, address, buf)?;
        tracing::debug!("[{}] DPCD read 0x{:05x}: {:02x?}", self.name, address, buf);
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        dplink_raw::write_dpcd(&mut file, address, data)?;
        tracing::debug!("[{}] DPCD write 0x{:05x}: {:02x?}", self.name, address, data);
        Ok(())
    }
}
