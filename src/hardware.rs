//! The crate adapter boundary: everything the dispatcher needs from VME
//! crate hardware, abstracted behind a small trait so the dispatcher loop
//! never has to know whether it's talking to real bus hardware or a
//! simulated backend used for `--no-vme` and tests.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use crate::error::Error;

/// One open crate: an interrupt-notification endpoint plus enable/vector
/// register access.
pub trait CrateHandle {
    /// The file descriptor that becomes readable when one or more IRQ lines
    /// on this crate are pending. A single byte must be consumed from it to
    /// reset the notification.
    fn interrupt_fd(&self) -> RawFd;

    /// Consume the one-byte interrupt notification.
    fn consume_notification(&mut self) -> Result<(), Error>;

    /// Bitmask of currently pending IRQ lines (bit n = line n).
    fn pending(&self) -> Result<u8, Error>;

    /// Current interrupt enable mask.
    fn enable_get(&self) -> Result<u8, Error>;

    /// Overwrite the interrupt enable mask.
    fn enable_set(&mut self, mask: u8) -> Result<(), Error>;

    /// Perform the bus acknowledge cycle for `irq` (1..7), returning the
    /// concrete 32-bit vector.
    fn fetch_vector(&mut self, irq: u8) -> Result<u32, Error>;
}

/// Opens and enumerates crate hardware.
pub trait CrateAdapter {
    /// Attempt to open crate `n` (0..15). `Ok(None)` means no crate is
    /// present at that index; this is not an error.
    fn open(&mut self, crate_num: u8) -> Result<Option<Box<dyn CrateHandle>>, Error>;
}

/// Talks to the Linux character devices exposed for each crate:
/// `/dev/vme/crate<N>/irq` for the notification endpoint and
/// `/dev/vme/crate<N>/csr` for the enable/vector control region.
pub struct DeviceFileAdapter {
    device_root: String,
}

impl DeviceFileAdapter {
    pub fn new() -> Self {
        Self {
            device_root: "/dev/vme".to_string(),
        }
    }

    pub fn with_root(device_root: impl Into<String>) -> Self {
        Self {
            device_root: device_root.into(),
        }
    }
}

impl Default for DeviceFileAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct DeviceFileHandle {
    irq_file: File,
    csr_file: File,
}

impl CrateHandle for DeviceFileHandle {
    fn interrupt_fd(&self) -> RawFd {
        self.irq_file.as_raw_fd()
    }

    fn consume_notification(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; 1];
        self.irq_file.read_exact(&mut buf).map_err(Error::from)
    }

    fn pending(&self) -> Result<u8, Error> {
        read_register(&self.csr_file, CSR_PENDING_OFFSET)
    }

    fn enable_get(&self) -> Result<u8, Error> {
        read_register(&self.csr_file, CSR_ENABLE_OFFSET)
    }

    fn enable_set(&mut self, mask: u8) -> Result<(), Error> {
        write_register(&self.csr_file, CSR_ENABLE_OFFSET, mask)
    }

    fn fetch_vector(&mut self, irq: u8) -> Result<u32, Error> {
        let offset = CSR_VECTOR_BASE_OFFSET + (irq as i64) * 4;
        let mut buf = [0u8; 4];
        pread_exact(&self.csr_file, offset, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }
}

const CSR_PENDING_OFFSET: i64 = 0;
const CSR_ENABLE_OFFSET: i64 = 4;
const CSR_VECTOR_BASE_OFFSET: i64 = 8;

fn pread_exact(file: &File, offset: i64, buf: &mut [u8]) -> Result<(), Error> {
    let n = unsafe {
        libc::pread(
            file.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(Error::transport(format!(
            "pread at offset {offset} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if n as usize != buf.len() {
        return Err(Error::transport(format!("short pread at offset {offset}")));
    }
    Ok(())
}

fn pwrite_exact(file: &File, offset: i64, buf: &[u8]) -> Result<(), Error> {
    let n = unsafe {
        libc::pwrite(
            file.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(Error::transport(format!(
            "pwrite at offset {offset} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if n as usize != buf.len() {
        return Err(Error::transport(format!("short pwrite at offset {offset}")));
    }
    Ok(())
}

fn read_register(file: &File, offset: i64) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    pread_exact(file, offset, &mut buf)?;
    Ok(buf[0])
}

fn write_register(file: &File, offset: i64, value: u8) -> Result<(), Error> {
    pwrite_exact(file, offset, &[value])
}

impl CrateAdapter for DeviceFileAdapter {
    fn open(&mut self, crate_num: u8) -> Result<Option<Box<dyn CrateHandle>>, Error> {
        let irq_path = format!("{}/crate{}/irq", self.device_root, crate_num);
        let csr_path = format!("{}/crate{}/csr", self.device_root, crate_num);

        let irq_file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&irq_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from(e)),
        };
        let csr_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&csr_path)
            .map_err(Error::from)?;

        Ok(Some(Box::new(DeviceFileHandle { irq_file, csr_file })))
    }
}

/// An in-process simulated crate used for `--no-vme` and automated tests. No
/// crates are ever "present"; the dispatcher runs with zero crate endpoints
/// and only the client-side `--fake-ok` path exercises delivery.
pub struct SimulatedAdapter;

impl CrateAdapter for SimulatedAdapter {
    fn open(&mut self, _crate_num: u8) -> Result<Option<Box<dyn CrateHandle>>, Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_adapter_never_opens_a_crate() {
        let mut adapter = SimulatedAdapter;
        for n in 0..16 {
            assert!(adapter.open(n).unwrap().is_none());
        }
    }
}
