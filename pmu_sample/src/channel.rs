//! Backends that carry start/stop requests to the counter programmer.

use crate::SampleError;
use log::{debug, info};
use pmu_device::{Opcode, RawStartParam, Session};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::{io, ptr};
use x86_perf_counter::{CounterSet, RegisterPort};

/// The two requests a sampling run issues.
pub trait ControlChannel {
    fn request_start(&mut self, events: &CounterSet) -> Result<(), SampleError>;
    fn request_stop(&mut self) -> Result<(), SampleError>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for &mut C {
    fn request_start(&mut self, events: &CounterSet) -> Result<(), SampleError> {
        (**self).request_start(events)
    }

    fn request_stop(&mut self) -> Result<(), SampleError> {
        (**self).request_stop()
    }
}

/// The control device node published by the kernel module.
#[derive(Debug)]
pub struct DeviceFile {
    file: File,
    path: PathBuf,
}

impl DeviceFile {
    /// Opens the device node at `path`.
    ///
    /// # Errors
    ///
    /// [`SampleError::Io`] if `path` cannot be opened or is not a character
    /// device. Opcodes 1 and 2 mean something else to an ordinary file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SampleError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(SampleError::io(path))?;
        let metadata = file.metadata().map_err(SampleError::io(path))?;
        if !metadata.file_type().is_char_device() {
            return Err(SampleError::io(path)(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a character device",
            )));
        }
        info!("opened {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The node this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue ioctl against the open device
    ///
    /// # Safety
    ///
    /// `data` must be valid for whatever the driver copies in or out for
    /// `cmd`.
    unsafe fn ioctl(&self, cmd: u32, data: *mut libc::c_void) -> io::Result<i32> {
        match unsafe { libc::ioctl(self.as_raw_fd(), cmd as _, data) } {
            -1 => Err(io::Error::last_os_error()),
            other => Ok(other),
        }
    }
}

impl AsRawFd for DeviceFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl ControlChannel for DeviceFile {
    fn request_start(&mut self, events: &CounterSet) -> Result<(), SampleError> {
        let mut param = RawStartParam::from(events);
        debug!("{}: start with {} events", self.path.display(), param.count);
        // Safety: the driver copies exactly one `RawStartParam` in.
        unsafe { self.ioctl(Opcode::Start.into(), ptr::addr_of_mut!(param).cast()) }
            .map_err(SampleError::Control)?;
        Ok(())
    }

    fn request_stop(&mut self) -> Result<(), SampleError> {
        debug!("{}: stop", self.path.display());
        // Safety: stop carries no payload, the argument is never dereferenced.
        unsafe { self.ioctl(Opcode::Stop.into(), ptr::null_mut()) }
            .map_err(SampleError::Control)?;
        Ok(())
    }
}

/// A session on a device hosted in this process.
impl<P: RegisterPort> ControlChannel for Session<'_, P> {
    fn request_start(&mut self, events: &CounterSet) -> Result<(), SampleError> {
        Ok(Session::request_start(self, events)?)
    }

    fn request_stop(&mut self) -> Result<(), SampleError> {
        Ok(Session::request_stop(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmu_device::PmuDevice;
    use x86_perf_counter::emulation::EmulatedPort;
    use x86_perf_counter::{CoreId, EventSpec, Programmer, ProgrammerConfig};

    #[test]
    fn test_missing_device_node() {
        let err = DeviceFile::open("/nonexistent/acrn_pmu").unwrap_err();
        assert!(matches!(err, SampleError::Io { .. }));
        assert!(err.to_string().starts_with("/nonexistent/acrn_pmu"));
    }

    #[test]
    fn test_regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        match DeviceFile::open(file.path()) {
            Err(SampleError::Io { path, source }) => {
                assert_eq!(path, file.path());
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_foreign_char_device_rejects_requests() {
        let mut device = DeviceFile::open("/dev/null").unwrap();
        assert_eq!(device.path(), Path::new("/dev/null"));
        assert!(matches!(
            device.request_start(&CounterSet::empty()),
            Err(SampleError::Control(_))
        ));
        assert!(matches!(device.request_stop(), Err(SampleError::Control(_))));
    }

    #[test]
    fn test_session_channel() {
        let device = PmuDevice::new(Programmer::new(
            EmulatedPort::new(1),
            CoreId(0),
            ProgrammerConfig::default(),
        ));
        let mut session = device.open().unwrap();
        let channel: &mut dyn ControlChannel = &mut session;

        let events = CounterSet::new(&[EventSpec::new(0x3c, 0)]).unwrap();
        channel.request_start(&events).unwrap();
        assert!(matches!(
            channel.request_start(&events),
            Err(SampleError::Device(_))
        ));
        channel.request_stop().unwrap();
        assert!(!device.state().unwrap().is_armed());
    }
}
