//! A [`RegisterPort`] over the Linux `msr` driver, for hosting the control
//! device in-process instead of in the kernel.
//!
//! Requires the `msr` module and root. User-mode `rdpmc` is controlled by the
//! perf subsystem's `rdpmc` knob, which applies to every core at once; while
//! counters are armed this way the kernel's own perf users (the NMI watchdog
//! in particular) must be idle.

use log::{trace, warn};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::io;
use std::path::{Path, PathBuf};
use x86_perf_counter::{CoreId, PortError, RegisterPort};

pub const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";
pub const RDPMC_KNOB: &str = "/sys/bus/event_source/devices/cpu/rdpmc";

/// Knob value allowing `rdpmc` from any task.
const RDPMC_ANY_TASK: &str = "2";

/// The perf `rdpmc` knob. Granting remembers what was there before, revoking
/// puts it back.
#[derive(Debug)]
struct RdpmcKnob {
    path: PathBuf,
    saved: Option<String>,
}

impl RdpmcKnob {
    fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            saved: None,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn grant(&mut self) -> io::Result<()> {
        if self.saved.is_none() {
            let previous = fs::read_to_string(&self.path)?;
            self.saved = Some(previous.trim().to_string());
        }
        trace!("{} <- {}", self.path.display(), RDPMC_ANY_TASK);
        fs::write(&self.path, RDPMC_ANY_TASK)
    }

    /// A no-op unless an earlier grant is outstanding.
    fn revoke(&mut self) -> io::Result<()> {
        let Some(previous) = self.saved.as_deref() else {
            return Ok(());
        };
        trace!("{} <- {}", self.path.display(), previous);
        fs::write(&self.path, previous)?;
        self.saved = None;
        Ok(())
    }
}

pub struct MsrDevicePort {
    files: BTreeMap<CoreId, File>,
    rdpmc_knob: RdpmcKnob,
}

impl MsrDevicePort {
    /// Opens `/dev/cpu/N/msr` for every core in `cores`.
    pub fn open(cores: impl IntoIterator<Item = CoreId>) -> io::Result<Self> {
        let mut files = BTreeMap::new();
        for core in cores {
            let path = format!("/dev/cpu/{}/msr", core);
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            files.insert(core, file);
        }
        Ok(Self {
            files,
            rdpmc_knob: RdpmcKnob::at(RDPMC_KNOB),
        })
    }

    /// Opens every core listed in `/sys/devices/system/cpu/online`.
    pub fn open_online() -> io::Result<Self> {
        let list = fs::read_to_string(ONLINE_CPUS)?;
        let cores = parse_cpu_list(&list).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed cpu list {:?}", list.trim()),
            )
        })?;
        Self::open(cores)
    }

    fn file(&self, core: CoreId) -> Result<&File, PortError> {
        self.files.get(&core).ok_or(PortError::Unreachable(core))
    }
}

impl RegisterPort for MsrDevicePort {
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError> {
        let mut data = [0; 8];
        self.file(core)?
            .read_exact_at(&mut data, msr as u64)
            .map_err(|err| {
                warn!("core {}: reading msr {:#x}: {}", core, msr, err);
                PortError::Msr { core, msr }
            })?;
        Ok(u64::from_ne_bytes(data))
    }

    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        self.file(core)?
            .write_all_at(&value.to_ne_bytes(), msr as u64)
            .map_err(|err| {
                warn!("core {}: writing msr {:#x}: {}", core, msr, err);
                PortError::Msr { core, msr }
            })
    }

    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError> {
        self.file(core)?;
        let knob = &mut self.rdpmc_knob;
        let result = if enabled { knob.grant() } else { knob.revoke() };
        result.map_err(|err| {
            warn!("{}: {}", knob.path().display(), err);
            PortError::UserRead(core)
        })
    }

    fn online_cores(&self) -> Vec<CoreId> {
        self.files.keys().copied().collect()
    }
}

/// Parses a kernel cpu list such as `0-3,6,8-9`.
pub fn parse_cpu_list(list: &str) -> Option<Vec<CoreId>> {
    let mut cores = Vec::new();
    for range in list.trim().split(',').filter(|range| !range.is_empty()) {
        match range.split_once('-') {
            Some((first, last)) => {
                let first: u32 = first.parse().ok()?;
                let last: u32 = last.parse().ok()?;
                if first > last {
                    return None;
                }
                cores.extend((first..=last).map(CoreId));
            }
            None => cores.push(CoreId(range.parse().ok()?)),
        }
    }
    Some(cores)
}
