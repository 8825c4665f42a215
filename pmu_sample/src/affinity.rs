use crate::SampleError;
use log::debug;
use std::{io, mem};

/// Restricts the calling thread, and every process it spawns afterwards, to
/// `core`.
pub fn pin_to_core(core: u32) -> Result<(), SampleError> {
    let affinity = |source| SampleError::Affinity { core, source };
    if core as usize >= libc::CPU_SETSIZE as usize {
        return Err(affinity(io::Error::from_raw_os_error(libc::EINVAL)));
    }

    // Safety: `set` is a plain bitmask sized for `CPU_SETSIZE` cores and
    // `core` is in range.
    let result = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core as usize, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if result != 0 {
        return Err(affinity(io::Error::last_os_error()));
    }
    debug!("pinned to core {}", core);
    Ok(())
}
