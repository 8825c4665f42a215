use pmu_device::DeviceError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use x86_perf_counter::CounterError;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control request failed: {0}")]
    Control(#[source] io::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("undefined level {0}")]
    UnrecognizedLevel(u64),
    #[error("invalid event file: {0}")]
    EventFile(#[from] serde_json::Error),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("rdpmc sampling requires an x86_64 host")]
    Unsupported,
    #[error("cannot pin to core {core}: {source}")]
    Affinity {
        core: u32,
        #[source]
        source: io::Error,
    },
}

impl SampleError {
    /// Maps an I/O error on `path` into [`SampleError::Io`].
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| SampleError::Io { path, source }
    }
}
