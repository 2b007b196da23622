use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

pub const KFD_DEVICE_PATH: &str = "/dev/kfd";

/// Something that can open the kernel driver's device node.
pub trait DeviceNode: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn DeviceHandle>>;
}

/// A live channel to the kernel driver. Dropping it closes the channel.
pub trait DeviceHandle: Send + fmt::Debug {
    fn raw_fd(&self) -> RawFd;
}

/// The character device exposed by the kernel fusion driver.
#[derive(Debug, Clone)]
pub struct KfdNode {
    path: PathBuf,
}

impl KfdNode {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for KfdNode {
    fn default() -> Self {
        Self::new(KFD_DEVICE_PATH)
    }
}

impl DeviceNode for KfdNode {
    fn open(&self) -> io::Result<Box<dyn DeviceHandle>> {
        // The channel belongs to this process; never leak it into exec'd
        // children.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path)?;
        Ok(Box::new(KfdHandle { file }))
    }
}

#[derive(Debug)]
pub struct KfdHandle {
    file: File,
}

impl DeviceHandle for KfdHandle {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// System page size and its log2 shift, probed at cold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub size: usize,
    pub shift: u32,
}

impl PageGeometry {
    pub fn probe() -> Self {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = usize::try_from(raw).ok().filter(|size| *size > 0).unwrap_or(4096);
        Self::from_size(size)
    }

    pub(crate) fn from_size(size: usize) -> Self {
        Self {
            size,
            shift: size.trailing_zeros(),
        }
    }
}
