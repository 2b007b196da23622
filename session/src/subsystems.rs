//! Collaborators brought up on cold open and torn down on the last close.
//!
//! Each one follows the same contract: `init(node_count)` may fail,
//! `destroy()` must be callable at any time, including before `init` and
//! more than once.
//!
//! The default implementations keep their state behind ordinary mutexes
//! that a fork does not quiesce. The session only touches them under its
//! own lock; any other caller (for example [`EventsPage::ensure_mapped`])
//! must go through [`crate::Session::with_device`] so that a concurrent
//! fork cannot duplicate one of these mutexes while it is held.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::error::Result;
use crate::error::SessionError;

pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self, node_count: u32) -> Result<()>;

    fn destroy(&self);

    /// Releases whatever a forked child inherited from its parent.
    fn clear_after_fork(&self) {
        self.destroy();
    }
}

/// The collaborator set a session drives, in initialization order.
#[derive(Clone)]
pub struct Subsystems {
    pub apertures: Arc<dyn Subsystem>,
    pub doorbells: Arc<dyn Subsystem>,
    pub debug_memory: Arc<dyn Subsystem>,
    pub counter_properties: Arc<dyn Subsystem>,
    /// Never initialized by the session; only released on fork reset.
    pub events: Arc<dyn Subsystem>,
}

impl Default for Subsystems {
    fn default() -> Self {
        Self {
            apertures: Arc::new(ApertureReservations::default()),
            doorbells: Arc::new(DoorbellTable::default()),
            debug_memory: Arc::new(DebugMemory::default()),
            counter_properties: Arc::new(CounterProperties::default()),
            events: Arc::new(EventsPage::default()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An inaccessible anonymous mapping that holds a range of address space.
#[derive(Debug)]
struct Reservation {
    addr: usize,
    len: usize,
}

impl Reservation {
    fn new(len: usize) -> io::Result<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            addr: addr as usize,
            len,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
    }
}

pub const DEFAULT_APERTURE_SIZE: usize = 64 << 20;

/// One reserved address-space aperture per node.
#[derive(Debug)]
pub struct ApertureReservations {
    size_per_node: usize,
    reservations: Mutex<Vec<Reservation>>,
}

impl ApertureReservations {
    pub fn new(size_per_node: usize) -> Self {
        Self {
            size_per_node,
            reservations: Mutex::new(Vec::new()),
        }
    }

    pub fn reserved_nodes(&self) -> usize {
        lock(&self.reservations).len()
    }
}

impl Default for ApertureReservations {
    fn default() -> Self {
        Self::new(DEFAULT_APERTURE_SIZE)
    }
}

impl Subsystem for ApertureReservations {
    fn name(&self) -> &'static str {
        "memory apertures"
    }

    fn init(&self, node_count: u32) -> Result<()> {
        let mut reserved = Vec::with_capacity(node_count as usize);
        for node in 0..node_count {
            let reservation = Reservation::new(self.size_per_node).map_err(|err| {
                SessionError::subsystem(self.name(), format!("node {node}: {err}"))
            })?;
            reserved.push(reservation);
        }
        *lock(&self.reservations) = reserved;
        Ok(())
    }

    fn destroy(&self) {
        lock(&self.reservations).clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellSlot {
    pub node: u32,
    /// Offset of the mapped doorbell page, once a queue on the node needs it.
    pub mapped_offset: Option<u64>,
}

/// Per-node doorbell page bookkeeping.
#[derive(Debug, Default)]
pub struct DoorbellTable {
    slots: Mutex<Vec<DoorbellSlot>>,
}

impl DoorbellTable {
    pub fn slots(&self) -> Vec<DoorbellSlot> {
        lock(&self.slots).clone()
    }
}

impl Subsystem for DoorbellTable {
    fn name(&self) -> &'static str {
        "doorbells"
    }

    fn init(&self, node_count: u32) -> Result<()> {
        *lock(&self.slots) = (0..node_count)
            .map(|node| DoorbellSlot {
                node,
                mapped_offset: None,
            })
            .collect();
        Ok(())
    }

    fn destroy(&self) {
        lock(&self.slots).clear();
    }
}

pub const DEFAULT_DEBUG_BUFFER_SIZE: usize = 4096;

/// Zeroed per-node scratch buffers used by the debugger interface.
#[derive(Debug)]
pub struct DebugMemory {
    bytes_per_node: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl DebugMemory {
    pub fn new(bytes_per_node: usize) -> Self {
        Self {
            bytes_per_node,
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_count(&self) -> usize {
        lock(&self.buffers).len()
    }
}

impl Default for DebugMemory {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_BUFFER_SIZE)
    }
}

impl Subsystem for DebugMemory {
    fn name(&self) -> &'static str {
        "debug memory"
    }

    fn init(&self, node_count: u32) -> Result<()> {
        let insufficient = |_| SessionError::subsystem("debug memory", "insufficient memory");

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(node_count as usize)
            .map_err(insufficient)?;
        for _ in 0..node_count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(self.bytes_per_node)
                .map_err(insufficient)?;
            buffer.resize(self.bytes_per_node, 0);
            buffers.push(buffer);
        }
        *lock(&self.buffers) = buffers;
        Ok(())
    }

    fn destroy(&self) {
        lock(&self.buffers).clear();
    }
}

/// Counter blocks available on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCounterProperties {
    pub node: u32,
    pub blocks: Vec<u32>,
}

/// Lazily populated per-node performance counter tables.
#[derive(Debug, Default)]
pub struct CounterProperties {
    tables: Mutex<Vec<NodeCounterProperties>>,
}

impl CounterProperties {
    pub fn node_count(&self) -> usize {
        lock(&self.tables).len()
    }

    pub fn node(&self, node: u32) -> Option<NodeCounterProperties> {
        lock(&self.tables).get(node as usize).cloned()
    }
}

impl Subsystem for CounterProperties {
    fn name(&self) -> &'static str {
        "counter properties"
    }

    fn init(&self, node_count: u32) -> Result<()> {
        *lock(&self.tables) = (0..node_count)
            .map(|node| NodeCounterProperties {
                node,
                blocks: Vec::new(),
            })
            .collect();
        Ok(())
    }

    fn destroy(&self) {
        lock(&self.tables).clear();
    }
}

/// The page the driver writes event notifications into. It is mapped by the
/// first event created, so the session only ever releases it.
#[derive(Debug, Default)]
pub struct EventsPage {
    page: Mutex<Option<Reservation>>,
}

impl EventsPage {
    /// Call from inside [`crate::Session::with_device`]; see the module
    /// documentation.
    pub fn ensure_mapped(&self, len: usize) -> io::Result<()> {
        let mut page = lock(&self.page);
        if page.is_none() {
            *page = Some(Reservation::new(len)?);
        }
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        lock(&self.page).is_some()
    }
}

impl Subsystem for EventsPage {
    fn name(&self) -> &'static str {
        "events page"
    }

    fn init(&self, _node_count: u32) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) {
        lock(&self.page).take();
    }
}
