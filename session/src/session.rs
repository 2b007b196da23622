//! Reference-counted, fork-aware session with the kernel driver.
//!
//! Every state transition happens under one process-wide lock. The first
//! open performs cold initialization:
//!
//! 1. load [`RuntimeConfig`] from the environment,
//! 2. open the device node,
//! 3. probe the page size,
//! 4. read the system topology,
//! 5. bring up apertures, doorbells, debug memory and counter properties,
//! 6. register the fork hooks (once per session, after the lock is
//!    released, since a fork's prepare phase takes the registry first).
//!
//! Later opens only bump the count. The last close tears everything down in
//! reverse. When the process turns out to be a forked child, the inherited
//! state is reset before anything else happens.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EnvSource;
use crate::config::ProcessEnv;
use crate::config::RuntimeConfig;
use crate::device::DeviceHandle;
use crate::device::DeviceNode;
use crate::device::KfdNode;
use crate::device::PageGeometry;
use crate::error::Result;
use crate::error::SessionError;
use crate::fork::AtFork;
use crate::fork::ForkDetector;
use crate::fork::ForkHandlers;
use crate::fork::ForkHookRegistry;
use crate::fork::OsProcess;
use crate::fork::ProcessIdentity;
use crate::lock::ForkSafeMutex;
use crate::subsystems::Subsystems;
use crate::topology::SysfsTopology;
use crate::topology::SystemProperties;
use crate::topology::Topology;

static GLOBAL: LazyLock<Session> = LazyLock::new(|| SessionBuilder::default().build());

/// Successful outcomes of [`Session::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// This call performed cold initialization.
    Opened,
    /// A session already existed; only the count was bumped.
    AlreadyOpened,
}

#[derive(Debug, Default)]
struct SessionState {
    open_count: u32,
    device: Option<Box<dyn DeviceHandle>>,
    detector: ForkDetector,
    page: Option<PageGeometry>,
    config: Option<RuntimeConfig>,
    /// Survives fork resets: it describes the machine, not the driver
    /// session.
    system: Option<SystemProperties>,
}

struct Inner {
    state: ForkSafeMutex<SessionState>,
    env: Arc<dyn EnvSource>,
    device_node: Arc<dyn DeviceNode>,
    topology: Arc<dyn Topology>,
    subsystems: Subsystems,
    process: Arc<dyn ProcessIdentity>,
    fork_hooks: Arc<dyn ForkHookRegistry>,
    hooks_registered: AtomicBool,
}

/// Wires the collaborators of a [`Session`]. Every seam defaults to the
/// real implementation.
pub struct SessionBuilder {
    env: Arc<dyn EnvSource>,
    device_node: Arc<dyn DeviceNode>,
    topology: Arc<dyn Topology>,
    subsystems: Subsystems,
    process: Arc<dyn ProcessIdentity>,
    fork_hooks: Arc<dyn ForkHookRegistry>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            env: Arc::new(ProcessEnv),
            device_node: Arc::new(KfdNode::default()),
            topology: Arc::new(SysfsTopology::default()),
            subsystems: Subsystems::default(),
            process: Arc::new(OsProcess),
            fork_hooks: Arc::new(AtFork),
        }
    }
}

impl SessionBuilder {
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    pub fn device_node(mut self, device_node: Arc<dyn DeviceNode>) -> Self {
        self.device_node = device_node;
        self
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = topology;
        self
    }

    pub fn subsystems(mut self, subsystems: Subsystems) -> Self {
        self.subsystems = subsystems;
        self
    }

    pub fn process(mut self, process: Arc<dyn ProcessIdentity>) -> Self {
        self.process = process;
        self
    }

    pub fn fork_hooks(mut self, fork_hooks: Arc<dyn ForkHookRegistry>) -> Self {
        self.fork_hooks = fork_hooks;
        self
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(Inner {
                state: ForkSafeMutex::default(),
                env: self.env,
                device_node: self.device_node,
                topology: self.topology,
                subsystems: self.subsystems,
                process: self.process,
                fork_hooks: self.fork_hooks,
                hooks_registered: AtomicBool::new(false),
            }),
        }
    }
}

/// Handle to a session. Clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The process-wide session backed by `/dev/kfd`.
    pub fn global() -> &'static Session {
        &GLOBAL
    }

    pub fn open(&self) -> Result<OpenStatus> {
        let mut state = self.inner.state.lock();
        self.reset_if_forked(&mut state);

        if state.open_count > 0 {
            state.open_count += 1;
            debug!(open_count = state.open_count, "session already open");
            return Ok(OpenStatus::AlreadyOpened);
        }

        self.cold_open(&mut state)?;
        state.open_count = 1;
        drop(state);

        self.register_fork_hooks();
        Ok(OpenStatus::Opened)
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.reset_if_forked(&mut state);

        if state.open_count == 0 {
            return Err(SessionError::not_opened());
        }

        state.open_count -= 1;
        if state.open_count == 0 {
            let subsystems = &self.inner.subsystems;
            subsystems.counter_properties.destroy();
            subsystems.debug_memory.destroy();
            subsystems.doorbells.destroy();
            subsystems.apertures.destroy();
            state.device = None;
            state.config = None;
            state.page = None;
            info!("session closed");
        } else {
            debug!(open_count = state.open_count, "session reference released");
        }
        Ok(())
    }

    pub fn open_count(&self) -> u32 {
        self.inner.state.lock().open_count
    }

    pub fn page_geometry(&self) -> Option<PageGeometry> {
        self.inner.state.lock().page
    }

    /// Topology observed at the most recent cold open.
    pub fn system_properties(&self) -> Option<SystemProperties> {
        self.inner.state.lock().system
    }

    /// Configuration loaded by the current session, if one is open.
    pub fn config(&self) -> Option<RuntimeConfig> {
        self.inner.state.lock().config.clone()
    }

    /// Runs `f` against the live device handle while holding the session
    /// lock. Returns `None` when no session is open.
    ///
    /// The lock is not reentrant. `f` must not call back into this session
    /// (including [`Session::open_count`] and the other queries) and must
    /// not fork; any of those deadlocks. Work on the default collaborators
    /// outside cold open, close and reset belongs in here, because a fork's
    /// prepare phase quiesces this lock and nothing else.
    pub fn with_device<R>(&self, f: impl FnOnce(&dyn DeviceHandle) -> R) -> Option<R> {
        let state = self.inner.state.lock();
        state.device.as_ref().map(|device| f(device.as_ref()))
    }

    fn reset_if_forked(&self, state: &mut SessionState) {
        let pid = self.inner.process.current_pid();
        if !state.detector.detect(pid) {
            return;
        }

        info!(pid, "fork detected; discarding inherited session state");
        let subsystems = &self.inner.subsystems;
        subsystems.doorbells.clear_after_fork();
        subsystems.events.clear_after_fork();
        subsystems.apertures.clear_after_fork();
        subsystems.debug_memory.clear_after_fork();
        subsystems.counter_properties.clear_after_fork();
        state.device = None;
        state.config = None;
        state.page = None;
        state.open_count = 0;
        state.detector.reset();
        // Claim the session for this process right away so the remainder of
        // this call counts as observed by it.
        state.detector.detect(pid);
    }

    fn cold_open(&self, state: &mut SessionState) -> Result<()> {
        let config = RuntimeConfig::load(self.inner.env.as_ref())?;

        let device = self.inner.device_node.open().map_err(|err| {
            debug!("failed to open device node: {err}");
            SessionError::device_open_failed(err)
        })?;
        let page = PageGeometry::probe();

        // From here on, dropping `device` on an early return closes it.
        let system = self.inner.topology.system_properties()?;
        let node_count = system.num_nodes;

        let subsystems = &self.inner.subsystems;
        subsystems.apertures.init(node_count)?;
        if let Err(err) = subsystems.doorbells.init(node_count) {
            subsystems.apertures.destroy();
            return Err(err);
        }
        if let Err(err) = subsystems.debug_memory.init(node_count) {
            warn!("{err}; debugging unavailable");
        }
        if let Err(err) = subsystems.counter_properties.init(node_count) {
            warn!("{err}; performance counters unavailable");
        }

        info!(
            node_count,
            page_size = page.size,
            zero_frame_buffer = config.zero_frame_buffer,
            "session opened"
        );
        state.device = Some(device);
        state.page = Some(page);
        state.system = Some(system);
        state.config = Some(config);
        Ok(())
    }

    /// Must run without the session lock held: a concurrent fork takes the
    /// registry lock first and then this session's.
    fn register_fork_hooks(&self) {
        if self.inner.hooks_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers: Weak<dyn ForkHandlers> = Arc::downgrade(&self.inner) as Weak<Inner>;
        if let Err(err) = self.inner.fork_hooks.register(handlers) {
            warn!("failed to register fork handlers: {err}");
        }
    }
}

impl ForkHandlers for Inner {
    fn prepare(&self) {
        // SAFETY: released by `parent` in this thread, or abandoned by
        // `child` in the duplicate.
        unsafe { self.state.lock_raw() };
    }

    fn parent(&self) {
        // SAFETY: acquired by `prepare` in this thread.
        unsafe { self.state.unlock_raw() };
    }

    fn child(&self) {
        // SAFETY: the child has a single thread. The lock may be marked as
        // held by a thread that was not duplicated.
        unsafe { self.state.reinit() };
        self.state.lock().detector.mark_forked();
    }
}
