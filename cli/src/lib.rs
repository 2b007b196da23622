use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kfd_session::RuntimeConfig;
use kfd_session::Session;
use kfd_session::config::DebugLevel;
use kfd_session::config::ProcessEnv;
use kfd_session::device::KfdNode;
use kfd_session::device::PageGeometry;
use kfd_session::topology::SysfsTopology;
use kfd_session::topology::SystemProperties;
use tracing_subscriber::EnvFilter;

/// Open a session with the kernel fusion driver, report what cold
/// initialization found, and close it again.
#[derive(Debug, Parser)]
#[command(name = "kfd-probe", version)]
pub struct Cli {
    /// Number of nested opens to perform before closing them all.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    /// Device node to open instead of /dev/kfd.
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Topology directory to read instead of the driver's sysfs tree.
    #[arg(long, value_name = "DIR")]
    pub topology: Option<PathBuf>,
}

pub fn run_main(cli: Cli) -> anyhow::Result<()> {
    init_tracing();

    let session = session_for(&cli);
    for n in 1..=cli.repeat {
        let status = session
            .open()
            .with_context(|| format!("open #{n} of the kfd session failed"))?;
        println!("open #{n}: {status:?}");
    }

    for line in report_lines(
        session.page_geometry(),
        session.system_properties(),
        session.config().as_ref(),
    ) {
        println!("{line}");
    }

    for n in 1..=cli.repeat {
        session
            .close()
            .with_context(|| format!("close #{n} of the kfd session failed"))?;
    }
    println!("closed");
    Ok(())
}

/// Honors `RUST_LOG`, falling back to `HSAKMT_DEBUG_LEVEL`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(DebugLevel::from_env(&ProcessEnv).level_filter().into())
    });
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn session_for(cli: &Cli) -> Session {
    if cli.device.is_none() && cli.topology.is_none() {
        return Session::global().clone();
    }

    tracing::debug!(device = ?cli.device, topology = ?cli.topology, "using a private kfd session");
    let mut builder = Session::builder();
    if let Some(device) = &cli.device {
        builder = builder.device_node(Arc::new(KfdNode::new(device)));
    }
    if let Some(topology) = &cli.topology {
        builder = builder.topology(Arc::new(SysfsTopology::new(topology)));
    }
    builder.build()
}

fn report_lines(
    page: Option<PageGeometry>,
    system: Option<SystemProperties>,
    config: Option<&RuntimeConfig>,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(page) = page {
        lines.push(format!("page size: {} (shift {})", page.size, page.shift));
    }
    if let Some(system) = system {
        lines.push(format!("nodes: {}", system.num_nodes));
        lines.push(format!(
            "platform: oem {:#x} id {} rev {}",
            system.platform_oem, system.platform_id, system.platform_rev
        ));
    }
    if let Some(config) = config {
        lines.push(format!("debug level: {}", config.debug_level.value()));
        if config.zero_frame_buffer {
            lines.push("zero frame buffer: enabled".to_string());
        }
        if let Some(forced) = &config.forced_asic {
            lines.push(format!(
                "forced asic: {} {}.{}.{} ({:?}, {})",
                forced.name,
                forced.major,
                forced.minor,
                forced.stepping,
                forced.family,
                if forced.is_dgpu { "dGPU" } else { "APU" },
            ));
        }
    }
    lines
}
