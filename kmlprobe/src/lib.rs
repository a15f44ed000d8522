pub mod output;
pub mod settings;
pub mod telemetry;

use std::time::Duration;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::Array;
use aya_log::EbpfLogger;
use kmlprobe_common::{ProbeFamily, ProbeFilter};
use log::{info, warn};
use tokio::signal;

use crate::output::OutputFormat;
use crate::settings::Settings;

pub mod probes;
use crate::probes::{
    Probe,
    builtin::{CallTraceProbe, FileOpenProbe, SchedulerPickProbe},
    request_shutdown,
};

pub struct ProbeEngine {
    pub settings: Settings,
    format: OutputFormat,
    bpf: Ebpf,
}

impl ProbeEngine {
    pub fn new(settings: Settings, format: OutputFormat, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self {
            settings,
            format,
            bpf,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        self.configure_filters()?;
        self.attach_probes()?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        request_shutdown();

        Ok(())
    }

    /// Writes the inclusion predicate of each probe family into `FILTERS`.
    /// Must happen before any program is attached.
    fn configure_filters(&mut self) -> Result<()> {
        let filters = [
            (ProbeFamily::CallTrace, self.settings.call_trace_filter()?),
            (ProbeFamily::FileOpen, self.settings.file_open_filter()?),
            (ProbeFamily::Scheduler, self.settings.scheduler_filter()?),
        ];

        let mut map: Array<_, ProbeFilter> = self
            .bpf
            .map_mut("FILTERS")
            .context("Failed to find FILTERS map")?
            .try_into()
            .context("FILTERS is not an Array")?;

        for (family, filter) in filters {
            map.set(family.index(), filter, 0)
                .with_context(|| format!("Failed to set filter for {:?}", family))?;
            info!("Filter for {:?}: {:?}", family, filter);
        }
        Ok(())
    }

    fn attach_probes(&mut self) -> Result<()> {
        let probes = &self.settings.probes;

        if probes.call_trace.enabled.unwrap_or(false) {
            CallTraceProbe::new(probes.call_trace.sites()?).attach(&mut self.bpf, self.format)?;
        }

        if probes.file_open.enabled.unwrap_or(false) {
            FileOpenProbe::new(Duration::from_secs(
                probes.file_open.counter_interval_secs(),
            ))
            .attach(&mut self.bpf, self.format)?;
        }

        if probes.scheduler.enabled.unwrap_or(false) {
            SchedulerPickProbe::new(probes.scheduler.sites()?).attach(&mut self.bpf, self.format)?;
        }

        Ok(())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
