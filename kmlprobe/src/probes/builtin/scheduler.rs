//! Task-selection phase probe.
//!
//! The five phases sit inside the scheduler's pick-next-task logic at
//! offsets that only make sense for one kernel build, so every site comes
//! from configuration. A phase without a site is left detached.

use anyhow::Result;
use aya::Ebpf;
use kmlprobe_common::SchedulerEvent;
use log::{debug, info, warn};

use crate::output::{OutputFormat, SchedulerRecord};
use crate::probes::{KprobeSite, Probe, attach_kprobe, spawn_perf_handler};
use crate::telemetry;

pub struct SchedulerPickProbe {
    /// `(program name, site)` per phase.
    pub phases: Vec<(&'static str, Option<KprobeSite>)>,
}

impl SchedulerPickProbe {
    pub fn new(phases: Vec<(&'static str, Option<KprobeSite>)>) -> Self {
        Self { phases }
    }
}

impl Probe for SchedulerPickProbe {
    fn attach(&self, bpf: &mut Ebpf, format: OutputFormat) -> Result<()> {
        let mut attached = 0;
        for (program, site) in &self.phases {
            match site {
                Some(site) => attached += attach_kprobe(bpf, program, std::slice::from_ref(site))?,
                None => debug!("No site configured for {}; skipping", program),
            }
        }

        if attached == 0 {
            warn!("SchedulerPickProbe: no phase could be attached");
            return Ok(());
        }

        spawn_perf_handler(bpf, "SCHEDULER_EVENTS", move |cpu, event: SchedulerEvent| {
            match SchedulerRecord::decode(cpu, &event) {
                Ok(record) => {
                    telemetry::record_scheduler_event(record.event_name);
                    format.write(&record);
                }
                Err(e) => warn!("Dropping scheduler record on CPU {}: {}", cpu, e),
            }
        })?;

        telemetry::record_active_probe("scheduler", attached as u64);
        info!(
            "SchedulerPickProbe attached {}/{} phases",
            attached,
            self.phases.len()
        );
        Ok(())
    }
}
