//! Kernel function call tracing with deduplicated call stacks.
//!
//! One kprobe program is attached to every configured function. Records carry
//! the function name, looked up in the kernel by probed address, and a stack
//! hash that indexes the `STACK_TRACES` map.

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::HashMap;
use kmlprobe_common::{CallTraceEvent, EVENT_NAME_LEN, copy_bounded};
use log::{info, warn};

use crate::output::{CallTraceRecord, OutputFormat};
use crate::probes::kallsyms::Kallsyms;
use crate::probes::{KprobeSite, Probe, attach_kprobe, spawn_perf_handler};
use crate::telemetry;

pub struct CallTraceProbe {
    pub sites: Vec<KprobeSite>,
}

impl CallTraceProbe {
    pub fn new(sites: Vec<KprobeSite>) -> Self {
        Self { sites }
    }
}

impl Probe for CallTraceProbe {
    fn attach(&self, bpf: &mut Ebpf, format: OutputFormat) -> Result<()> {
        let symbols = Kallsyms::load().unwrap_or_else(|e| {
            warn!("{:#}; call-trace records will carry no function name", e);
            Kallsyms::default()
        });
        self.populate_func_names(bpf, &symbols)?;

        let attached = attach_kprobe(bpf, "trace_function_call", &self.sites)?;
        if attached == 0 {
            warn!("CallTraceProbe: no function could be attached");
            return Ok(());
        }

        spawn_perf_handler(bpf, "CALL_TRACE_EVENTS", move |cpu, event: CallTraceEvent| {
            let record = CallTraceRecord::decode(cpu, &event);
            telemetry::record_call_trace_event(&record.function);
            format.write(&record);
        })?;

        telemetry::record_active_probe("call_trace", attached as u64);
        info!(
            "CallTraceProbe attached to {}/{} functions",
            attached,
            self.sites.len()
        );
        Ok(())
    }
}

impl CallTraceProbe {
    fn populate_func_names(&self, bpf: &mut Ebpf, symbols: &Kallsyms) -> Result<()> {
        let mut names: HashMap<_, u64, [u8; EVENT_NAME_LEN]> = bpf
            .map_mut("FUNC_NAMES")
            .context("Failed to find FUNC_NAMES map")?
            .try_into()
            .context("FUNC_NAMES is not a HashMap")?;

        for (addr, name) in name_entries(&self.sites, symbols) {
            if let Err(e) = names.insert(addr, name, 0) {
                warn!("Failed to register function name at {:#x}: {}", addr, e);
            }
        }
        Ok(())
    }
}

/// `(address, NUL-terminated name)` for every site whose symbol resolves.
/// Names longer than the record field are truncated.
///
/// Each name is keyed by the symbol's entry address. Sites with an offset are
/// also keyed by the probed address, since older kernels report that from
/// `bpf_get_func_ip` while newer ones report the entry address.
fn name_entries(sites: &[KprobeSite], symbols: &Kallsyms) -> Vec<(u64, [u8; EVENT_NAME_LEN])> {
    let mut entries = Vec::with_capacity(sites.len());
    for site in sites {
        let Some(addr) = symbols.address(&site.symbol) else {
            continue;
        };
        let mut name = [0u8; EVENT_NAME_LEN];
        copy_bounded(&mut name, site.symbol.as_bytes());

        entries.push((addr, name));
        if site.offset != 0 {
            entries.push((addr.wrapping_add(site.offset), name));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmlprobe_common::c_str;

    #[test]
    fn test_name_entries() {
        let symbols = Kallsyms::parse(
            "ffffffff812a4f30 T vfs_read\n\
             ffffffff8110a2c0 t pick_next_task_fair\n\
             ffffffff81300000 T blk_mq_dispatch_rq_list_with_a_very_long_name\n",
        );
        let sites = vec![
            KprobeSite::new("vfs_read", 0),
            KprobeSite::new("pick_next_task_fair", 0x10),
            KprobeSite::new("not_in_kallsyms", 0),
            KprobeSite::new("blk_mq_dispatch_rq_list_with_a_very_long_name", 0),
        ];

        let entries = name_entries(&sites, &symbols);
        assert_eq!(entries.len(), 4);

        assert_eq!(entries[0].0, 0xffffffff812a4f30);
        assert_eq!(c_str(&entries[0].1), b"vfs_read");

        assert_eq!(entries[1].0, 0xffffffff8110a2c0);
        assert_eq!(entries[2].0, 0xffffffff8110a2d0);

        let truncated = c_str(&entries[3].1);
        assert_eq!(truncated.len(), EVENT_NAME_LEN - 1);
        assert_eq!(entries[3].1[EVENT_NAME_LEN - 1], 0);
    }

    #[test]
    fn test_offset_site_keyed_by_entry_address() {
        let symbols = Kallsyms::parse("ffffffff8110a2c0 t pick_next_task_fair\n");
        let sites = [KprobeSite::new("pick_next_task_fair", 0x10)];

        let entries = name_entries(&sites, &symbols);
        let keys: Vec<u64> = entries.iter().map(|(addr, _)| *addr).collect();
        assert_eq!(keys, vec![0xffffffff8110a2c0, 0xffffffff8110a2d0]);
        assert!(
            entries
                .iter()
                .all(|(_, name)| c_str(name) == b"pick_next_task_fair")
        );
    }
}
