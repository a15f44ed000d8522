use std::borrow::Borrow;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::{HashMap, MapData, MapError};
use kmlprobe_common::{COUNTER_KEY, FileOpenEvent};
use log::{info, warn};

use crate::output::{FileOpenRecord, OutputFormat, format_open_flags};
use crate::probes::{Probe, TracepointConfig, attach_tracepoint, shutdown_flag, spawn_perf_handler};
use crate::telemetry;

pub struct FileOpenProbe {
    pub counter_interval: Duration,
}

impl FileOpenProbe {
    pub fn new(counter_interval: Duration) -> Self {
        Self { counter_interval }
    }
}

impl Probe for FileOpenProbe {
    fn attach(&self, bpf: &mut Ebpf, format: OutputFormat) -> Result<()> {
        let mut attached = 0;

        if attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "sys_enter_openat",
                category: "syscalls",
                name: "sys_enter_openat",
            },
        )? {
            spawn_perf_handler(bpf, "FILE_OPEN_EVENTS", move |cpu, event: FileOpenEvent| {
                let record = FileOpenRecord::decode(cpu, &event);
                telemetry::record_file_open_event(&format_open_flags(record.flags));
                format.write(&record);
            })?;
            attached += 1;
        }

        if attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "count_openat_calls",
                category: "syscalls",
                name: "sys_enter_openat",
            },
        )? {
            self.spawn_counter_reporter(bpf)?;
            attached += 1;
        }

        if attached > 0 {
            telemetry::record_active_probe("file_open", attached);
            info!("FileOpenProbe attached successfully");
        }
        Ok(())
    }
}

impl FileOpenProbe {
    /// Periodically logs the in-kernel openat counter.
    fn spawn_counter_reporter(&self, bpf: &mut Ebpf) -> Result<()> {
        let counter: HashMap<_, u64, u64> = HashMap::try_from(
            bpf.take_map("OPENAT_CALLS")
                .context("Failed to find OPENAT_CALLS map")?,
        )?;
        let period = self.counter_interval;
        let shutdown = shutdown_flag();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match read_counter(&counter) {
                    Ok(count) => {
                        telemetry::record_openat_invocations(count);
                        info!("OPENAT_CALLS approximate invocations={}", count);
                    }
                    Err(e) => warn!("Failed to read OPENAT_CALLS: {}", e),
                }
            }
        });
        Ok(())
    }
}

/// Current counter value; an absent key means no call was counted yet.
fn read_counter<T: Borrow<MapData>>(counter: &HashMap<T, u64, u64>) -> Result<u64, MapError> {
    counter_value(counter.get(&COUNTER_KEY, 0))
}

fn counter_value(lookup: Result<u64, MapError>) -> Result<u64, MapError> {
    match lookup {
        Ok(count) => Ok(count),
        Err(MapError::KeyNotFound) => Ok(0),
        Err(e) => Err(e),
    }
}
