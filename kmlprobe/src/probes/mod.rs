use std::{
    fmt,
    path::Path,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use aya::{
    Ebpf,
    maps::PerfEventArray,
    programs::{KProbe, TracePoint},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};

use crate::{output::OutputFormat, telemetry};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod builtin;
pub mod kallsyms;

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf, format: OutputFormat) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Pages per per-CPU perf buffer.
const PERF_BUFFER_PAGES: usize = 64;

/// Records drained from one CPU buffer per read.
const PERF_READ_BATCH: usize = 16;

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// A kprobe attach point: a kernel symbol plus a byte offset into it.
///
/// Parsed from `symbol`, `symbol+0x1f` or `symbol+31`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KprobeSite {
    pub symbol: String,
    pub offset: u64,
}

impl KprobeSite {
    pub fn new(symbol: impl Into<String>, offset: u64) -> Self {
        Self {
            symbol: symbol.into(),
            offset,
        }
    }
}

impl FromStr for KprobeSite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (symbol, offset) = match s.split_once('+') {
            Some((symbol, offset)) => {
                let offset = offset.trim();
                let parsed = match offset
                    .strip_prefix("0x")
                    .or_else(|| offset.strip_prefix("0X"))
                {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => offset.parse(),
                };
                let offset =
                    parsed.map_err(|e| anyhow!("invalid offset in kprobe site {}: {}", s, e))?;
                (symbol.trim(), offset)
            }
            None => (s, 0),
        };

        if symbol.is_empty() {
            bail!("kprobe site {:?} has no symbol", s);
        }
        Ok(Self::new(symbol, offset))
    }
}

impl fmt::Display for KprobeSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{}", self.symbol)
        } else {
            write!(f, "{}+{:#x}", self.symbol, self.offset)
        }
    }
}

/// Loads `program_name` and attaches it at every site. A site that fails to
/// attach is logged and skipped; returns how many attached.
pub fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, sites: &[KprobeSite]) -> Result<usize> {
    if sites.is_empty() {
        debug!("No attach sites for {}; not loading it", program_name);
        return Ok(0);
    }

    info!("Loading program {}", program_name);
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    program.load()?;

    let mut attached = 0;
    for site in sites {
        match program.attach(&site.symbol, site.offset) {
            Ok(_) => {
                info!("Attached {} at {}", program_name, site);
                attached += 1;
            }
            Err(e) => warn!("Failed to attach {} at {}: {}", program_name, site, e),
        }
    }
    Ok(attached)
}

/// Reads `T` records from every online CPU's buffer of a perf event array
/// and hands each one, with its CPU, to `handler`.
pub fn spawn_perf_handler<T, F>(bpf: &mut Ebpf, map_name: &'static str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(u32, T) + Clone + Send + 'static,
{
    let mut perf_array = PerfEventArray::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?,
    )?;

    let cpus = online_cpus()
        .map_err(|(path, e)| anyhow!("Failed to read online CPUs from {}: {}", path, e))?;

    for cpu in cpus {
        let mut buf = perf_array
            .open(cpu, Some(PERF_BUFFER_PAGES))
            .with_context(|| format!("Failed to open {} buffer on CPU {}", map_name, cpu))?;
        let shutdown = shutdown_flag();
        let handler = handler.clone();

        tokio::task::spawn_blocking(move || {
            let mut buffers = (0..PERF_READ_BATCH)
                .map(|_| BytesMut::with_capacity(std::mem::size_of::<T>()))
                .collect::<Vec<_>>();

            while !shutdown.load(Ordering::Relaxed) {
                let events = match buf.read_events(&mut buffers) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Failed to read {} on CPU {}: {}", map_name, cpu, e);
                        break;
                    }
                };

                if events.lost > 0 {
                    warn!("{} lost {} records on CPU {}", map_name, events.lost, cpu);
                    telemetry::record_lost_events(map_name, events.lost as u64);
                }

                for item in buffers.iter().take(events.read) {
                    if item.len() >= std::mem::size_of::<T>() {
                        let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                        handler(cpu, event);
                    }
                }

                if events.read == 0 {
                    std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_symbol() {
        let site: KprobeSite = "vfs_read".parse().unwrap();
        assert_eq!(site, KprobeSite::new("vfs_read", 0));
        assert_eq!(site.to_string(), "vfs_read");
    }

    #[test]
    fn test_parse_hex_offset() {
        let site: KprobeSite = "pick_next_task_fair+0x1a5".parse().unwrap();
        assert_eq!(site, KprobeSite::new("pick_next_task_fair", 0x1a5));
        assert_eq!(site.to_string(), "pick_next_task_fair+0x1a5");
    }

    #[test]
    fn test_parse_decimal_offset() {
        let site: KprobeSite = " __schedule + 16 ".parse().unwrap();
        assert_eq!(site, KprobeSite::new("__schedule", 16));
    }

    #[test]
    fn test_parse_rejects_bad_sites() {
        assert!("".parse::<KprobeSite>().is_err());
        assert!("+0x10".parse::<KprobeSite>().is_err());
        assert!("vfs_read+".parse::<KprobeSite>().is_err());
        assert!("vfs_read+0xzz".parse::<KprobeSite>().is_err());
    }

    #[test]
    fn test_shutdown_flag_is_shared() {
        let flag = shutdown_flag();
        request_shutdown();
        assert!(flag.load(Ordering::Relaxed));
        SHUTDOWN.store(false, Ordering::Relaxed);
    }
}
