//! Kernel-side bindings for the probe core in `kmlprobe_common::probe`.
//!
//! Each wrapper here adapts an aya-ebpf helper or map to one of the core's
//! traits. The probe entry points live in `builtin`.

use aya_ebpf::{
    EbpfContext,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_user_str_bytes,
    },
    macros::map,
    maps::{Array, HashMap, PerfEventArray, StackTrace},
};
use aya_log_ebpf::debug;
use kmlprobe_common::{
    ProbeFamily, ProbeFilter, TASK_COMM_LEN,
    probe::{CounterTable, OutputChannel, ProbeEnv, StackIdCache},
};

pub mod builtin;

/// One inclusion predicate per probe family, indexed by `ProbeFamily`.
#[map]
pub static FILTERS: Array<ProbeFilter> = Array::with_max_entries(ProbeFamily::COUNT, 0);

/// Filter the loader configured for `family`; accept-all if none was written.
#[inline(always)]
pub fn filter_for(family: ProbeFamily) -> ProbeFilter {
    FILTERS
        .get(family.index())
        .copied()
        .unwrap_or(ProbeFilter::ALL)
}

pub struct KernelEnv;

impl ProbeEnv for KernelEnv {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn current_comm(&self, dst: &mut [u8; TASK_COMM_LEN]) {
        if let Ok(comm) = bpf_get_current_comm() {
            *dst = comm;
        }
    }

    #[inline(always)]
    fn read_user_str(&self, src: u64, dst: &mut [u8]) {
        // The helper truncates and NUL-terminates on its own.
        let _ = unsafe { bpf_probe_read_user_str_bytes(src as *const u8, dst) };
    }
}

/// Per-CPU perf buffer bound to the invoking context.
pub struct PerfChannel<'a, C, T: 'static> {
    map: &'a PerfEventArray<T>,
    ctx: &'a C,
}

impl<'a, C, T> PerfChannel<'a, C, T> {
    #[inline(always)]
    pub fn new(map: &'a PerfEventArray<T>, ctx: &'a C) -> Self {
        Self { map, ctx }
    }
}

impl<C: EbpfContext, T> OutputChannel<T> for PerfChannel<'_, C, T> {
    #[inline(always)]
    fn submit(&self, record: &T) -> Result<(), i64> {
        // bpf_perf_event_output's result is not surfaced; a full buffer shows
        // up only as lost samples on the reading side.
        self.map.output(self.ctx, record, 0);
        Ok(())
    }
}

/// Kernel stack map lookup without `BPF_F_REUSE_STACKID`: occupied slots are
/// never overwritten, so a full table or a bucket collision fails instead.
pub struct KernelStacks<'a, C> {
    map: &'a StackTrace,
    ctx: &'a C,
}

impl<'a, C> KernelStacks<'a, C> {
    #[inline(always)]
    pub fn new(map: &'a StackTrace, ctx: &'a C) -> Self {
        Self { map, ctx }
    }
}

impl<C: EbpfContext> StackIdCache for KernelStacks<'_, C> {
    #[inline(always)]
    fn stack_id(&self) -> Result<u32, i64> {
        match unsafe { self.map.get_stackid(self.ctx, 0) } {
            Ok(id) => Ok(id as u32),
            Err(err) => {
                debug!(self.ctx, "stack capture failed: {}", err);
                Err(err)
            }
        }
    }
}

/// Single-slot counter map shared by every CPU.
pub struct SharedCounter<'a> {
    map: &'a HashMap<u64, u64>,
}

impl<'a> SharedCounter<'a> {
    #[inline(always)]
    pub fn new(map: &'a HashMap<u64, u64>) -> Self {
        Self { map }
    }
}

impl CounterTable for SharedCounter<'_> {
    #[inline(always)]
    fn load(&self, key: u64) -> Option<u64> {
        unsafe { self.map.get(&key).copied() }
    }

    #[inline(always)]
    fn store(&self, key: u64, value: u64) {
        let _ = self.map.insert(&key, &value, 0);
    }
}
