//! `openat(2)` entry probe plus the auxiliary invocation counter.

use core::mem::offset_of;

use aya_ebpf::{
    macros::{map, tracepoint},
    maps::{HashMap, PerfEventArray},
    programs::TracePointContext,
};
use kmlprobe_common::{
    FileOpenEvent, ProbeFamily,
    probe::{self, OpenatArgs},
};

use super::syscall_types::SysEnterOpenat;
use crate::probes::{KernelEnv, PerfChannel, SharedCounter, filter_for};

#[map]
pub static FILE_OPEN_EVENTS: PerfEventArray<FileOpenEvent> = PerfEventArray::new(0);

/// Approximate count of `openat` invocations, single key `COUNTER_KEY`.
#[map]
pub static OPENAT_CALLS: HashMap<u64, u64> = HashMap::with_max_entries(1, 0);

/// Tracepoint for sys_enter_openat - fires when a process calls openat().
#[tracepoint]
pub fn sys_enter_openat(ctx: TracePointContext) -> u32 {
    if let Some(args) = read_openat_args(&ctx) {
        let _ = probe::trace_openat(
            &KernelEnv,
            &filter_for(ProbeFamily::FileOpen),
            &args,
            &PerfChannel::new(&FILE_OPEN_EVENTS, &ctx),
        );
    }
    0
}

/// Counts every openat() call, unfiltered.
#[tracepoint]
pub fn count_openat_calls(_ctx: TracePointContext) -> u32 {
    probe::count_invocation(&SharedCounter::new(&OPENAT_CALLS));
    0
}

#[inline(always)]
fn read_openat_args(ctx: &TracePointContext) -> Option<OpenatArgs> {
    let filename: u64 = unsafe { ctx.read_at(offset_of!(SysEnterOpenat, filename)).ok()? };
    let flags: i64 = unsafe { ctx.read_at(offset_of!(SysEnterOpenat, flags)).ok()? };
    let mode: i64 = unsafe { ctx.read_at(offset_of!(SysEnterOpenat, mode)).ok()? };

    Some(OpenatArgs {
        filename,
        flags: flags as i32,
        mode: mode as i32,
    })
}
