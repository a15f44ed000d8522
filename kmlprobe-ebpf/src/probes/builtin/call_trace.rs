//! Generic traced-function kprobe with call-stack deduplication.
//!
//! The same program is attached to every traced function. The loader fills
//! `FUNC_NAMES` with the entry address of each one so the record can carry
//! the function name.

use aya_ebpf::{
    EbpfContext,
    helpers::gen::bpf_get_func_ip,
    macros::{kprobe, map},
    maps::{HashMap, PerfEventArray, StackTrace},
    programs::ProbeContext,
};
use kmlprobe_common::{
    CallTraceEvent, EVENT_NAME_LEN, ProbeFamily, STACK_TABLE_CAPACITY, probe,
};

use crate::probes::{KernelEnv, KernelStacks, PerfChannel, filter_for};

const MAX_TRACED_FUNCTIONS: u32 = 256;

#[map]
pub static CALL_TRACE_EVENTS: PerfEventArray<CallTraceEvent> = PerfEventArray::new(0);

#[map]
pub static STACK_TRACES: StackTrace = StackTrace::with_max_entries(STACK_TABLE_CAPACITY, 0);

/// Probed address -> NUL-terminated function name.
#[map]
pub static FUNC_NAMES: HashMap<u64, [u8; EVENT_NAME_LEN]> =
    HashMap::with_max_entries(MAX_TRACED_FUNCTIONS, 0);

#[kprobe]
pub fn trace_function_call(ctx: ProbeContext) -> u32 {
    let _ = probe::trace_function_call(
        &KernelEnv,
        &filter_for(ProbeFamily::CallTrace),
        &KernelStacks::new(&STACK_TRACES, &ctx),
        || {
            let ip = unsafe { bpf_get_func_ip(ctx.as_ptr()) };
            unsafe { FUNC_NAMES.get(&ip).copied() }
        },
        &PerfChannel::new(&CALL_TRACE_EVENTS, &ctx),
    );
    0
}
