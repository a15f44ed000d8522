//! Scheduler task-selection probes.
//!
//! Five kprobes, one per observed phase of the pick-next-task logic. Each is
//! attached by the loader to a configured `symbol+offset` site; the probe only
//! tags which phase it saw.

use aya_ebpf::{
    macros::{kprobe, map},
    maps::PerfEventArray,
    programs::ProbeContext,
};
use kmlprobe_common::{ProbeFamily, SchedulerEvent, SchedulerEventType, probe};

use crate::probes::{KernelEnv, PerfChannel, filter_for};

#[map]
pub static SCHEDULER_EVENTS: PerfEventArray<SchedulerEvent> = PerfEventArray::new(0);

#[inline(always)]
fn emit_phase(ctx: &ProbeContext, phase: SchedulerEventType) -> u32 {
    let _ = probe::trace_scheduler_phase(
        &KernelEnv,
        &filter_for(ProbeFamily::Scheduler),
        phase,
        &PerfChannel::new(&SCHEDULER_EVENTS, ctx),
    );
    0
}

#[kprobe]
pub fn pick_entry(ctx: ProbeContext) -> u32 {
    emit_phase(&ctx, SchedulerEventType::Entry)
}

#[kprobe]
pub fn pick_idle(ctx: ProbeContext) -> u32 {
    emit_phase(&ctx, SchedulerEventType::Idle)
}

#[kprobe]
pub fn pick_done(ctx: ProbeContext) -> u32 {
    emit_phase(&ctx, SchedulerEventType::Done)
}

#[kprobe]
pub fn pick_while_same_group(ctx: ProbeContext) -> u32 {
    emit_phase(&ctx, SchedulerEventType::WhileSameGroup)
}

#[kprobe]
pub fn pick_while_diff_groups(ctx: ProbeContext) -> u32 {
    emit_phase(&ctx, SchedulerEventType::WhileDiffGroups)
}
