//! Probe core: filtering, record encoding and hand-off.
//!
//! The kernel-facing pieces (helpers, maps) are reached through small traits so
//! the same code runs inside the eBPF object and under unit tests. Everything
//! here is `#[inline(always)]` so the verifier sees straight-line code.
//!
//! None of the degradations below are errors: a rejected task, a truncated
//! string, a missing stack and a full output buffer all end the invocation
//! quietly. Callers get a [`ProbeOutcome`] they are free to ignore.

use crate::{
    CallTraceEvent, EVENT_NAME_LEN, FileOpenEvent, ProbeFilter, STACK_HASH_UNRESOLVED,
    SchedulerEvent, SchedulerEventType, TASK_COMM_LEN, ns_to_us, stack_hash_from_id,
};

/// Execution context of the invoking task.
pub trait ProbeEnv {
    /// `tgid << 32 | pid` of the current task.
    fn pid_tgid(&self) -> u64;

    /// Monotonic clock in nanoseconds.
    fn ktime_ns(&self) -> u64;

    /// Short name of the current task, NUL-padded.
    fn current_comm(&self, dst: &mut [u8; TASK_COMM_LEN]);

    /// Best-effort copy of a NUL-terminated user string into `dst`. Must
    /// truncate to fit and leave `dst` NUL-terminated; failures leave `dst`
    /// untouched.
    fn read_user_str(&self, src: u64, dst: &mut [u8]);
}

/// Content-addressed table of captured call stacks.
pub trait StackIdCache {
    /// Capture the current stack and return its slot id, reusing the slot of
    /// an identical stack. Returns a negative errno when the table is full or
    /// the context cannot be unwound.
    fn stack_id(&self) -> Result<u32, i64>;
}

/// Non-blocking transport for finished records.
pub trait OutputChannel<T> {
    fn submit(&self, record: &T) -> Result<(), i64>;
}

/// Shared key/value store behind the invocation counter. Each call is atomic
/// on its own; nothing makes a `load` followed by a `store` atomic.
pub trait CounterTable {
    fn load(&self, key: u64) -> Option<u64>;
    fn store(&self, key: u64, value: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The filter rejected the task; nothing was encoded.
    Rejected,
    Emitted,
    /// The output channel refused the record; it is gone.
    Dropped,
}

/// Record emitted by a probe site.
pub trait ProbeRecord: Copy {
    const ZEROED: Self;

    /// Fill the task identity and observation time.
    fn stamp(&mut self, pid_tgid: u64, timestamp_us: u64);
}

impl ProbeRecord for CallTraceEvent {
    const ZEROED: Self = CallTraceEvent::zeroed();

    #[inline(always)]
    fn stamp(&mut self, _pid_tgid: u64, timestamp_us: u64) {
        self.timestamp = timestamp_us;
    }
}

impl ProbeRecord for FileOpenEvent {
    const ZEROED: Self = FileOpenEvent::zeroed();

    #[inline(always)]
    fn stamp(&mut self, pid_tgid: u64, timestamp_us: u64) {
        self.pid = pid_tgid as u32;
        self.tgid = (pid_tgid >> 32) as u32;
        self.timestamp = timestamp_us;
    }
}

impl ProbeRecord for SchedulerEvent {
    const ZEROED: Self = SchedulerEvent::zeroed();

    #[inline(always)]
    fn stamp(&mut self, pid_tgid: u64, timestamp_us: u64) {
        self.pid = pid_tgid as u32;
        self.tgid = (pid_tgid >> 32) as u32;
        self.timestamp = timestamp_us;
    }
}

/// Filter, encode into a zeroed record and submit.
#[inline(always)]
pub fn emit<E, T, O, F>(env: &E, filter: &ProbeFilter, out: &O, fill: F) -> ProbeOutcome
where
    E: ProbeEnv,
    T: ProbeRecord,
    O: OutputChannel<T>,
    F: FnOnce(&mut T),
{
    let pid_tgid = env.pid_tgid();
    if !filter.accepts(pid_tgid) {
        return ProbeOutcome::Rejected;
    }

    let mut record = T::ZEROED;
    record.stamp(pid_tgid, ns_to_us(env.ktime_ns()));
    fill(&mut record);

    match out.submit(&record) {
        Ok(()) => ProbeOutcome::Emitted,
        Err(_) => ProbeOutcome::Dropped,
    }
}

/// Generic traced-function entry. `name` looks up the traced symbol; it only
/// runs for accepted tasks.
#[inline(always)]
pub fn trace_function_call<E, S, O, N>(
    env: &E,
    filter: &ProbeFilter,
    stacks: &S,
    name: N,
    out: &O,
) -> ProbeOutcome
where
    E: ProbeEnv,
    S: StackIdCache,
    O: OutputChannel<CallTraceEvent>,
    N: FnOnce() -> Option<[u8; EVENT_NAME_LEN]>,
{
    emit(env, filter, out, |event: &mut CallTraceEvent| {
        if let Some(name) = name() {
            event.event_name = name;
            event.event_name[EVENT_NAME_LEN - 1] = 0;
        }
        event.stack_hash = match stacks.stack_id() {
            Ok(id) => stack_hash_from_id(id),
            Err(_) => STACK_HASH_UNRESOLVED,
        };
    })
}

/// Arguments of `openat(2)` as seen on syscall entry.
#[derive(Clone, Copy, Debug)]
pub struct OpenatArgs {
    /// User pointer to the path.
    pub filename: u64,
    pub flags: i32,
    pub mode: i32,
}

#[inline(always)]
pub fn trace_openat<E, O>(env: &E, filter: &ProbeFilter, args: &OpenatArgs, out: &O) -> ProbeOutcome
where
    E: ProbeEnv,
    O: OutputChannel<FileOpenEvent>,
{
    emit(env, filter, out, |event: &mut FileOpenEvent| {
        event.flags = args.flags;
        event.mode = args.mode;
        if args.filename != 0 {
            env.read_user_str(args.filename, &mut event.filename);
        }
    })
}

#[inline(always)]
pub fn trace_scheduler_phase<E, O>(
    env: &E,
    filter: &ProbeFilter,
    phase: SchedulerEventType,
    out: &O,
) -> ProbeOutcome
where
    E: ProbeEnv,
    O: OutputChannel<SchedulerEvent>,
{
    emit(env, filter, out, |event: &mut SchedulerEvent| {
        event.event_type = phase as u8;
        env.current_comm(&mut event.comm);
    })
}

/// Bump the invocation counter. Concurrent callers can overwrite each other's
/// increment, so the stored value is a lower bound of the true count.
#[inline(always)]
pub fn count_invocation<T: CounterTable>(table: &T) {
    let next = match table.load(crate::COUNTER_KEY) {
        Some(count) => count.wrapping_add(1),
        None => 1,
    };
    table.store(crate::COUNTER_KEY, next);
}
