/// Common tracepoint header for syscall events (sys_enter_*, sys_exit_*)
#[repr(C)]
#[allow(dead_code)]
pub struct SyscallTraceHeader {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    pub __syscall_nr: i32,
    pub _pad: i32,
}

/// `syscalls:sys_enter_openat`, see
/// `/sys/kernel/tracing/events/syscalls/sys_enter_openat/format`.
#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterOpenat {
    pub header: SyscallTraceHeader,
    pub dfd: i64,
    pub filename: u64,
    pub flags: i64,
    pub mode: i64,
}
