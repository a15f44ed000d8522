pub mod call_trace;
pub mod file_open;
pub mod scheduler;
pub mod syscall_types;
