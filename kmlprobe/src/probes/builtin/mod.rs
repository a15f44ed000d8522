pub mod call_trace;
pub mod file_open;
pub mod scheduler;

pub use call_trace::CallTraceProbe;
pub use file_open::FileOpenProbe;
pub use scheduler::SchedulerPickProbe;
