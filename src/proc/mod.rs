//! Process table, per-CPU state, and scheduler (spec.md §3, §4.6–§4.10).

pub mod context;
pub mod cpu;
pub mod process;
pub mod scheduler;
pub mod trapframe;

pub use cpu::{cpuid, mycpu, Cpu};
pub use process::{procinit, Process, ProcessError, ProcessState};
pub use scheduler::{kill, myproc, r#yield, scheduler, setkilled, sleep, wakeup};
