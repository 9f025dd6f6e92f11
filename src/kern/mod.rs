//! Kern subsystem - Core kernel primitives
//!
//! Scheduling, threads and semaphores at the bottom; processes, descriptors
//! and the syscall layer on top. [`Kernel`] is the entry point.

pub mod credentials;
pub mod exec;
pub mod fd_table;
pub mod pipe;
pub mod process;
pub mod runq;
pub mod sched_prim;
pub mod scheduler;
pub mod signal;
pub mod startup;
pub mod syscall;
pub mod thread;

pub use credentials::{Credentials, Gid, Uid};
pub use exec::{ExecImage, ImageLoader, Segment};
pub use fd_table::{FdTable, FileObject, OpenFileDescription, OpenFlags};
pub use pipe::Pipe;
pub use process::{encode_exit_code, Process, ProcessTable};
pub use runq::{QueueKind, RunQueues};
pub use sched_prim::{thread_sleep, Semaphore};
pub use scheduler::Scheduler;
pub use signal::{Signal, SignalDelivery, SignalHandler, SignalSet};
pub use startup::{absolute_path_of, Kernel};
pub use syscall::{wexitstatus, wifexited, wifsignaled, wtermsig};
pub use thread::{Thread, ThreadState, UserFrame};
