//! Kernel process handles.
//!
//! A kernel is an external interpreter process that executes notebook
//! code. This module spawns it (optionally jailed and running as a
//! dedicated OS user), tracks its lifecycle state, and exposes its stdio
//! as channels.

mod id;
mod io;
mod process;
mod spec;
mod state;

pub use id::ProcessId;
pub use io::{AsyncKernelReader, AsyncKernelWriter, KernelOutput, OutputStream, MAX_LINE_BYTES};
pub use process::{KernelIo, KernelProcess};
pub use spec::{Framing, IsolationSpec, KernelSpec};
pub use state::ProcessState;
