#![forbid(unsafe_code)]

pub mod dispatch;
pub mod interrupts;
pub mod io;

pub use dispatch::{CompletionPort, Dispatcher, InlineDispatcher, Job, WorkerPool};
pub use interrupts::{InterruptController, LevelInterrupts};
pub use io::{MmioBus, MmioDevice};
