//! GDB remote-serial-protocol server
//!
//! A transport-agnostic gdbserver implementation driven entirely from the
//! transport RX interrupt: each packet is parsed and answered in interrupt
//! context while the debugged cores sit in their pause loops. Threads map
//! 1:1 onto physical cores (thread id = core id + 1).

pub mod packet;
pub mod context;
pub mod debug;
pub mod regs;
pub mod mem;
pub mod query;
pub mod thread;
pub mod stop_points;
pub mod verbose;
pub mod xfer;
pub mod hio;

pub use context::{GdbContext, GdbState};
