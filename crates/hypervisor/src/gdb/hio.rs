//! Host I/O replies (F)
//!
//! The File-I/O extension is not initiated by this stub, so an
//! incoming F packet can only be a stray reply (a debugger answering a
//! request we never made, or a retransmission after reconnect). It is
//! acknowledged and dropped.

use super::context::GdbContext;

pub fn handle_hio_reply(_ctx: &mut GdbContext, args: &[u8]) {
    crate::debug!(
        "gdb: unexpected file-i/o reply ({} bytes), dropping",
        args.len()
    );
    // No response: F replies terminate an exchange
}
