//! GDB server context and packet pump
//!
//! One context, one debugger, one transport. Packets arrive through the
//! transport RX interrupt; the whole request/response cycle runs under the
//! interface lock with the stopped cores parked in their pause loops.

use bitflags::bitflags;

use super::packet;
use crate::transport::{self, TransportInterface, TransportInterfaceType};

/// Max raw payload per packet; qSupported advertises this
pub const GDB_BUF_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GdbState {
    Disconnected,
    Connected,
    Attached,
    Detaching,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GdbFlags: u32 {
        /// QStartNoAckMode negotiated
        const NOACK = 1 << 0;
        /// `!` extended mode
        const EXTENDED = 1 << 1;
        /// Guest running (continue/step issued, no stop reply sent yet)
        const CONTINUING = 1 << 2;
        /// QThreadEvents on
        const THREAD_EVENTS = 1 << 3;
    }
}

pub struct GdbContext {
    pub state: GdbState,
    pub flags: GdbFlags,
    pub iface: Option<&'static TransportInterface>,

    /// Payload of the packet being handled
    pub recv_buffer: [u8; GDB_BUF_LEN],
    pub recv_len: usize,

    /// Last framed packet, for nack-triggered retransmits
    last_sent: [u8; GDB_BUF_LEN + 8],
    last_sent_len: usize,

    /// Thread selected with Hg / Hc, as a core id; -1 ("all") maps to 0
    pub selected_core_g: u32,
    pub selected_core_c: u32,

    /// Core whose stop event was last reported
    pub last_stop_core: u32,
}

impl GdbContext {
    pub const fn new() -> Self {
        Self {
            state: GdbState::Disconnected,
            flags: GdbFlags::empty(),
            iface: None,
            recv_buffer: [0; GDB_BUF_LEN],
            recv_len: 0,
            last_sent: [0; GDB_BUF_LEN + 8],
            last_sent_len: 0,
            selected_core_g: 0,
            selected_core_c: 0,
            last_stop_core: 0,
        }
    }

    /// Last framed packet, for unit tests
    #[cfg(test)]
    pub fn test_last_sent(&self) -> &[u8] {
        &self.last_sent[..self.last_sent_len]
    }

    fn write_raw(&self, data: &[u8]) {
        if let Some(iface) = self.iface {
            iface.write_data(data);
        }
    }

    /// Frame and send a payload, remembering it for retransmission.
    pub fn send_packet(&mut self, payload: &[u8]) {
        let len = payload.len().min(GDB_BUF_LEN);
        let payload = &payload[..len];

        self.last_sent[0] = b'$';
        self.last_sent[1..1 + len].copy_from_slice(payload);
        self.last_sent[1 + len] = b'#';
        let cksum = packet::compute_checksum(payload);
        packet::encode_hex(&mut self.last_sent[2 + len..4 + len], &[cksum]);
        self.last_sent_len = len + 4;

        self.write_raw(&self.last_sent[..self.last_sent_len]);
    }

    pub fn reply_ok(&mut self) {
        self.send_packet(b"OK");
    }

    pub fn reply_empty(&mut self) {
        self.send_packet(b"");
    }

    pub fn reply_error(&mut self, errno: u32) {
        let mut buf = [0u8; 8];
        buf[0] = b'E';
        let n = 1 + fmt_hex2(&mut buf[1..], errno as u8);
        self.send_packet(&buf[..n]);
    }

    pub fn reply_result(&mut self, r: crate::lib::error::Result<()>) {
        match r {
            Ok(()) => self.reply_ok(),
            Err(e) => self.reply_error(e.errno()),
        }
    }

    fn send_ack(&self, ok: bool) {
        if !self.flags.contains(GdbFlags::NOACK) {
            self.write_raw(if ok { b"+" } else { b"-" });
        }
    }

    /// Pull one packet off the wire. Returns the payload length to process,
    /// 0 when the exchange was pure protocol (acks, retransmits).
    fn receive_packet(&mut self, iface: &TransportInterface) -> usize {
        let mut hdr = [0u8; 1];
        iface.read_data(&mut hdr);

        match hdr[0] {
            b'+' => return 0,
            b'-' => {
                // Retransmit request
                if self.flags.contains(GdbFlags::NOACK) {
                    crate::warn!("gdb: nack received in no-ack mode");
                    return 0;
                }
                self.write_raw(&self.last_sent[..self.last_sent_len]);
                return 0;
            }
            0x03 => {
                // Break-in: synthesized as a one-byte command
                self.recv_buffer[0] = 0x03;
                self.recv_len = 1;
                return 1;
            }
            b'$' => {}
            other => {
                crate::warn!("gdb: bad packet header {:#x}", other);
                self.send_ack(false);
                return 0;
            }
        }

        // Payload until '#'
        let mut len = 0usize;
        loop {
            let mut byte = [0u8; 1];
            iface.read_data(&mut byte);
            if byte[0] == b'#' {
                break;
            }
            if len == GDB_BUF_LEN {
                crate::warn!("gdb: oversized packet");
                self.send_ack(false);
                return 0;
            }
            self.recv_buffer[len] = byte[0];
            len += 1;
        }

        let mut cksum_hex = [0u8; 2];
        iface.read_data(&mut cksum_hex);
        let mut cksum = [0u8; 1];
        if packet::decode_hex(&mut cksum, &cksum_hex) != 1
            || cksum[0] != packet::compute_checksum(&self.recv_buffer[..len])
        {
            crate::warn!("gdb: checksum mismatch");
            self.send_ack(false);
            return 0;
        }

        self.send_ack(true);
        self.recv_len = len;
        len
    }

    fn process_packet(&mut self, len: usize) {
        let cmd = self.recv_buffer[0];

        if self.state == GdbState::Disconnected {
            super::debug::attach(self);
        }

        // The handlers read their arguments out of a copy so they are free
        // to reuse the context buffers for replies. The GDB path is
        // serialized by the context lock, so one static scratch is enough.
        static mut CMD_SCRATCH: [u8; GDB_BUF_LEN] = [0; GDB_BUF_LEN];
        let args_len = len.saturating_sub(1);
        let args: &[u8] = unsafe {
            let scratch = &mut *core::ptr::addr_of_mut!(CMD_SCRATCH);
            scratch[..args_len].copy_from_slice(&self.recv_buffer[1..len]);
            &scratch[..args_len]
        };

        match cmd {
            0x03 => super::debug::handle_break(self),
            b'?' => super::debug::handle_get_stop_reason(self),
            b'!' => {
                self.flags |= GdbFlags::EXTENDED;
                self.reply_ok();
            }
            b'c' | b'C' => super::debug::handle_continue(self, cmd, args),
            b's' | b'S' => super::debug::handle_step(self, cmd, args),
            b'D' => super::debug::handle_detach(self),
            b'k' => super::debug::handle_kill(self),
            b'F' => super::hio::handle_hio_reply(self, args),
            b'g' => super::regs::handle_read_registers(self),
            b'G' => super::regs::handle_write_registers(self, args),
            b'p' => super::regs::handle_read_register(self, args),
            b'P' => super::regs::handle_write_register(self, args),
            b'm' => super::mem::handle_read_memory(self, args),
            b'M' => super::mem::handle_write_memory(self, args),
            b'X' => super::mem::handle_write_memory_raw(self, args),
            b'H' => super::thread::handle_set_thread_id(self, args),
            b'T' => super::thread::handle_is_thread_alive(self, args),
            b'q' => super::query::handle_read_query(self, args),
            b'Q' => super::query::handle_write_query(self, args),
            b'v' => super::verbose::handle_verbose_command(self, args),
            b'z' | b'Z' => super::stop_points::handle_toggle_stop_point(self, cmd, args),
            _ => {
                crate::debug!("gdb: unsupported command {:?}", cmd as char);
                self.reply_empty();
            }
        }

        if self.state == GdbState::Detaching {
            super::debug::finalize_detach(self);
        }
    }
}

static G_GDB_LOCK: crate::sync::RecursiveSpinlock = crate::sync::RecursiveSpinlock::new();
static mut G_GDB_CONTEXT: GdbContext = GdbContext::new();

/// The single debugger context, callers serialize through the transport
/// interface lock (interrupt path) or the context lock (event reporting).
pub fn gdb_context() -> &'static mut GdbContext {
    unsafe { &mut *core::ptr::addr_of_mut!(G_GDB_CONTEXT) }
}

pub fn lock() {
    G_GDB_LOCK.lock();
}

pub fn unlock() {
    G_GDB_LOCK.unlock();
}

fn receive_data_callback(iface: &TransportInterface, _ctx: usize) -> usize {
    lock();
    let n = gdb_context().receive_packet(iface);
    unlock();
    n
}

fn process_data_callback(_iface: &TransportInterface, _ctx: usize, size: usize) {
    lock();
    gdb_context().process_packet(size);
    unlock();
}

/// Bring the server up on the debug UART and adopt the RX interrupt on this
/// core.
pub fn init() {
    let iface = transport::create(
        TransportInterfaceType::Uart,
        0,
        0,
        Some(receive_data_callback),
        Some(process_data_callback),
        0,
    );
    gdb_context().iface = Some(iface);
    iface.set_interrupt_affinity(1 << crate::core_ctx::current_core_id());
    crate::info!("gdb: server listening on the debug UART");
}

fn fmt_hex2(dst: &mut [u8], val: u8) -> usize {
    packet::encode_hex(dst, &[val])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_packet_carries_checksum() {
        let mut ctx = GdbContext::new();
        // No interface: send_packet only records the frame
        ctx.send_packet(b"OK");
        assert_eq!(&ctx.last_sent[..ctx.last_sent_len], b"$OK#9a");
    }

    #[test]
    fn error_reply_format() {
        let mut ctx = GdbContext::new();
        ctx.reply_error(22);
        assert_eq!(&ctx.last_sent[..ctx.last_sent_len], b"$E16#ac");
    }
}
