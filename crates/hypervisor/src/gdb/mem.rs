//! Guest memory access (m/M/X)

use super::context::{GdbContext, GDB_BUF_LEN};
use super::packet;
use crate::guest_memory;

/// Largest raw transfer whose hex encoding still fits one packet
const MAX_TRANSFER: usize = (GDB_BUF_LEN - 16) / 2;

// Serialized by the GDB context lock
static mut XFER_SCRATCH: [u8; MAX_TRANSFER] = [0; MAX_TRANSFER];
static mut HEX_SCRATCH: [u8; GDB_BUF_LEN] = [0; GDB_BUF_LEN];

fn scratch() -> (&'static mut [u8; MAX_TRANSFER], &'static mut [u8; GDB_BUF_LEN]) {
    unsafe {
        (
            &mut *core::ptr::addr_of_mut!(XFER_SCRATCH),
            &mut *core::ptr::addr_of_mut!(HEX_SCRATCH),
        )
    }
}

/// m addr,length
pub fn handle_read_memory(ctx: &mut GdbContext, args: &[u8]) {
    let mut vals = [0u64; 2];
    if packet::parse_hex_list(args, &mut vals, b',').is_none() {
        ctx.reply_error(22);
        return;
    }
    let (addr, len) = (vals[0], (vals[1] as usize).min(MAX_TRANSFER));

    let (raw, hex) = scratch();
    let got = guest_memory::guest_read_memory(addr, &mut raw[..len]);
    if got == 0 && len != 0 {
        ctx.reply_error(14);
        return;
    }

    let n = packet::encode_hex(hex, &raw[..got]);
    let reply: &[u8] = &hex[..n];
    ctx.send_packet(reply);
}

/// M addr,length:hex-data
pub fn handle_write_memory(ctx: &mut GdbContext, args: &[u8]) {
    let mut vals = [0u64; 2];
    let Some(pos) = packet::parse_hex_list(args, &mut vals, b',') else {
        ctx.reply_error(22);
        return;
    };
    let (addr, len) = (vals[0], (vals[1] as usize).min(MAX_TRANSFER));

    if pos >= args.len() || args[pos] != b':' {
        ctx.reply_error(22);
        return;
    }
    let data_hex = &args[pos + 1..];

    let (raw, _) = scratch();
    if packet::decode_hex(&mut raw[..len], data_hex) != len {
        ctx.reply_error(22);
        return;
    }

    if guest_memory::guest_write_memory(addr, &raw[..len]) == len {
        ctx.reply_ok();
    } else {
        ctx.reply_error(14);
    }
}

/// X addr,length:binary-data (escaped)
pub fn handle_write_memory_raw(ctx: &mut GdbContext, args: &[u8]) {
    let mut vals = [0u64; 2];
    let Some(pos) = packet::parse_hex_list(args, &mut vals, b',') else {
        ctx.reply_error(22);
        return;
    };
    let (addr, len) = (vals[0], (vals[1] as usize).min(MAX_TRANSFER));

    if pos >= args.len() || args[pos] != b':' {
        ctx.reply_error(22);
        return;
    }
    let data = &args[pos + 1..];

    // "X addr,0:" probes for binary-write support
    if len == 0 {
        ctx.reply_ok();
        return;
    }

    let (raw, _) = scratch();
    let n = packet::unescape_binary(&mut raw[..len], data);
    if n != len {
        ctx.reply_error(22);
        return;
    }

    if guest_memory::guest_write_memory(addr, &raw[..len]) == len {
        ctx.reply_ok();
    } else {
        ctx.reply_error(14);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_memory::HOST_GUEST_RAM_BASE;


    fn cmd(ctx: &mut GdbContext, f: fn(&mut GdbContext, &[u8]), args: &[u8]) -> Vec<u8> {
        f(ctx, args);
        ctx.test_last_sent().to_vec()
    }

    #[test]
    fn memory_write_then_read() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        let addr = HOST_GUEST_RAM_BASE + 0x8000;

        let mut args = Vec::new();
        args.extend_from_slice(format!("{:x},4:11223344", addr).as_bytes());
        let reply = cmd(&mut ctx, handle_write_memory, &args);
        assert_eq!(reply, b"$OK#9a");

        let args = format!("{:x},4", addr);
        let reply = cmd(&mut ctx, handle_read_memory, args.as_bytes());
        assert!(reply.starts_with(b"$11223344#"));
    }

    #[test]
    fn unmapped_memory_is_an_error() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        let reply = cmd(&mut ctx, handle_read_memory, b"10,4");
        assert!(reply.starts_with(b"$E0e#"));
    }

    #[test]
    fn binary_write_with_escapes() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        let addr = HOST_GUEST_RAM_BASE + 0x8100;

        // Payload 0x24 ('$') 0x7D ('}') needs escaping on the wire
        let mut args = Vec::new();
        args.extend_from_slice(format!("{:x},2:", addr).as_bytes());
        args.extend_from_slice(&[b'}', b'$' ^ 0x20, b'}', b'}' ^ 0x20]);
        let reply = cmd(&mut ctx, handle_write_memory_raw, &args);
        assert_eq!(reply, b"$OK#9a");

        let args = format!("{:x},2", addr);
        let reply = cmd(&mut ctx, handle_read_memory, args.as_bytes());
        assert!(reply.starts_with(b"$247d#"));
    }
}
