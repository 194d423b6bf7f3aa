//! General queries (q/Q)

use super::context::{GdbContext, GdbFlags};
use super::packet;

fn starts_with<'a>(args: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    args.strip_prefix(prefix)
}

pub fn handle_read_query(ctx: &mut GdbContext, args: &[u8]) {
    if starts_with(args, b"Supported").is_some() {
        // PacketSize is the payload limit in hex
        ctx.send_packet(
            b"PacketSize=800;qXfer:features:read+;QStartNoAckMode+;\
              vContSupported+;swbreak+;hwbreak+;QThreadEvents+",
        );
    } else if let Some(rest) = starts_with(args, b"Xfer:features:read:") {
        super::xfer::handle_features_read(ctx, rest);
    } else if starts_with(args, b"C").is_some() && args.len() == 1 {
        let mut buf = [0u8; 16];
        buf[..2].copy_from_slice(b"QC");
        let n = 2 + packet::write_hex_u64(&mut buf[2..], ctx.selected_core_g as u64 + 1);
        ctx.send_packet(&buf[..n]);
    } else if starts_with(args, b"fThreadInfo").is_some() {
        // All active cores in one response
        let mut buf = [0u8; 64];
        let mut pos = 0;
        buf[pos] = b'm';
        pos += 1;
        let mask = crate::core_ctx::get_active_core_mask();
        let mut first = true;
        for core in 0..crate::core_ctx::MAX_CORES as u32 {
            if mask & (1 << core) != 0 {
                if !first {
                    buf[pos] = b',';
                    pos += 1;
                }
                pos += packet::write_hex_u64(&mut buf[pos..], core as u64 + 1);
                first = false;
            }
        }
        ctx.send_packet(&buf[..pos]);
    } else if starts_with(args, b"sThreadInfo").is_some() {
        ctx.send_packet(b"l");
    } else if starts_with(args, b"Attached").is_some() {
        // We always attach to the running guest, never spawn it
        ctx.send_packet(b"1");
    } else {
        ctx.reply_empty();
    }
}

pub fn handle_write_query(ctx: &mut GdbContext, args: &[u8]) {
    if starts_with(args, b"StartNoAckMode").is_some() {
        // The OK still travels under the old ack regime
        ctx.reply_ok();
        ctx.flags |= GdbFlags::NOACK;
    } else if let Some(rest) = starts_with(args, b"ThreadEvents:") {
        match rest.first().copied() {
            Some(b'1') => {
                ctx.flags |= GdbFlags::THREAD_EVENTS;
                ctx.reply_ok();
            }
            Some(b'0') => {
                ctx.flags &= !GdbFlags::THREAD_EVENTS;
                ctx.reply_ok();
            }
            _ => ctx.reply_error(22),
        }
    } else {
        ctx.reply_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_advertises_noack_and_xfer() {
        let mut ctx = GdbContext::new();
        handle_read_query(&mut ctx, b"Supported:multiprocess+;xmlRegisters=i386");
        let reply = ctx.test_last_sent();
        let body = &reply[1..reply.len() - 3];
        assert!(body.windows(15).any(|w| w == b"QStartNoAckMode"));
        assert!(body.windows(19).any(|w| w == b"qXfer:features:read"));
    }

    #[test]
    fn qc_reports_selected_thread() {
        let mut ctx = GdbContext::new();
        ctx.selected_core_g = 2;
        handle_read_query(&mut ctx, b"C");
        assert_eq!(ctx.test_last_sent(), b"$QC3#c7");
    }

    #[test]
    fn noack_mode_sets_flag() {
        let mut ctx = GdbContext::new();
        handle_write_query(&mut ctx, b"StartNoAckMode");
        assert!(ctx.flags.contains(GdbFlags::NOACK));
        assert_eq!(ctx.test_last_sent(), b"$OK#9a");
    }

    #[test]
    fn thread_events_toggle() {
        let mut ctx = GdbContext::new();
        handle_write_query(&mut ctx, b"ThreadEvents:1");
        assert!(ctx.flags.contains(GdbFlags::THREAD_EVENTS));
        handle_write_query(&mut ctx, b"ThreadEvents:0");
        assert!(!ctx.flags.contains(GdbFlags::THREAD_EVENTS));
    }

    #[test]
    fn unknown_query_is_empty_reply() {
        let mut ctx = GdbContext::new();
        handle_read_query(&mut ctx, b"Symbol::");
        assert_eq!(ctx.test_last_sent(), b"$#00");
    }
}
