//! Thread commands (H/T); threads are physical cores, tid = core id + 1

use super::context::GdbContext;
use super::packet;

/// Parse a thread id field: `-1` (all), `0` (any) or a hex tid. Returns a
/// core id, treating "all"/"any" as core 0.
pub fn parse_thread_id(args: &[u8]) -> Option<u32> {
    if args.starts_with(b"-1") {
        return Some(0);
    }
    let (tid, _) = packet::parse_hex(args)?;
    if tid == 0 {
        Some(0)
    } else if (tid as usize) <= crate::core_ctx::MAX_CORES {
        Some(tid as u32 - 1)
    } else {
        None
    }
}

/// H op tid: select the thread later register/step commands act on.
pub fn handle_set_thread_id(ctx: &mut GdbContext, args: &[u8]) {
    if args.is_empty() {
        ctx.reply_error(22);
        return;
    }
    let op = args[0];
    let Some(core) = parse_thread_id(&args[1..]) else {
        ctx.reply_error(22);
        return;
    };

    match op {
        b'g' => ctx.selected_core_g = core,
        b'c' => ctx.selected_core_c = core,
        _ => {
            ctx.reply_error(22);
            return;
        }
    }
    ctx.reply_ok();
}

/// T tid: is the thread alive?
pub fn handle_is_thread_alive(ctx: &mut GdbContext, args: &[u8]) {
    let Some(core) = parse_thread_id(args) else {
        ctx.reply_error(22);
        return;
    };

    if crate::core_ctx::get_active_core_mask() & (1 << core) != 0 {
        ctx.reply_ok();
    } else {
        ctx.reply_error(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_map_to_cores() {
        assert_eq!(parse_thread_id(b"1"), Some(0));
        assert_eq!(parse_thread_id(b"4"), Some(3));
        assert_eq!(parse_thread_id(b"-1"), Some(0));
        assert_eq!(parse_thread_id(b"0"), Some(0));
        assert_eq!(parse_thread_id(b"5"), None);
        assert_eq!(parse_thread_id(b"zz"), None);
    }

    #[test]
    fn hg_selects_register_thread() {
        let mut ctx = GdbContext::new();
        handle_set_thread_id(&mut ctx, b"g3");
        assert_eq!(ctx.selected_core_g, 2);
        assert_eq!(ctx.test_last_sent(), b"$OK#9a");
        handle_set_thread_id(&mut ctx, b"c2");
        assert_eq!(ctx.selected_core_c, 1);
    }
}
