//! Verbose commands (v...)
//!
//! vCont drives per-thread execution: continue, step, and GDB's
//! range-stepping action, which maps straight onto the per-core stepping
//! window the single-step machine honors.

use super::context::{GdbContext, GdbFlags};
use super::packet;
use super::thread::parse_thread_id;
use crate::debug::manager;

pub fn handle_verbose_command(ctx: &mut GdbContext, args: &[u8]) {
    if args == b"Cont?" {
        ctx.send_packet(b"vCont;c;C;s;S;r");
    } else if let Some(actions) = args.strip_prefix(b"Cont") {
        handle_vcont(ctx, actions);
    } else if args == b"MustReplyEmpty" {
        ctx.reply_empty();
    } else {
        ctx.reply_empty();
    }
}

/// ;action[:thread-id] groups, leftmost action wins per thread.
fn handle_vcont(ctx: &mut GdbContext, actions: &[u8]) {
    let all = crate::core_ctx::get_active_core_mask();
    let mut claimed = 0u32;
    let mut continue_mask = 0u32;
    let mut step_mask = 0u32;
    let mut range_mask = 0u32;

    let mut rest = actions;
    while let Some(pos) = rest.iter().position(|&b| b == b';') {
        rest = &rest[pos + 1..];
        let end = rest
            .iter()
            .position(|&b| b == b';')
            .unwrap_or(rest.len());
        let action = &rest[..end];
        if action.is_empty() {
            continue;
        }

        let (op_len, range) = match action[0] {
            b'r' => {
                // r start,end[:tid]
                let body = &action[1..];
                let colon = body.iter().position(|&b| b == b':').unwrap_or(body.len());
                let mut vals = [0u64; 2];
                if packet::parse_hex_list(&body[..colon], &mut vals, b',').is_none() {
                    ctx.reply_error(22);
                    return;
                }
                (1 + colon, Some((vals[0], vals[1])))
            }
            b'C' | b'S' => (3.min(action.len()), None), // signal byte attached
            _ => (1, None),
        };

        let targets = match action.get(op_len).copied() {
            Some(b':') => match parse_thread_id(&action[op_len + 1..]) {
                Some(core) => 1u32 << core,
                None => {
                    ctx.reply_error(22);
                    return;
                }
            },
            _ => all & !claimed,
        };
        let targets = targets & !claimed;
        claimed |= targets;

        match action[0] {
            b'c' | b'C' => continue_mask |= targets,
            b's' | b'S' => step_mask |= targets,
            b'r' => {
                let (start, end) = range.unwrap_or((0, 0));
                for core in 0..crate::core_ctx::MAX_CORES as u32 {
                    if targets & (1 << core) != 0 {
                        manager::set_stepping_range(core, start, end);
                    }
                }
                step_mask |= targets;
                range_mask |= targets;
            }
            b't' => {
                // Stop request: leave those cores paused
            }
            other => {
                crate::debug!("gdb: unknown vCont action {:?}", other as char);
                ctx.reply_error(22);
                return;
            }
        }
    }

    // Plain steps clear any stale stepping range
    for core in 0..crate::core_ctx::MAX_CORES as u32 {
        if step_mask & !range_mask & (1 << core) != 0 {
            manager::set_stepping_range(core, 0, 0);
        }
    }

    let resume = continue_mask | step_mask;
    if resume == 0 {
        ctx.reply_ok();
        return;
    }

    ctx.flags |= GdbFlags::CONTINUING;
    manager::continue_cores(resume, step_mask);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcont_query_lists_actions() {
        let mut ctx = GdbContext::new();
        handle_verbose_command(&mut ctx, b"Cont?");
        let reply = ctx.test_last_sent();
        assert!(reply.starts_with(b"$vCont;c;C;s;S;r#"));
    }

    #[test]
    fn must_reply_empty_is_empty() {
        let mut ctx = GdbContext::new();
        handle_verbose_command(&mut ctx, b"MustReplyEmpty");
        assert_eq!(ctx.test_last_sent(), b"$#00");
    }

    #[test]
    fn vcont_with_bad_thread_errors() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        handle_verbose_command(&mut ctx, b"Cont;s:99");
        assert_eq!(ctx.test_last_sent(), b"$E16#ac");
    }
}
