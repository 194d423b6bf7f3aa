//! Register access (g/G/p/P)
//!
//! Registers come from the selected core's saved exception frame; SIMD state
//! is materialized lazily through the FPU cache. Register numbering follows
//! the target description: 0..30 = x0..x30, 31 = sp, 32 = pc, 33 = cpsr,
//! 34..65 = v0..v31, 66 = fpsr, 67 = fpcr.

use super::context::GdbContext;
use super::packet;
use crate::exceptions::ExceptionStackFrame;

pub const REG_SP: u32 = 31;
pub const REG_PC: u32 = 32;
pub const REG_CPSR: u32 = 33;
pub const REG_V0: u32 = 34;
pub const REG_FPSR: u32 = 66;
pub const REG_FPCR: u32 = 67;

fn selected_frame(ctx: &GdbContext) -> Option<&'static mut ExceptionStackFrame> {
    let frame = crate::core_ctx::core_ctx(ctx.selected_core_g).guest_frame;
    if frame.is_null() {
        None
    } else {
        Some(unsafe { &mut *frame })
    }
}

/// The guest SP depends on which stack the interrupted context used
/// (SPSR_EL2.M[3:0]: 0b0101 = EL1h, 0b0100 = EL1t, 0b0000 = EL0).
fn frame_sp(frame: &ExceptionStackFrame) -> u64 {
    if frame.spsr_el2 & 0xF == 0b0101 {
        frame.sp_el1
    } else {
        frame.sp_el0
    }
}

fn frame_set_sp(frame: &mut ExceptionStackFrame, sp: u64) {
    if frame.spsr_el2 & 0xF == 0b0101 {
        frame.sp_el1 = sp;
    } else {
        frame.sp_el0 = sp;
    }
}

pub fn handle_read_registers(ctx: &mut GdbContext) {
    let Some(frame) = selected_frame(ctx) else {
        ctx.reply_error(14);
        return;
    };

    // 31 GPRs + sp + pc (8 bytes each) + cpsr (4 bytes)
    let mut out = [0u8; (31 + 2) * 16 + 8];
    let mut pos = 0;
    for i in 0..31 {
        pos += packet::encode_hex(&mut out[pos..], &frame.x[i].to_le_bytes());
    }
    pos += packet::encode_hex(&mut out[pos..], &frame_sp(frame).to_le_bytes());
    pos += packet::encode_hex(&mut out[pos..], &frame.elr_el2.to_le_bytes());
    pos += packet::encode_hex(&mut out[pos..], &(frame.spsr_el2 as u32).to_le_bytes());

    ctx.send_packet(&out[..pos]);
}

pub fn handle_write_registers(ctx: &mut GdbContext, args: &[u8]) {
    let Some(frame) = selected_frame(ctx) else {
        ctx.reply_error(14);
        return;
    };

    let mut raw = [0u8; 31 * 8 + 8 + 8 + 4];
    if packet::decode_hex(&mut raw, args) != raw.len() {
        ctx.reply_error(22);
        return;
    }

    for i in 0..31 {
        frame.x[i] = u64::from_le_bytes(raw[8 * i..8 * i + 8].try_into().unwrap());
    }
    frame_set_sp(frame, u64::from_le_bytes(raw[248..256].try_into().unwrap()));
    frame.elr_el2 = u64::from_le_bytes(raw[256..264].try_into().unwrap());
    let cpsr = u32::from_le_bytes(raw[264..268].try_into().unwrap());
    frame.spsr_el2 = (frame.spsr_el2 & !0xFFFF_FFFF) | cpsr as u64;

    ctx.reply_ok();
}

pub fn handle_read_register(ctx: &mut GdbContext, args: &[u8]) {
    let Some((reg, _)) = packet::parse_hex(args) else {
        ctx.reply_error(22);
        return;
    };
    let reg = reg as u32;

    let Some(frame) = selected_frame(ctx) else {
        ctx.reply_error(14);
        return;
    };

    let mut out = [0u8; 32];
    let pos = match reg {
        0..=30 => packet::encode_hex(&mut out, &frame.x[reg as usize].to_le_bytes()),
        REG_SP => packet::encode_hex(&mut out, &frame_sp(frame).to_le_bytes()),
        REG_PC => packet::encode_hex(&mut out, &frame.elr_el2.to_le_bytes()),
        REG_CPSR => packet::encode_hex(&mut out, &(frame.spsr_el2 as u32).to_le_bytes()),
        REG_V0..=65 => {
            let cache = crate::arch::fpu::save_registers();
            let q = cache.q[(reg - REG_V0) as usize];
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&q[0].to_le_bytes());
            bytes[8..].copy_from_slice(&q[1].to_le_bytes());
            packet::encode_hex(&mut out, &bytes)
        }
        REG_FPSR => packet::encode_hex(&mut out, &crate::arch::fpu::save_registers().fpsr.to_le_bytes()),
        REG_FPCR => packet::encode_hex(&mut out, &crate::arch::fpu::save_registers().fpcr.to_le_bytes()),
        _ => {
            ctx.reply_error(22);
            return;
        }
    };

    ctx.send_packet(&out[..pos]);
}

pub fn handle_write_register(ctx: &mut GdbContext, args: &[u8]) {
    let Some((reg, used)) = packet::parse_hex(args) else {
        ctx.reply_error(22);
        return;
    };
    let reg = reg as u32;

    if used >= args.len() || args[used] != b'=' {
        ctx.reply_error(22);
        return;
    }
    let val_hex = &args[used + 1..];

    let Some(frame) = selected_frame(ctx) else {
        ctx.reply_error(14);
        return;
    };

    let mut bytes = [0u8; 16];
    let n = packet::decode_hex(&mut bytes, val_hex);

    match reg {
        0..=30 if n >= 8 => {
            frame.x[reg as usize] = u64::from_le_bytes(bytes[..8].try_into().unwrap())
        }
        REG_SP if n >= 8 => frame_set_sp(frame, u64::from_le_bytes(bytes[..8].try_into().unwrap())),
        REG_PC if n >= 8 => frame.elr_el2 = u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        REG_CPSR if n >= 4 => {
            let cpsr = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            frame.spsr_el2 = (frame.spsr_el2 & !0xFFFF_FFFF) | cpsr as u64;
        }
        REG_V0..=65 if n >= 16 => {
            let cache = crate::arch::fpu::cached_registers_mut();
            cache.q[(reg - REG_V0) as usize] = [
                u64::from_le_bytes(bytes[..8].try_into().unwrap()),
                u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            ];
            crate::arch::fpu::commit_registers();
        }
        REG_FPSR if n >= 4 => {
            crate::arch::fpu::cached_registers_mut().fpsr =
                u32::from_le_bytes(bytes[..4].try_into().unwrap());
            crate::arch::fpu::commit_registers();
        }
        REG_FPCR if n >= 4 => {
            crate::arch::fpu::cached_registers_mut().fpcr =
                u32::from_le_bytes(bytes[..4].try_into().unwrap());
            crate::arch::fpu::commit_registers();
        }
        _ => {
            ctx.reply_error(22);
            return;
        }
    }

    ctx.reply_ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_selection_follows_spsr_mode() {
        let mut frame = ExceptionStackFrame::zeroed();
        frame.sp_el0 = 0x1111;
        frame.sp_el1 = 0x2222;

        frame.spsr_el2 = 0b0101; // EL1h
        assert_eq!(frame_sp(&frame), 0x2222);

        frame.spsr_el2 = 0b0000; // EL0
        assert_eq!(frame_sp(&frame), 0x1111);

        frame.spsr_el2 = 0b0101;
        frame_set_sp(&mut frame, 0x3333);
        assert_eq!(frame.sp_el1, 0x3333);
        assert_eq!(frame.sp_el0, 0x1111);
    }

    #[test]
    fn register_numbering_layout() {
        assert_eq!(REG_SP, 31);
        assert_eq!(REG_PC, 32);
        assert_eq!(REG_CPSR, 33);
        assert_eq!(REG_V0 + 32, REG_FPSR);
    }
}
