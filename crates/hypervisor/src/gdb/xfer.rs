//! qXfer:features:read: dynamically generated target description
//!
//! The XML advertises the aarch64 core registers (64-bit GPRs, sp, pc,
//! 32-bit cpsr) and the SIMD file (128-bit V registers, fpsr, fpcr),
//! matching the numbering regs.rs implements.

use core::fmt::Write;

use lazy_static::lazy_static;

use super::context::GdbContext;
use super::packet;

const TARGET_XML_CAP: usize = 8192;

struct XmlBuf {
    buf: [u8; TARGET_XML_CAP],
    len: usize,
}

impl XmlBuf {
    const fn new() -> Self {
        Self {
            buf: [0; TARGET_XML_CAP],
            len: 0,
        }
    }
}

impl Write for XmlBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

lazy_static! {
    static ref TARGET_XML: XmlBuf = {
        let mut xml = XmlBuf::new();
        generate_target_xml(&mut xml);
        xml
    };
}

fn generate_target_xml(out: &mut XmlBuf) {
    let _ = write!(
        out,
        "<?xml version=\"1.0\"?>\
         <!DOCTYPE target SYSTEM \"gdb-target.dtd\">\
         <target version=\"1.0\">\
         <architecture>aarch64</architecture>\
         <feature name=\"org.gnu.gdb.aarch64.core\">"
    );
    for i in 0..31 {
        let _ = write!(out, "<reg name=\"x{}\" bitsize=\"64\"/>", i);
    }
    let _ = write!(
        out,
        "<reg name=\"sp\" bitsize=\"64\" type=\"data_ptr\"/>\
         <reg name=\"pc\" bitsize=\"64\" type=\"code_ptr\"/>\
         <reg name=\"cpsr\" bitsize=\"32\"/>\
         </feature>\
         <feature name=\"org.gnu.gdb.aarch64.fpu\">"
    );
    for i in 0..32 {
        let _ = write!(out, "<reg name=\"v{}\" bitsize=\"128\" type=\"uint128\"/>", i);
    }
    let _ = write!(
        out,
        "<reg name=\"fpsr\" bitsize=\"32\"/>\
         <reg name=\"fpcr\" bitsize=\"32\"/>\
         </feature>\
         </target>"
    );
}

fn target_xml() -> &'static [u8] {
    &TARGET_XML.buf[..TARGET_XML.len]
}

/// annex:offset,length (annex must be target.xml)
pub fn handle_features_read(ctx: &mut GdbContext, args: &[u8]) {
    let Some(colon) = args.iter().position(|&b| b == b':') else {
        ctx.reply_error(22);
        return;
    };
    let (annex, rest) = args.split_at(colon);
    if annex != b"target.xml" {
        ctx.reply_error(0);
        return;
    }

    let mut vals = [0u64; 2];
    if packet::parse_hex_list(&rest[1..], &mut vals, b',').is_none() {
        ctx.reply_error(22);
        return;
    }
    let (offset, length) = (vals[0] as usize, vals[1] as usize);

    let xml = target_xml();
    if offset > xml.len() {
        ctx.reply_error(22);
        return;
    }

    let chunk = &xml[offset..xml.len().min(offset + length)];
    let more = offset + chunk.len() < xml.len();

    let mut out = [0u8; super::context::GDB_BUF_LEN];
    out[0] = if more { b'm' } else { b'l' };
    let (_, written) = packet::escape_binary(&mut out[1..], chunk);
    ctx.send_packet(&out[..1 + written]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_describes_core_and_fpu_features() {
        let xml = target_xml();
        let s = core::str::from_utf8(xml).unwrap();
        assert!(s.contains("org.gnu.gdb.aarch64.core"));
        assert!(s.contains("org.gnu.gdb.aarch64.fpu"));
        assert!(s.contains("<reg name=\"x30\" bitsize=\"64\"/>"));
        assert!(s.contains("<reg name=\"cpsr\" bitsize=\"32\"/>"));
        assert!(s.contains("<reg name=\"v31\" bitsize=\"128\""));
        assert!(s.ends_with("</target>"));
    }

    #[test]
    fn chunked_reads_cover_the_document() {
        let mut ctx = GdbContext::new();
        let total = target_xml().len();

        handle_features_read(&mut ctx, b"target.xml:0,100");
        let reply = ctx.test_last_sent();
        assert_eq!(reply[1], b'm');

        // A read at the tail returns 'l'
        let args = std::format!("target.xml:{:x},1000", total - 10);
        handle_features_read(&mut ctx, args.as_bytes());
        let reply = ctx.test_last_sent();
        assert_eq!(reply[1], b'l');
    }

    #[test]
    fn unknown_annex_rejected() {
        let mut ctx = GdbContext::new();
        handle_features_read(&mut ctx, b"memory-map.xml:0,100");
        assert_eq!(ctx.test_last_sent(), b"$E00#a5");
    }
}
