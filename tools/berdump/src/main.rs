//! Dump the TLV structure of a BER/DER file.  Diagnostic aid for looking
//! at envelopes and certificates on disk.

use anyhow::{bail, Context, Result};
use sealkit_core::ber::{BerReader, Length};

fn tag_name(tag: u8) -> String {
    match tag {
        0x01 => "BOOLEAN".into(),
        0x02 => "INTEGER".into(),
        0x03 => "BIT STRING".into(),
        0x04 => "OCTET STRING".into(),
        0x05 => "NULL".into(),
        0x06 => "OBJECT IDENTIFIER".into(),
        0x0A => "ENUMERATED".into(),
        0x0C => "UTF8String".into(),
        0x13 => "PrintableString".into(),
        0x14 => "T61String".into(),
        0x16 => "IA5String".into(),
        0x17 => "UTCTime".into(),
        0x18 => "GeneralizedTime".into(),
        0x1E => "BMPString".into(),
        0x24 => "OCTET STRING (constructed)".into(),
        0x30 => "SEQUENCE".into(),
        0x31 => "SET".into(),
        t if t & 0xC0 == 0x80 => {
            if t & 0x20 != 0 {
                format!("[{}]", t & 0x1F)
            } else {
                format!("[{}] (primitive)", t & 0x1F)
            }
        }
        t => format!("tag 0x{:02X}", t),
    }
}

fn dump(data: &[u8], depth: usize, limit: usize) -> Result<usize> {
    let mut reader = BerReader::new(data);
    while !reader.is_empty() && reader.pos() < limit {
        if reader.check_eoc() {
            println!("{:indent$}EOC", "", indent = depth * 2);
            continue;
        }
        let start = reader.pos();
        let tag = match reader.read_tag() {
            Ok(tag) => tag,
            Err(_) => bail!("malformed tag at offset {start}"),
        };
        let length = reader
            .read_length()
            .with_context(|| format!("bad length at offset {start}"))?;
        let constructed = tag & 0x20 != 0;
        match length {
            Length::Indefinite => {
                // Children run on to the matching EOC, printed inline at
                // the same depth.
                println!(
                    "{:indent$}{} (indefinite)",
                    "",
                    tag_name(tag),
                    indent = depth * 2
                );
            }
            Length::Definite(len) => {
                let value_start = reader.pos();
                if constructed {
                    println!(
                        "{:indent$}{} ({} bytes)",
                        "",
                        tag_name(tag),
                        len,
                        indent = depth * 2
                    );
                    dump(&data[value_start..value_start + len], depth + 1, len)?;
                } else {
                    let value = &data[value_start..(value_start + len).min(data.len())];
                    let shown = &value[..value.len().min(24)];
                    let ellipsis = if value.len() > 24 { ".." } else { "" };
                    println!(
                        "{:indent$}{} ({} bytes) {}{}",
                        "",
                        tag_name(tag),
                        len,
                        hex::encode(shown),
                        ellipsis,
                        indent = depth * 2
                    );
                }
                reader.skip(len)?;
            }
        }
    }
    Ok(reader.pos())
}

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: berdump <file>")?;
    let data = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
    dump(&data, 0, data.len())?;
    Ok(())
}
