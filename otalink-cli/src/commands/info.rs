//! Firmware info and port listing command implementations.

use {
    crate::serial::describe_port,
    anyhow::{Context, Result},
    console::style,
    otalink::{
        CHUNK_SIZE, FirmwareImage, NativePortEnumerator, PortEnumerator, protocol::frame,
    },
    std::path::Path,
};

/// Transfer plan for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageSummary {
    pub size: u32,
    pub crc32: u32,
    pub chunk_size: usize,
    pub chunks: usize,
    pub last_chunk: usize,
    pub wire_bytes: usize,
}

impl ImageSummary {
    pub(crate) fn new(image: &FirmwareImage, chunk_size: usize) -> Self {
        let chunks = image.total_chunks(chunk_size);
        let len = image.bytes().len();
        let last_chunk = len - (chunks - 1) * chunk_size;
        // START + HEADER + DATA frames + END
        let wire_bytes = 2 * frame::CMD_FRAME_LEN
            + frame::FRAME_OVERHEAD
            + frame::HEADER_PAYLOAD_LEN
            + chunks * frame::FRAME_OVERHEAD
            + len;

        Self {
            size: image.size(),
            crc32: image.checksum(),
            chunk_size,
            chunks,
            last_chunk,
            wire_bytes,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "size": self.size,
            "crc32": format!("0x{:08X}", self.crc32),
            "chunk_size": self.chunk_size,
            "chunks": self.chunks,
            "last_chunk": self.last_chunk,
            "wire_bytes": self.wire_bytes,
        })
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = FirmwareImage::from_file(firmware, 0)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let summary = ImageSummary::new(&image, CHUNK_SIZE);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "path": firmware.display().to_string(),
                "image": summary.to_json(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", style(firmware.display()).bold().underlined());
    println!("  {:<12} {} bytes", "Size:", summary.size);
    println!("  {:<12} 0x{:08X}", "CRC-32:", summary.crc32);
    println!(
        "  {:<12} {} x {} bytes (last {} bytes)",
        "Chunks:", summary.chunks, summary.chunk_size, summary.last_chunk
    );
    println!("  {:<12} {} bytes", "On the wire:", summary.wire_bytes);
    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;

    if json {
        let items: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": items,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
    } else {
        for port in &ports {
            println!("  {} {}", style("•").dim(), describe_port(port));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use otalink::FrameCodec;

    #[test]
    fn test_summary_of_300_byte_image() {
        let image = FirmwareImage::new(vec![0xAB; 300], 0).unwrap();
        let summary = ImageSummary::new(&image, 128);

        assert_eq!(summary.size, 300);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.last_chunk, 44);
        assert_eq!(summary.crc32, image.checksum());
        // 10 + 25 + 3 * 9 + 300 + 10
        assert_eq!(summary.wire_bytes, 372);
    }

    #[test]
    fn test_wire_bytes_follow_frame_layout() {
        let codec = FrameCodec::default();
        let image = FirmwareImage::new(vec![7; 200], 0).unwrap();
        let expected = codec.start().len()
            + codec.header(&image).len()
            + image
                .chunks(128)
                .map(|c| codec.data(c).unwrap().len())
                .sum::<usize>()
            + codec.end().len();
        assert_eq!(ImageSummary::new(&image, 128).wire_bytes, expected);
    }

    #[test]
    fn test_summary_exact_multiple() {
        let image = FirmwareImage::new(vec![0; 256], 0).unwrap();
        let summary = ImageSummary::new(&image, 128);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.last_chunk, 128);
    }

    #[test]
    fn test_summary_json_fields() {
        let image = FirmwareImage::new(vec![1, 2, 3], 0).unwrap();
        let value = ImageSummary::new(&image, 128).to_json();
        assert_eq!(value["size"], 3);
        assert_eq!(value["chunks"], 1);
        assert_eq!(value["last_chunk"], 3);
        assert!(value["crc32"].as_str().unwrap().starts_with("0x"));
    }
}
