//! Re-framing of raw inbound bytes into length-prefixed EV3 frames.
//!
//! USB HID and the serial/TCP byte streams share the same extraction loop;
//! HID additionally skips the report-id byte Windows prepends and discards
//! the zero padding that fills fixed-size reports.

#[derive(Debug, Clone, Default)]
pub struct FramerConfig {
    /// When set, a leading byte equal to this value is dropped before the
    /// length prefix is parsed (Windows HID prepends the report id).
    pub report_id: Option<u8>,
    /// When set, a parsed body length that cannot fit this report size is
    /// treated as padding and skipped one byte at a time.
    pub max_frame: Option<usize>,
}

impl FramerConfig {
    pub fn length_prefixed() -> Self {
        Self::default()
    }

    pub fn hid(report_id: u8, report_size: usize) -> Self {
        Self {
            report_id: Some(report_id),
            max_frame: Some(report_size),
        }
    }
}

/// Pulls every complete frame out of `buffer`, leaving any partial frame
/// (or nothing) behind. Returned frames include their length prefix and
/// decode cleanly with [`crate::protocol::Packet::decode`].
pub fn extract_frames(buffer: &mut Vec<u8>, config: &FramerConfig) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        if let Some(report_id) = config.report_id
            && buffer.len() > 1
            && buffer[0] == report_id
        {
            buffer.remove(0);
        }
        if buffer.len() < 2 {
            break;
        }
        let body_len = u16::from_le_bytes([buffer[0], buffer[1]]) as usize;
        let implausible = body_len < 3
            || config
                .max_frame
                .is_some_and(|max| body_len + 2 > max);
        if implausible {
            // Padding or a desynchronised stream; resync one byte at a time.
            buffer.remove(0);
            continue;
        }
        if buffer.len() < body_len + 2 {
            break;
        }
        frames.push(buffer.drain(..body_len + 2).collect());
    }
    frames
}
