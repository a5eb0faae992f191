use base64::Engine;

use crate::error::{Result, SealError};

const LINE_WIDTH: usize = 64;

/// Armor labels used by sealpost.
pub const PUBLIC_KEY: &str = "SEALPOST PUBLIC KEY";
pub const PRIVATE_KEY: &str = "SEALPOST PRIVATE KEY";
pub const MESSAGE: &str = "SEALPOST MESSAGE";
pub const SIGNED_MESSAGE: &str = "SEALPOST SIGNED MESSAGE";

/// Wrap binary data in `-----BEGIN <label>-----` / `-----END <label>-----` lines.
pub fn encode(label: &str, data: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(data);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in b64.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII, chunk boundaries are always char boundaries
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

/// Return the label of the first armor block in `text`, if any.
pub fn label_of(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("-----BEGIN ")?.strip_suffix("-----"))
}

/// Decode the armor block carrying `label`. Text outside the block is ignored.
pub fn decode(label: &str, text: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let mut body = String::new();
    let mut inside = false;
    let mut closed = false;
    for line in text.lines() {
        let line = line.trim();
        if !inside {
            inside = line == begin;
            continue;
        }
        if line == end {
            closed = true;
            break;
        }
        body.push_str(line);
    }

    if !inside {
        return Err(SealError::InvalidMessage(format!("missing '{}' header", begin)));
    }
    if !closed {
        return Err(SealError::InvalidMessage(format!("missing '{}' footer", end)));
    }

    base64::engine::general_purpose::STANDARD
        .decode(body.as_bytes())
        .map_err(|e| SealError::InvalidMessage(format!("invalid base64 in armor: {}", e)))
}
