use crate::domain::tally::TallyColor;
use thiserror::Error;

/// Flag bits in the UMD v5.0 header.
const FLAG_UTF16: u8 = 0x01;
const FLAG_SCONTROL: u8 = 0x02;

/// One display entry within a UMD frame.
#[derive(Clone, Debug, PartialEq)]
pub struct UmdDisplay {
    pub index: u16,
    pub rh_tally: TallyColor,
    pub txt_tally: TallyColor,
    pub lh_tally: TallyColor,
    pub brightness: u8,
    pub text: String,
}

/// A parsed UMD v5.0 packet: screen index plus display entries. All header
/// fields are big-endian; display text is length-prefixed UTF-8, or UTF-16LE
/// when the flags byte says so.
#[derive(Clone, Debug, PartialEq)]
pub struct UmdFrame {
    pub version: u8,
    pub screen: u16,
    pub displays: Vec<UmdDisplay>,
}

impl UmdFrame {
    /// Parse one frame from the front of `buf`, returning it together with
    /// any trailing bytes (datagrams may carry several frames).
    pub fn parse(buf: &[u8]) -> Result<(UmdFrame, &[u8]), UmdParseError> {
        if buf.len() < 6 {
            return Err(UmdParseError::Truncated);
        }
        let byte_count = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let version = buf[2];
        let flags = buf[3];
        let screen = u16::from_be_bytes([buf[4], buf[5]]);
        if byte_count < 6 || byte_count > buf.len() {
            return Err(UmdParseError::Truncated);
        }
        if flags & FLAG_SCONTROL != 0 {
            return Err(UmdParseError::ScontrolUnsupported);
        }

        let mut body = &buf[6..byte_count];
        let remaining = &buf[byte_count..];
        let mut displays = Vec::new();
        while !body.is_empty() {
            let (display, rest) = parse_display(body, flags)?;
            displays.push(display);
            body = rest;
        }
        Ok((UmdFrame { version, screen, displays }, remaining))
    }

    /// Parse every frame in a datagram. Fails as a whole on the first
    /// malformed frame; the listener counts and drops the datagram.
    pub fn parse_all(mut buf: &[u8]) -> Result<Vec<UmdFrame>, UmdParseError> {
        let mut frames = Vec::new();
        while !buf.is_empty() {
            let (frame, rest) = UmdFrame::parse(buf)?;
            frames.push(frame);
            buf = rest;
        }
        Ok(frames)
    }
}

fn parse_display(buf: &[u8], flags: u8) -> Result<(UmdDisplay, &[u8]), UmdParseError> {
    if buf.len() < 4 {
        return Err(UmdParseError::Truncated);
    }
    let index = u16::from_be_bytes([buf[0], buf[1]]);
    let control = u16::from_be_bytes([buf[2], buf[3]]);
    let buf = &buf[4..];
    if control & 0x0f == 0x0f {
        return Err(UmdParseError::ControlDataUnsupported);
    }

    if buf.len() < 2 {
        return Err(UmdParseError::Truncated);
    }
    let text_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let buf = &buf[2..];
    if buf.len() < text_len {
        return Err(UmdParseError::Truncated);
    }
    let text_bytes = &buf[..text_len];
    let text = if flags & FLAG_UTF16 != 0 {
        if text_len % 2 != 0 {
            return Err(UmdParseError::BadText);
        }
        let units: Vec<u16> = text_bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        String::from_utf16(&units).map_err(|_| UmdParseError::BadText)?
    } else {
        std::str::from_utf8(text_bytes).map_err(|_| UmdParseError::BadText)?.to_string()
    };

    Ok((
        UmdDisplay {
            index,
            rh_tally: TallyColor::from_wire(control),
            txt_tally: TallyColor::from_wire(control >> 2),
            lh_tally: TallyColor::from_wire(control >> 4),
            brightness: ((control >> 6) & 0b11) as u8,
            text,
        },
        &buf[text_len..],
    ))
}

#[derive(Error, Debug, PartialEq)]
pub enum UmdParseError {
    #[error("frame shorter than its header promises")]
    Truncated,
    #[error("SCONTROL frames are not supported")]
    ScontrolUnsupported,
    #[error("per-display control data is undefined for UMD v5.0")]
    ControlDataUnsupported,
    #[error("display text is not valid for the declared encoding")]
    BadText,
}
