//! GSM 07.10 frame codecs, basic and advanced option.
//!
//! Both modes share the address/control layout and the CRC-8 FCS; they
//! differ only in how frames are delimited on the wire. Basic mode uses
//! `F9` flags with an explicit length field and computes the FCS over the
//! header alone. Advanced mode uses `7E` flags with `7D`-escaping, no
//! length field, and an FCS over the unescaped address and control bytes.

/// Basic mode flag byte.
pub const BASIC_FLAG: u8 = 0xF9;
/// Advanced mode flag byte.
pub const ADV_FLAG: u8 = 0x7E;
const ADV_ESCAPE: u8 = 0x7D;
const ADV_XOR: u8 = 0x20;

/// SABM: open a channel.
pub const CTRL_SABM: u8 = 0x3F;
/// DISC: close a channel.
pub const CTRL_DISC: u8 = 0x53;
/// UIH: data frame, header-checked only.
pub const CTRL_UIH: u8 = 0xEF;
/// UI: data frame, alternative encoding some muxes use.
pub const CTRL_UI: u8 = 0x03;
/// UA with the set bit: command issued on DLC 0.
pub const CTRL_UA_SET: u8 = 0xE3;
/// UA acknowledge.
pub const CTRL_UA_ACK: u8 = 0xE1;

/// Reversed CRC-8 table for the generator polynomial 0x07 (TS 27.010
/// annex B).
static CRC_TABLE: [u8; 256] = [
    0x00, 0x91, 0xE3, 0x72, 0x07, 0x96, 0xE4, 0x75,
    0x0E, 0x9F, 0xED, 0x7C, 0x09, 0x98, 0xEA, 0x7B,
    0x1C, 0x8D, 0xFF, 0x6E, 0x1B, 0x8A, 0xF8, 0x69,
    0x12, 0x83, 0xF1, 0x60, 0x15, 0x84, 0xF6, 0x67,
    0x38, 0xA9, 0xDB, 0x4A, 0x3F, 0xAE, 0xDC, 0x4D,
    0x36, 0xA7, 0xD5, 0x44, 0x31, 0xA0, 0xD2, 0x43,
    0x24, 0xB5, 0xC7, 0x56, 0x23, 0xB2, 0xC0, 0x51,
    0x2A, 0xBB, 0xC9, 0x58, 0x2D, 0xBC, 0xCE, 0x5F,
    0x70, 0xE1, 0x93, 0x02, 0x77, 0xE6, 0x94, 0x05,
    0x7E, 0xEF, 0x9D, 0x0C, 0x79, 0xE8, 0x9A, 0x0B,
    0x6C, 0xFD, 0x8F, 0x1E, 0x6B, 0xFA, 0x88, 0x19,
    0x62, 0xF3, 0x81, 0x10, 0x65, 0xF4, 0x86, 0x17,
    0x48, 0xD9, 0xAB, 0x3A, 0x4F, 0xDE, 0xAC, 0x3D,
    0x46, 0xD7, 0xA5, 0x34, 0x41, 0xD0, 0xA2, 0x33,
    0x54, 0xC5, 0xB7, 0x26, 0x53, 0xC2, 0xB0, 0x21,
    0x5A, 0xCB, 0xB9, 0x28, 0x5D, 0xCC, 0xBE, 0x2F,
    0xE0, 0x71, 0x03, 0x92, 0xE7, 0x76, 0x04, 0x95,
    0xEE, 0x7F, 0x0D, 0x9C, 0xE9, 0x78, 0x0A, 0x9B,
    0xFC, 0x6D, 0x1F, 0x8E, 0xFB, 0x6A, 0x18, 0x89,
    0xF2, 0x63, 0x11, 0x80, 0xF5, 0x64, 0x16, 0x87,
    0xD8, 0x49, 0x3B, 0xAA, 0xDF, 0x4E, 0x3C, 0xAD,
    0xD6, 0x47, 0x35, 0xA4, 0xD1, 0x40, 0x32, 0xA3,
    0xC4, 0x55, 0x27, 0xB6, 0xC3, 0x52, 0x20, 0xB1,
    0xCA, 0x5B, 0x29, 0xB8, 0xCD, 0x5C, 0x2E, 0xBF,
    0x90, 0x01, 0x73, 0xE2, 0x97, 0x06, 0x74, 0xE5,
    0x9E, 0x0F, 0x7D, 0xEC, 0x99, 0x08, 0x7A, 0xEB,
    0x8C, 0x1D, 0x6F, 0xFE, 0x8B, 0x1A, 0x68, 0xF9,
    0x82, 0x13, 0x61, 0xF0, 0x85, 0x14, 0x66, 0xF7,
    0xA8, 0x39, 0x4B, 0xDA, 0xAF, 0x3E, 0x4C, 0xDD,
    0xA6, 0x37, 0x45, 0xD4, 0xA1, 0x30, 0x42, 0xD3,
    0xB4, 0x25, 0x57, 0xC6, 0xB3, 0x22, 0x50, 0xC1,
    0xBA, 0x2B, 0x59, 0xC8, 0xBD, 0x2C, 0x5E, 0xCF,
];

fn crc(data: &[u8]) -> u8 {
    let mut crc = 0xFF;
    for &b in data {
        crc = CRC_TABLE[(crc ^ b) as usize];
    }
    crc
}

fn fcs(data: &[u8]) -> u8 {
    0xFF - crc(data)
}

fn check_fcs(data: &[u8], received: u8) -> bool {
    CRC_TABLE[(crc(data) ^ received) as usize] == 0xCF
}

/// A frame recovered from the wire.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub dlc: u8,
    pub control: u8,
    pub data: Vec<u8>,
}

/// Result of scanning a receive buffer: bytes consumed, plus a frame when
/// one was completed. Garbage before the first valid flag is consumed and
/// discarded; an incomplete frame leaves its bytes unconsumed.
pub type Extracted = (usize, Option<Frame>);

/// Encodes a basic-option frame into `frame`, returning the encoded
/// length. The buffer must hold `data.len() + 7` bytes.
pub fn fill_basic(frame: &mut [u8], dlc: u8, control: u8, data: &[u8]) -> usize {
    frame[0] = BASIC_FLAG;
    frame[1] = (dlc << 2) | 0x03;
    frame[2] = control;

    let header_size;
    if data.len() <= 127 {
        frame[3] = ((data.len() as u8) << 1) | 0x01;
        header_size = 4;
    } else {
        frame[3] = (data.len() as u8) << 1;
        frame[4] = (data.len() >> 7) as u8;
        header_size = 5;
    }

    let mut size = header_size;
    frame[size..size + data.len()].copy_from_slice(data);
    size += data.len();

    // GSM 07.10: the FCS covers the header only.
    frame[size] = fcs(&frame[1..header_size]);
    size += 1;
    frame[size] = BASIC_FLAG;
    size + 1
}

/// Scans `buf` for one basic-option frame.
pub fn extract_basic(buf: &[u8]) -> Extracted {
    let mut posn = 0;

    while posn < buf.len() {
        if buf[posn] != BASIC_FLAG {
            posn += 1;
            continue;
        }

        // Collapse runs of flags between frames.
        while posn + 1 < buf.len() && buf[posn + 1] == BASIC_FLAG {
            posn += 1;
        }

        // Flag plus a three byte header at minimum.
        if posn + 4 > buf.len() {
            break;
        }

        // 27.010 5.2.3: the EA bit of the address must be set; if not the
        // frame is invalid and the candidate flag is skipped.
        if buf[posn + 1] & 0x01 == 0 {
            posn += 1;
            continue;
        }

        let mut framelen = (buf[posn + 3] >> 1) as usize;

        let header_size;
        if buf[posn + 3] & 0x01 != 0 {
            header_size = 3;
        } else {
            if posn + 5 > buf.len() {
                break;
            }
            framelen |= (buf[posn + 4] as usize) << 7;
            header_size = 4;
        }

        if posn + header_size + 3 + framelen > buf.len() {
            break;
        }

        let fcs_byte = buf[posn + 1 + header_size + framelen];

        // A bad FCS discards the whole candidate frame (27.010 5.2.3).
        if !check_fcs(&buf[posn + 1..posn + 1 + header_size], fcs_byte) {
            posn += header_size + framelen + 2;
            continue;
        }

        // The closing flag may double as the next frame's opener, so it
        // is checked but not consumed.
        if buf[posn + header_size + framelen + 2] != BASIC_FLAG {
            posn += header_size + framelen + 2;
            continue;
        }

        let dlc = buf[posn + 1] >> 2;
        let control = buf[posn + 2] & 0xEF; // strip the P/F bit
        let start = posn + 1 + header_size;
        let data = buf[start..start + framelen].to_vec();

        posn += header_size + framelen + 2;

        return (posn, Some(Frame { dlc, control, data }));
    }

    (posn, None)
}

/// Encodes an advanced-option frame into `frame`, returning the encoded
/// length. The buffer must hold `2 * data.len() + 7` bytes.
pub fn fill_advanced(frame: &mut [u8], dlc: u8, control: u8, data: &[u8]) -> usize {
    frame[0] = ADV_FLAG;
    frame[1] = (dlc << 2) | 0x03;
    frame[2] = control;

    let crc = fcs(&frame[1..3]);

    // The control byte is escaped only after the FCS has been computed
    // over its raw value.
    let mut size;
    if control == ADV_FLAG || control == ADV_ESCAPE {
        frame[2] = ADV_ESCAPE;
        frame[3] = control ^ ADV_XOR;
        size = 4;
    } else {
        size = 3;
    }

    for &b in data {
        if b != ADV_FLAG && b != ADV_ESCAPE {
            frame[size] = b;
            size += 1;
        } else {
            frame[size] = ADV_ESCAPE;
            frame[size + 1] = b ^ ADV_XOR;
            size += 2;
        }
    }

    if crc != ADV_FLAG && crc != ADV_ESCAPE {
        frame[size] = crc;
        size += 1;
    } else {
        frame[size] = ADV_ESCAPE;
        frame[size + 1] = crc ^ ADV_XOR;
        size += 2;
    }

    frame[size] = ADV_FLAG;
    size + 1
}

/// Scans `buf` for one advanced-option frame.
pub fn extract_advanced(buf: &[u8]) -> Extracted {
    let mut posn = 0;

    while posn < buf.len() {
        if buf[posn] != ADV_FLAG {
            posn += 1;
            continue;
        }

        while posn + 1 < buf.len() && buf[posn + 1] == ADV_FLAG {
            posn += 1;
        }

        // Find the closing flag.
        let mut end = posn + 1;
        while end < buf.len() && buf[end] != ADV_FLAG {
            end += 1;
        }

        if end >= buf.len() {
            break;
        }

        if end - posn < 4 {
            posn = end;
            continue;
        }

        // Undo the control-character quoting.
        let mut unescaped = Vec::with_capacity(end - posn);
        let mut i = posn + 1;
        while i < end {
            if buf[i] == ADV_ESCAPE {
                i += 1;
                if i >= end {
                    break;
                }
                unescaped.push(buf[i] ^ ADV_XOR);
            } else {
                unescaped.push(buf[i]);
            }
            i += 1;
        }

        // The FCS covers the unescaped address and control bytes.
        if unescaped.len() < 3 || !check_fcs(&unescaped[..2], unescaped[unescaped.len() - 1]) {
            posn = end;
            continue;
        }

        let dlc = (unescaped[0] >> 2) & 0x3F;
        let control = unescaped[1] & 0xEF;
        let data = unescaped[2..unescaped.len() - 1].to_vec();

        // Leave the closing flag for the next scan, mirroring the basic
        // extractor.
        return (end, Some(Frame { dlc, control, data }));
    }

    (posn, None)
}
