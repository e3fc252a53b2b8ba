//! TFTP wire format (RFC 1350) plus option extension framing (RFC 2347).

use anyhow::bail;

pub const OP_RRQ: u16 = 1;
pub const OP_WRQ: u16 = 2;
pub const OP_DATA: u16 = 3;
pub const OP_ACK: u16 = 4;
pub const OP_ERROR: u16 = 5;
pub const OP_OACK: u16 = 6;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    IllegalOperation = 4,
}

/// A parsed read request: filename, transfer mode, and negotiated options in
/// the order the client sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: String,
    pub options: Vec<(String, String)>,
}

fn take_cstr<'a>(data: &'a [u8], what: &str) -> anyhow::Result<(&'a str, &'a [u8])> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow::anyhow!("unterminated {what}"))?;
    let s = std::str::from_utf8(&data[..end])
        .map_err(|_| anyhow::anyhow!("{what} is not UTF-8"))?;
    Ok((s, &data[end + 1..]))
}

/// Parse an RRQ packet body (after the opcode has been checked).
pub fn parse_rrq(data: &[u8]) -> anyhow::Result<ReadRequest> {
    if data.len() < 2 || u16::from_be_bytes([data[0], data[1]]) != OP_RRQ {
        bail!("not a read request");
    }
    let (filename, rest) = take_cstr(&data[2..], "filename")?;
    let (mode, mut rest) = take_cstr(rest, "mode")?;
    if filename.is_empty() {
        bail!("empty filename");
    }
    let mode = mode.to_ascii_lowercase();
    if mode != "octet" && mode != "netascii" {
        bail!("unsupported transfer mode {mode:?}");
    }

    let mut options = Vec::new();
    while !rest.is_empty() {
        let (name, r) = take_cstr(rest, "option name")?;
        let (value, r) = take_cstr(r, "option value")?;
        options.push((name.to_ascii_lowercase(), value.to_string()));
        rest = r;
    }

    Ok(ReadRequest {
        filename: filename.to_string(),
        mode,
        options,
    })
}

pub fn build_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&OP_DATA.to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn build_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&OP_ACK.to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf
}

pub fn build_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + message.len());
    buf.extend_from_slice(&OP_ERROR.to_be_bytes());
    buf.extend_from_slice(&(code as u16).to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf
}

pub fn build_oack(options: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&OP_OACK.to_be_bytes());
    for (name, value) in options {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf
}

/// Block number acknowledged by an ACK packet, `None` for anything else.
pub fn parse_ack(data: &[u8]) -> Option<u16> {
    if data.len() < 4 || u16::from_be_bytes([data[0], data[1]]) != OP_ACK {
        return None;
    }
    Some(u16::from_be_bytes([data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrq(filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OP_RRQ.to_be_bytes());
        buf.extend_from_slice(filename.as_bytes());
        buf.push(0);
        buf.extend_from_slice(mode.as_bytes());
        buf.push(0);
        for (name, value) in options {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_rrq_with_options() {
        let packet = rrq(
            "aa:bb:cc:dd:ee:ff/class/info",
            "octet",
            &[("blksize", "1468"), ("tsize", "0")],
        );
        let request = parse_rrq(&packet).unwrap();
        assert_eq!(request.filename, "aa:bb:cc:dd:ee:ff/class/info");
        assert_eq!(request.mode, "octet");
        assert_eq!(
            request.options,
            vec![
                ("blksize".to_string(), "1468".to_string()),
                ("tsize".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_bad_rrq() {
        assert!(parse_rrq(&rrq("", "octet", &[])).is_err());
        assert!(parse_rrq(&rrq("file", "mail", &[])).is_err());
        assert!(parse_rrq(&[0, 3, b'x', 0]).is_err());
        // unterminated mode string
        assert!(parse_rrq(&[0, 1, b'f', 0, b'o', b'c']).is_err());
    }

    #[test]
    fn packet_builders() {
        assert_eq!(build_data(1, b"hi"), vec![0, 3, 0, 1, b'h', b'i']);
        assert_eq!(build_ack(7), vec![0, 4, 0, 7]);
        assert_eq!(parse_ack(&build_ack(7)), Some(7));
        assert_eq!(parse_ack(&build_data(1, b"")), None);

        let err = build_error(ErrorCode::FileNotFound, "no");
        assert_eq!(err, vec![0, 5, 0, 1, b'n', b'o', 0]);

        let oack = build_oack(&[("blksize".to_string(), "1400".to_string())]);
        assert_eq!(&oack[..2], &[0, 6]);
        assert!(oack.ends_with(b"blksize\x001400\x00"));
    }
}
