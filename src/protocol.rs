//! Protocol Adapter — register read/write framing over a byte transport.
//!
//! Frames follow a Modbus-RTU-like shape: `[address][function][data...][crc]`
//! with a CRC-16/MODBUS trailer (polynomial `0xA001`, seed `0xFFFF`,
//! little-endian on the wire). The inverter always replies to exactly one
//! request; [`exchange`] performs one opportunistic retry before giving up.

use crc::{Crc, CRC_16_MODBUS};
use log::warn;

use crate::error::Error;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function codes this adapter speaks.
const FN_READ_HOLDING: u8 = 0x03;
const FN_WRITE_SINGLE: u8 = 0x06;
/// Set on the function code byte of an exception response.
const FN_EXCEPTION_BIT: u8 = 0x80;

/// Largest frame this adapter will build or accept.
pub const MAX_FRAME_LEN: usize = 256;

/// Byte-oriented transport channel the protocol adapter exchanges frames
/// over. Any UART/TCP/simulated link implements this.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Write the entire frame; returns an error if not all bytes could be
    /// written (no partial-write retry at this layer).
    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read up to `buf.len()` bytes within `timeout_ms`. Returns the number
    /// of bytes actually read (0 on timeout with nothing received).
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;
}

/// Outcome of validating a raw response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    CrcError,
    Truncated,
    Malformed,
    Exception(u8),
}

/// A decoded register value, in the order requested (not wire order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    pub address: u16,
    pub value: u16,
}

/// Build a "read holding registers" request frame into `out`.
///
/// Returns the number of bytes written, or `None` if `out` is too small or
/// `count` is out of range (1..=125, per the register-count ceiling a single
/// frame can address).
pub fn build_read_frame(
    device_addr: u8,
    start_register: u16,
    count: u16,
    out: &mut [u8],
) -> Option<usize> {
    if count == 0 || count > 125 {
        return None;
    }
    build_frame(device_addr, FN_READ_HOLDING, &start_register.to_be_bytes(), &count.to_be_bytes(), out)
}

/// Build a "write single register" request frame into `out`.
pub fn build_write_frame(device_addr: u8, register: u16, value: u16, out: &mut [u8]) -> Option<usize> {
    build_frame(device_addr, FN_WRITE_SINGLE, &register.to_be_bytes(), &value.to_be_bytes(), out)
}

fn build_frame(device_addr: u8, function: u8, field_a: &[u8; 2], field_b: &[u8; 2], out: &mut [u8]) -> Option<usize> {
    let body_len = 1 + 1 + field_a.len() + field_b.len();
    let wire_len = body_len + 2;
    if wire_len > out.len() {
        return None;
    }
    out[0] = device_addr;
    out[1] = function;
    out[2..4].copy_from_slice(field_a);
    out[4..6].copy_from_slice(field_b);
    let crc = CRC16.checksum(&out[..6]);
    out[6..8].copy_from_slice(&crc.to_le_bytes());
    Some(8)
}

/// Validate a raw response frame's structure and CRC.
///
/// Does not interpret the payload beyond the function-code/exception check;
/// callers decode register values separately via [`decode_read_response`].
pub fn validate_response(frame: &[u8]) -> ValidationOutcome {
    if frame.len() < 5 {
        return ValidationOutcome::Truncated;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let actual = CRC16.checksum(body);
    if expected != actual {
        return ValidationOutcome::CrcError;
    }

    let function = frame[1];
    if function & FN_EXCEPTION_BIT != 0 {
        if frame.len() != 5 {
            return ValidationOutcome::Malformed;
        }
        return ValidationOutcome::Exception(frame[2]);
    }

    match function {
        FN_READ_HOLDING => {
            if frame.len() < 3 {
                return ValidationOutcome::Truncated;
            }
            let byte_count = frame[2] as usize;
            if frame.len() != 3 + byte_count + 2 || byte_count % 2 != 0 {
                return ValidationOutcome::Malformed;
            }
            ValidationOutcome::Ok
        }
        FN_WRITE_SINGLE => {
            if frame.len() != 8 {
                return ValidationOutcome::Malformed;
            }
            ValidationOutcome::Ok
        }
        _ => ValidationOutcome::Malformed,
    }
}

/// Decode a validated "read holding registers" response into register
/// values, in the order of `requested_addresses` (not wire order). Out-of-
/// range registers the inverter didn't return are reported as `0` and the
/// caller is expected to bump its own out-of-range diagnostic counter.
pub fn decode_read_response(frame: &[u8], requested_addresses: &[u16]) -> heapless::Vec<RegisterValue, 125> {
    let mut out = heapless::Vec::new();
    let byte_count = frame[2] as usize;
    let data = &frame[3..3 + byte_count];

    for (i, &addr) in requested_addresses.iter().enumerate() {
        let value = data
            .get(i * 2..i * 2 + 2)
            .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]));
        let _ = out.push(RegisterValue { address: addr, value });
    }
    out
}

/// Exchange a request frame for a response, retrying once on transport
/// failure or a malformed/truncated/CRC-mismatched response.
///
/// The retry is opportunistic: it resends the identical request frame and
/// accepts whatever comes back next, without further backoff. Fault
/// classification and backoff belong to [`crate::fault`], which is expected
/// to wrap repeated calls to this function across multiple attempts.
pub fn exchange<T: Transport>(
    transport: &mut T,
    request: &[u8],
    response_buf: &mut [u8],
    timeout_ms: u32,
) -> Result<(usize, ValidationOutcome), Error> {
    let first = try_once(transport, request, response_buf, timeout_ms);
    match first {
        Ok((n, ValidationOutcome::Ok)) => return Ok((n, ValidationOutcome::Ok)),
        Ok((n, outcome)) => {
            warn!("protocol: first attempt produced {outcome:?}, retrying once");
            let _ = n;
        }
        Err(_) => warn!("protocol: first attempt failed at transport level, retrying once"),
    }
    try_once(transport, request, response_buf, timeout_ms)
}

fn try_once<T: Transport>(
    transport: &mut T,
    request: &[u8],
    response_buf: &mut [u8],
    timeout_ms: u32,
) -> Result<(usize, ValidationOutcome), Error> {
    transport.write_all(request).map_err(|_| Error::Transport)?;
    let n = transport
        .read(response_buf, timeout_ms)
        .map_err(|_| Error::Transport)?;
    if n == 0 {
        return Err(Error::Timeout);
    }
    Ok((n, validate_response(&response_buf[..n])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        inbox: VecDeque<u8>,
        pub sent: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self { inbox: VecDeque::new(), sent: Vec::new() }
        }
        fn queue_response(&mut self, bytes: &[u8]) {
            self.inbox.extend(bytes);
        }
    }

    impl Transport for MockTransport {
        type Error = ();

        fn write_all(&mut self, data: &[u8]) -> Result<(), ()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, ()> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbox.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    fn build_read_response(values: &[u16]) -> Vec<u8> {
        let mut body = vec![0x11u8, FN_READ_HOLDING, (values.len() * 2) as u8];
        for v in values {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let crc = CRC16.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    #[test]
    fn build_read_frame_has_valid_crc() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = build_read_frame(0x11, 0x0000, 3, &mut buf).unwrap();
        assert_eq!(n, 8);
        let outcome = validate_response(&buf[..n]);
        // Request frames use the same structure as a write-single response
        // in terms of CRC validity; read-request structural validation is
        // exercised through the read-response path below.
        assert_ne!(outcome, ValidationOutcome::CrcError);
    }

    #[test]
    fn build_write_frame_roundtrips_through_validate() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = build_write_frame(0x11, 0x0006, 42, &mut buf).unwrap();
        assert_eq!(validate_response(&buf[..n]), ValidationOutcome::Ok);
    }

    #[test]
    fn validate_detects_crc_error() {
        let mut frame = build_read_response(&[100, 200]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert_eq!(validate_response(&frame), ValidationOutcome::CrcError);
    }

    #[test]
    fn validate_detects_truncated() {
        let frame = [0x11, 0x03];
        assert_eq!(validate_response(&frame), ValidationOutcome::Truncated);
    }

    #[test]
    fn validate_detects_exception() {
        let mut body = vec![0x11u8, FN_READ_HOLDING | FN_EXCEPTION_BIT, 0x02];
        let crc = CRC16.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(validate_response(&body), ValidationOutcome::Exception(0x02));
    }

    #[test]
    fn decode_preserves_caller_requested_order() {
        let frame = build_read_response(&[10, 20, 30]);
        let decoded = decode_read_response(&frame, &[0x0002, 0x0000, 0x0001]);
        assert_eq!(decoded[0].value, 30);
        assert_eq!(decoded[1].value, 10);
        assert_eq!(decoded[2].value, 20);
    }

    #[test]
    fn decode_reports_zero_for_out_of_range_register() {
        let frame = build_read_response(&[10, 20]);
        let decoded = decode_read_response(&frame, &[0x0000, 0x0001, 0x0002]);
        assert_eq!(decoded[2].value, 0);
    }

    #[test]
    fn exchange_succeeds_on_first_clean_response() {
        let mut t = MockTransport::new();
        t.queue_response(&build_read_response(&[5]));
        let mut req_buf = [0u8; MAX_FRAME_LEN];
        let n = build_read_frame(0x11, 0x0000, 1, &mut req_buf).unwrap();
        let mut resp_buf = [0u8; MAX_FRAME_LEN];
        let (_, outcome) = exchange(&mut t, &req_buf[..n], &mut resp_buf, 100).unwrap();
        assert_eq!(outcome, ValidationOutcome::Ok);
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn exchange_retries_once_after_crc_error() {
        let mut t = MockTransport::new();
        let mut bad = build_read_response(&[5]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        t.queue_response(&bad);
        t.queue_response(&build_read_response(&[5]));

        let mut req_buf = [0u8; MAX_FRAME_LEN];
        let n = build_read_frame(0x11, 0x0000, 1, &mut req_buf).unwrap();
        let mut resp_buf = [0u8; MAX_FRAME_LEN];
        let (_, outcome) = exchange(&mut t, &req_buf[..n], &mut resp_buf, 100).unwrap();
        assert_eq!(outcome, ValidationOutcome::Ok);
        assert_eq!(t.sent.len(), 2);
    }

    #[test]
    fn exchange_times_out_when_nothing_received() {
        let mut t = MockTransport::new();
        let mut req_buf = [0u8; MAX_FRAME_LEN];
        let n = build_read_frame(0x11, 0x0000, 1, &mut req_buf).unwrap();
        let mut resp_buf = [0u8; MAX_FRAME_LEN];
        let result = exchange(&mut t, &req_buf[..n], &mut resp_buf, 10);
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
