//! Serial frame codec
//!
//! Every frame starts with a header byte (`0x80 | opcode`) followed by an
//! opcode-specific payload of 7-bit bytes. Integers wider than 7 bits are
//! split into two big-endian 7-bit digits (`hi * 128 + lo`).
//!
//! Commands sent to the device use the same header, carry 7-bit parameters
//! and end with a `0x80` terminator.
//!
//! A serial read timeout is the normal idle signal, so the decoder reports
//! short reads as [`DecodeOutcome::Idle`] (nothing read) or as a
//! [`FramingError::Truncated`] (part of a frame read), never as an I/O error.

use super::info::DeviceInfo;
use crate::error::{CommandError, FramingError};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read};

/// High bit marking a header byte
pub const HEADER_BIT: u8 = 0x80;

/// Byte ending every outbound command
pub const TERMINATOR: u8 = 128;

/// Largest value a single parameter byte can carry
pub const MAX_PARAM: i32 = 127;

/// Largest value representable by two 7-bit digits
pub const MAX_SPLIT_VALUE: u16 = 128 * 128 - 1;

/// Upper bound on pin counts announced by an INFO frame
pub const MAX_INFO_PINS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // device -> host
    Analog,
    Digital,
    Heartbeat,
    Button,
    Reply,
    Error,
    /// Device info frame inbound, info request outbound
    Info,
    Message,
    // host -> device
    /// Re-send the state of every digital pin
    ForceDigital,
    Set,
    Get,
    Led,
}

impl Opcode {
    pub const INBOUND: [Opcode; 8] = [
        Opcode::Analog,
        Opcode::Digital,
        Opcode::Heartbeat,
        Opcode::Button,
        Opcode::Reply,
        Opcode::Error,
        Opcode::Info,
        Opcode::Message,
    ];

    /// ASCII code carried in the low 7 bits of the header
    pub fn code(self) -> u8 {
        match self {
            Opcode::Analog => b'A',
            Opcode::Digital => b'D',
            Opcode::Heartbeat => b'H',
            Opcode::Button => b'B',
            Opcode::Reply => b'R',
            Opcode::Error => b'E',
            Opcode::Info => b'I',
            Opcode::Message => b'M',
            Opcode::ForceDigital => b'F',
            Opcode::Set => b'S',
            Opcode::Get => b'G',
            Opcode::Led => b'L',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'A' => Opcode::Analog,
            b'D' => Opcode::Digital,
            b'H' => Opcode::Heartbeat,
            b'B' => Opcode::Button,
            b'R' => Opcode::Reply,
            b'E' => Opcode::Error,
            b'I' => Opcode::Info,
            b'M' => Opcode::Message,
            b'F' => Opcode::ForceDigital,
            b'S' => Opcode::Set,
            b'G' => Opcode::Get,
            b'L' => Opcode::Led,
            _ => return None,
        })
    }

    pub fn header(self) -> u8 {
        HEADER_BIT | self.code()
    }

    pub fn as_char(self) -> char {
        self.code() as char
    }

    /// Whether the device sends this opcode
    pub fn is_inbound(self) -> bool {
        Self::INBOUND.contains(&self)
    }

    /// Payload length for fixed-size frames, `None` for INFO and MESSAGE
    pub fn payload_len(self) -> Option<usize> {
        match self {
            Opcode::Analog | Opcode::Reply => Some(3),
            Opcode::Digital | Opcode::Button | Opcode::Error => Some(2),
            Opcode::Heartbeat => Some(0),
            _ => None,
        }
    }
}

/// Device parameters reachable with `S` and `G`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceParam {
    /// `pin, percent`
    Smoothing,
    /// `pin, type`
    FilterType,
    /// `hi, lo` milliseconds
    HeartPeriod,
}

impl DeviceParam {
    pub fn code(self) -> u8 {
        match self {
            DeviceParam::Smoothing => b'S',
            DeviceParam::FilterType => b'F',
            DeviceParam::HeartPeriod => b'H',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'S' => Some(DeviceParam::Smoothing),
            b'F' => Some(DeviceParam::FilterType),
            b'H' => Some(DeviceParam::HeartPeriod),
            _ => None,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl SerialFrame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }
}

/// Result of one decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Frame(SerialFrame),
    /// The read timed out before any byte arrived
    Idle,
    /// A byte without the header bit, skipped
    Noise(u8),
    /// A frame was started but could not be completed
    Malformed(FramingError),
}

/// Read until `buf` is full, the source times out, or it reports EOF
///
/// Returns the number of bytes read. Only real I/O failures are errors.
fn read_bounded<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Bytes handed back to the decoder, read before the source
struct Pushback<'a, R: ?Sized> {
    pending: &'a mut VecDeque<u8>,
    src: &'a mut R,
}

impl<R: Read + ?Sized> Read for Pushback<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return self.src.read(buf);
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Why a payload could not be read in full
enum PayloadError {
    /// A header byte at this offset of the payload buffer
    Header(usize),
    Framing(FramingError),
}

fn read_payload<R: Read + ?Sized>(
    src: &mut R,
    opcode: Opcode,
    len: usize,
    out: &mut Vec<u8>,
) -> io::Result<Result<(), PayloadError>> {
    let start = out.len();
    out.resize(start + len, 0);
    let got = read_bounded(src, &mut out[start..])?;
    out.truncate(start + got);
    if let Some(pos) = out[start..].iter().position(|b| *b & HEADER_BIT != 0) {
        return Ok(Err(PayloadError::Header(start + pos)));
    }
    if got < len {
        return Ok(Err(PayloadError::Framing(FramingError::Truncated {
            opcode: opcode.as_char(),
            expected: start + len,
            got: start + got,
        })));
    }
    Ok(Ok(()))
}

/// Incremental frame decoder
///
/// A header byte found inside a payload ends the current frame with
/// [`FramingError::UnexpectedHeader`]. That byte and everything read after
/// it are kept and decoded next, so the frame it starts is not lost.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: VecDeque<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget bytes kept from a previous link
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Decode the next frame from `src`
    pub fn decode<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<DecodeOutcome> {
        let mut payload = Vec::new();
        let (opcode, outcome) = {
            let mut reader = Pushback {
                pending: &mut self.pending,
                src,
            };
            let mut header = [0u8; 1];
            if read_bounded(&mut reader, &mut header)? == 0 {
                return Ok(DecodeOutcome::Idle);
            }
            let header = header[0];
            if header & HEADER_BIT == 0 {
                return Ok(DecodeOutcome::Noise(header));
            }
            let opcode = Opcode::from_code(header & !HEADER_BIT).filter(|op| op.is_inbound());
            let opcode = match opcode {
                Some(op) => op,
                None => {
                    return Ok(DecodeOutcome::Malformed(FramingError::UnknownOpcode(
                        header,
                    )))
                }
            };
            (opcode, read_frame_payload(&mut reader, opcode, &mut payload)?)
        };

        Ok(match outcome {
            Ok(()) => DecodeOutcome::Frame(SerialFrame::new(opcode, payload)),
            Err(PayloadError::Header(pos)) => {
                let byte = payload[pos];
                for b in payload[pos..].iter().rev() {
                    self.pending.push_front(*b);
                }
                DecodeOutcome::Malformed(FramingError::UnexpectedHeader {
                    opcode: opcode.as_char(),
                    byte,
                })
            }
            Err(PayloadError::Framing(e)) => DecodeOutcome::Malformed(e),
        })
    }
}

fn read_frame_payload<R: Read + ?Sized>(
    src: &mut R,
    opcode: Opcode,
    payload: &mut Vec<u8>,
) -> io::Result<Result<(), PayloadError>> {
    if let Some(len) = opcode.payload_len() {
        return read_payload(src, opcode, len, payload);
    }
    // INFO opens with two pin counts, MESSAGE with its length
    let prefix = if opcode == Opcode::Info { 2 } else { 1 };
    if let Err(e) = read_payload(src, opcode, prefix, payload)? {
        return Ok(Err(e));
    }
    let len = if opcode == Opcode::Info {
        let (num_digital, num_analog) = (payload[0] as usize, payload[1] as usize);
        if num_digital > MAX_INFO_PINS || num_analog > MAX_INFO_PINS {
            return Ok(Err(PayloadError::Framing(FramingError::BadLength {
                opcode: opcode.as_char(),
                reason: format!(
                    "{} digital / {} analog pins (max {})",
                    num_digital, num_analog, MAX_INFO_PINS
                ),
            })));
        }
        4 * num_analog
    } else {
        payload[0] as usize
    };
    read_payload(src, opcode, len, payload)
}

/// Encode a command for the device
///
/// Every parameter must fit in 7 bits. Nothing is produced if one does not.
pub fn encode_command(opcode: Opcode, params: &[i32]) -> Result<Vec<u8>, CommandError> {
    if let Some(&bad) = params.iter().find(|p| !(0..=MAX_PARAM).contains(*p)) {
        return Err(CommandError::out_of_range(
            format!("'{}' command parameter", opcode.as_char()),
            bad as i64,
            0,
            MAX_PARAM as i64,
        ));
    }
    let mut bytes = Vec::with_capacity(params.len() + 2);
    bytes.push(opcode.header());
    bytes.extend(params.iter().map(|p| *p as u8));
    bytes.push(TERMINATOR);
    Ok(bytes)
}

/// Encode a frame the way the device sends it
pub fn encode_frame(frame: &SerialFrame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.payload.len() + 1);
    bytes.push(frame.opcode.header());
    bytes.extend_from_slice(&frame.payload);
    bytes
}

/// Split a value into two 7-bit digits (`hi`, `lo`)
pub fn split_value(value: u16) -> (u8, u8) {
    let value = value.min(MAX_SPLIT_VALUE);
    ((value >> 7) as u8, (value & 0x7F) as u8)
}

pub fn join_value(hi: u8, lo: u8) -> u16 {
    ((hi & 0x7F) as u16) << 7 | (lo & 0x7F) as u16
}

/// A frame interpreted by opcode
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Analog { pin: usize, value: u16 },
    Digital { pin: usize, value: u8 },
    Heartbeat,
    Button { button: u8, value: u8 },
    Reply { id: u8, value: u16 },
    Error { code: u8, id: u8 },
    Info(DeviceInfo),
    Message(String),
}

impl DeviceEvent {
    pub fn parse(frame: &SerialFrame) -> Result<Self, FramingError> {
        let p = &frame.payload;
        let bad = |reason: String| FramingError::BadPayload {
            opcode: frame.opcode.as_char(),
            reason,
        };
        let need = |len: usize| {
            if p.len() < len {
                Err(FramingError::Truncated {
                    opcode: frame.opcode.as_char(),
                    expected: len,
                    got: p.len(),
                })
            } else {
                Ok(())
            }
        };

        match frame.opcode {
            Opcode::Analog => {
                need(3)?;
                Ok(DeviceEvent::Analog {
                    pin: p[0] as usize,
                    value: join_value(p[1], p[2]),
                })
            }
            Opcode::Digital => {
                need(2)?;
                if p[1] > 1 {
                    return Err(bad(format!("digital value {}", p[1])));
                }
                Ok(DeviceEvent::Digital {
                    pin: p[0] as usize,
                    value: p[1],
                })
            }
            Opcode::Heartbeat => Ok(DeviceEvent::Heartbeat),
            Opcode::Button => {
                need(2)?;
                Ok(DeviceEvent::Button {
                    button: p[0],
                    value: p[1],
                })
            }
            Opcode::Reply => {
                need(3)?;
                Ok(DeviceEvent::Reply {
                    id: p[0],
                    value: join_value(p[1], p[2]),
                })
            }
            Opcode::Error => {
                need(2)?;
                Ok(DeviceEvent::Error {
                    code: p[0],
                    id: p[1],
                })
            }
            Opcode::Info => DeviceInfo::from_payload(p).map(DeviceEvent::Info),
            Opcode::Message => {
                need(1)?;
                let text = p.get(1..).unwrap_or_default();
                Ok(DeviceEvent::Message(String::from_utf8_lossy(text).into_owned()))
            }
            other => Err(bad(format!("'{}' is not sent by the device", other.as_char()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn decode_bytes(bytes: &[u8]) -> DecodeOutcome {
        FrameDecoder::new()
            .decode(&mut Cursor::new(bytes.to_vec()))
            .unwrap()
    }

    fn decode_all(bytes: &[u8]) -> Vec<DecodeOutcome> {
        let mut decoder = FrameDecoder::new();
        let mut cursor = Cursor::new(bytes.to_vec());
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut cursor).unwrap() {
                DecodeOutcome::Idle => return out,
                outcome => out.push(outcome),
            }
        }
    }

    #[test]
    fn test_encode_command_appends_terminator() {
        let bytes = encode_command(Opcode::Set, &[b'S' as i32, 2, 50]).unwrap();
        assert_eq!(bytes, vec![0x80 | b'S', b'S', 2, 50, 128]);
        assert_eq!(encode_command(Opcode::ForceDigital, &[]).unwrap(), vec![0xC6, 128]);
    }

    #[test]
    fn test_encode_command_rejects_out_of_range() {
        assert!(matches!(
            encode_command(Opcode::Led, &[128]),
            Err(CommandError::OutOfRange { value: 128, .. })
        ));
        assert!(encode_command(Opcode::Led, &[-1]).is_err());
    }

    #[test]
    fn test_decode_analog() {
        let out = decode_bytes(&[0x80 | b'A', 2, 7, 127]);
        let DecodeOutcome::Frame(frame) = out else {
            panic!("expected frame, got {:?}", out);
        };
        assert_eq!(
            DeviceEvent::parse(&frame).unwrap(),
            DeviceEvent::Analog {
                pin: 2,
                value: 7 * 128 + 127
            }
        );
    }

    #[test]
    fn test_noise_is_skipped() {
        assert_eq!(
            decode_all(&[0x12, 0x80 | b'H']),
            vec![
                DecodeOutcome::Noise(0x12),
                DecodeOutcome::Frame(SerialFrame::new(Opcode::Heartbeat, vec![])),
            ]
        );
    }

    #[test]
    fn test_short_read_is_truncated() {
        let out = decode_bytes(&[0x80 | b'A', 1]);
        assert_eq!(
            out,
            DecodeOutcome::Malformed(FramingError::Truncated {
                opcode: 'A',
                expected: 3,
                got: 1
            })
        );
    }

    #[test]
    fn test_header_inside_payload() {
        let out = decode_bytes(&[0x80 | b'D', 0x80 | b'H', 1]);
        assert!(matches!(
            out,
            DecodeOutcome::Malformed(FramingError::UnexpectedHeader { opcode: 'D', .. })
        ));
    }

    #[test]
    fn test_frame_after_cut_short_frame_survives() {
        let out = decode_all(&[0x80 | b'D', 3, 0x80 | b'A', 1, 7, 127]);
        assert_eq!(
            out,
            vec![
                DecodeOutcome::Malformed(FramingError::UnexpectedHeader {
                    opcode: 'D',
                    byte: 0x80 | b'A'
                }),
                DecodeOutcome::Frame(SerialFrame::new(Opcode::Analog, vec![1, 7, 127])),
            ]
        );
    }

    #[test]
    fn test_bytes_after_stray_header_are_kept() {
        // the analog payload swallows the heartbeat header and one byte after it
        let out = decode_all(&[0x80 | b'A', 2, 0x80 | b'H', 0x80 | b'D', 4, 1]);
        assert_eq!(
            out,
            vec![
                DecodeOutcome::Malformed(FramingError::UnexpectedHeader {
                    opcode: 'A',
                    byte: 0x80 | b'H'
                }),
                DecodeOutcome::Frame(SerialFrame::new(Opcode::Heartbeat, vec![])),
                DecodeOutcome::Frame(SerialFrame::new(Opcode::Digital, vec![4, 1])),
            ]
        );
    }

    #[test]
    fn test_clear_drops_kept_bytes() {
        let mut decoder = FrameDecoder::new();
        let mut cursor = Cursor::new(vec![0x80 | b'D', 0x80 | b'H']);
        assert!(matches!(
            decoder.decode(&mut cursor).unwrap(),
            DecodeOutcome::Malformed(_)
        ));
        decoder.clear();
        assert_eq!(decoder.decode(&mut cursor).unwrap(), DecodeOutcome::Idle);
    }

    #[test]
    fn test_unknown_and_outbound_opcodes_rejected() {
        assert_eq!(
            decode_bytes(&[0x80 | b'z']),
            DecodeOutcome::Malformed(FramingError::UnknownOpcode(0x80 | b'z'))
        );
        assert!(matches!(
            decode_bytes(&[0x80 | b'G', 1]),
            DecodeOutcome::Malformed(FramingError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn test_info_frame() {
        let bytes = [0x80 | b'I', 10, 2, 7, 127, 1, 50, 7, 127, 0, 0];
        let DecodeOutcome::Frame(frame) = decode_bytes(&bytes) else {
            panic!("expected frame");
        };
        assert_eq!(frame.payload.len(), 10);
        let DeviceEvent::Info(info) = DeviceEvent::parse(&frame).unwrap() else {
            panic!("expected info");
        };
        assert_eq!(info.num_digital, 10);
        assert_eq!(info.analog.len(), 2);
        assert_eq!(info.analog[0].resolution, 1023);
        assert_eq!(info.analog[0].smoothing, 50);
    }

    #[test]
    fn test_info_frame_bad_count() {
        assert!(matches!(
            decode_bytes(&[0x80 | b'I', 100, 0]),
            DecodeOutcome::Malformed(FramingError::BadLength { opcode: 'I', .. })
        ));
    }

    #[test]
    fn test_message_frame() {
        let bytes = [0x80 | b'M', 5, b'h', b'e', b'l', b'l', b'o'];
        let DecodeOutcome::Frame(frame) = decode_bytes(&bytes) else {
            panic!("expected frame");
        };
        assert_eq!(
            DeviceEvent::parse(&frame).unwrap(),
            DeviceEvent::Message("hello".to_string())
        );
    }

    #[test]
    fn test_digital_value_must_be_binary() {
        let frame = SerialFrame::new(Opcode::Digital, vec![0, 5]);
        assert!(matches!(
            DeviceEvent::parse(&frame),
            Err(FramingError::BadPayload { opcode: 'D', .. })
        ));
    }

    #[test]
    fn test_split_join() {
        assert_eq!(split_value(1023), (7, 127));
        assert_eq!(join_value(7, 127), 1023);
        assert_eq!(split_value(u16::MAX), (127, 127));
    }

    fn fixed_opcode() -> impl Strategy<Value = Opcode> {
        prop::sample::select(vec![
            Opcode::Analog,
            Opcode::Digital,
            Opcode::Heartbeat,
            Opcode::Button,
            Opcode::Reply,
            Opcode::Error,
        ])
    }

    proptest! {
        #[test]
        fn test_encoded_commands_are_well_formed(
            params in prop::collection::vec(0i32..=127, 0..8)
        ) {
            let bytes = encode_command(Opcode::Set, &params).unwrap();
            prop_assert_eq!(bytes.len(), params.len() + 2);
            prop_assert_eq!(*bytes.last().unwrap(), TERMINATOR);
            for b in &bytes[1..bytes.len() - 1] {
                prop_assert!(*b <= 127);
            }
        }

        #[test]
        fn test_out_of_range_param_never_encodes(
            params in prop::collection::vec(0i32..=127, 0..8),
            bad in prop_oneof![128i32..10_000, -10_000i32..0],
            at in any::<prop::sample::Index>()
        ) {
            let mut params = params;
            let pos = at.index(params.len() + 1);
            params.insert(pos, bad);
            prop_assert!(encode_command(Opcode::Set, &params).is_err());
        }

        #[test]
        fn test_fixed_frames_roundtrip(
            opcode in fixed_opcode(),
            bytes in prop::collection::vec(0u8..128, 3)
        ) {
            let len = opcode.payload_len().unwrap();
            let frame = SerialFrame::new(opcode, bytes[..len].to_vec());
            let decoded = decode_bytes(&encode_frame(&frame));
            prop_assert_eq!(decoded, DecodeOutcome::Frame(frame));
        }

        #[test]
        fn test_split_join_roundtrip(value in 0u16..=MAX_SPLIT_VALUE) {
            let (hi, lo) = split_value(value);
            prop_assert!(hi < 128 && lo < 128);
            prop_assert_eq!(join_value(hi, lo), value);
        }
    }
}
