//! Control-character framing for FakeWire byte streams.
//!
//! Bytes below [`CONTROL_THRESHOLD`] are literal data. Bytes at or above it are
//! control symbols. A data byte that collides with the control range is sent as
//! [`ControlChar::Escape`] followed by the byte with its high bit flipped.
//! Handshake symbols carry a 32-bit big-endian parameter in the four (escaped)
//! bytes that follow them.

use heapless::Vec as ParamBytes;
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;

pub const CONTROL_THRESHOLD: u8 = 0x80;
const ESCAPE_FLIP: u8 = 0x80;
const PARAM_LEN: usize = 4;

// A flipped control-range byte must land in the data range and vice versa.
const_assert_eq!(ESCAPE_FLIP, CONTROL_THRESHOLD);
const_assert!(PARAM_LEN == core::mem::size_of::<u32>());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlChar {
    /// Primary handshake; parameter is the sender's fresh handshake ID.
    Handshake1 = 0x80,
    /// Secondary handshake; parameter echoes the peer's handshake ID.
    Handshake2 = 0x81,
    StartPacket = 0x82,
    EndPacket = 0x83,
    ErrorEndPacket = 0x84,
    FlowControl = 0x85,
    Escape = 0x87,
}

impl ControlChar {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_parametrized(self) -> bool {
        matches!(self, ControlChar::Handshake1 | ControlChar::Handshake2)
    }

    pub fn from_code(code: u8) -> Option<ControlChar> {
        match code {
            0x80 => Some(ControlChar::Handshake1),
            0x81 => Some(ControlChar::Handshake2),
            0x82 => Some(ControlChar::StartPacket),
            0x83 => Some(ControlChar::EndPacket),
            0x84 => Some(ControlChar::ErrorEndPacket),
            0x85 => Some(ControlChar::FlowControl),
            0x87 => Some(ControlChar::Escape),
            _ => None,
        }
    }
}

impl TryFrom<u8> for ControlChar {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        ControlChar::from_code(code).ok_or(CodecError::UndefinedControl(code))
    }
}

/// Decode anomalies. Surfaced as events, never dropped, so the link can reset.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("escape followed by control byte {0:#04x}")]
    EscapedControl(u8),
    #[error("undefined control byte {0:#04x}")]
    UndefinedControl(u8),
    #[error("{interrupted:?} parameter cut off after {received} bytes by {by:?}")]
    InterruptedParameter {
        interrupted: ControlChar,
        received: usize,
        by: ControlChar,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Data(Vec<u8>),
    Control { ch: ControlChar, param: Option<u32> },
    CodecError(CodecError),
}

/// Append `data` to `out`, escaping bytes in the control range.
pub fn encode_data(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        if byte >= CONTROL_THRESHOLD {
            out.push(ControlChar::Escape.code());
            out.push(byte ^ ESCAPE_FLIP);
        } else {
            out.push(byte);
        }
    }
}

/// Append a bare control symbol.
///
/// # Panics
/// For parametrized symbols and for `Escape`, which only the data encoder emits.
pub fn encode_control(ch: ControlChar, out: &mut Vec<u8>) {
    assert!(
        !ch.is_parametrized() && ch != ControlChar::Escape,
        "{:?} cannot be encoded as a bare control symbol",
        ch
    );
    out.push(ch.code());
}

/// Append a parametrized control symbol followed by its escaped parameter.
///
/// # Panics
/// If `ch` does not take a parameter.
pub fn encode_control_param(ch: ControlChar, param: u32, out: &mut Vec<u8>) {
    assert!(ch.is_parametrized(), "{:?} takes no parameter", ch);
    out.push(ch.code());
    encode_data(&param.to_be_bytes(), out);
}

/// Stateful stream decoder. Escapes and parameters may straddle `decode` calls.
#[derive(Debug, Default)]
pub struct Decoder {
    parametrized: bool,
    escaped: bool,
    data: Vec<u8>,
    param: Option<(ControlChar, ParamBytes<u8, PARAM_LEN>)>,
}

impl Decoder {
    /// Plain decoder: every control symbol is reported without a parameter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for the handshake-carrying variant of the framing.
    pub fn parametrized() -> Self {
        Self {
            parametrized: true,
            ..Self::default()
        }
    }

    pub fn decode(&mut self, raw: &[u8]) -> Vec<DecodedEvent> {
        let mut out = Vec::new();
        self.decode_into(raw, &mut out);
        out
    }

    pub fn decode_into(&mut self, raw: &[u8], out: &mut Vec<DecodedEvent>) {
        for &byte in raw {
            if self.escaped {
                self.escaped = false;
                if byte < CONTROL_THRESHOLD {
                    self.accept_data(byte ^ ESCAPE_FLIP, out);
                    continue;
                }
                // Report the broken escape, then still honour the control byte.
                self.fault(CodecError::EscapedControl(byte), out);
            }

            if byte < CONTROL_THRESHOLD {
                self.accept_data(byte, out);
                continue;
            }

            match ControlChar::from_code(byte) {
                Some(ControlChar::Escape) => self.escaped = true,
                Some(ch) => self.accept_control(ch, out),
                None => self.fault(CodecError::UndefinedControl(byte), out),
            }
        }
        self.flush_data(out);
    }

    fn accept_data(&mut self, byte: u8, out: &mut Vec<DecodedEvent>) {
        let Some((ch, bytes)) = self.param.as_mut() else {
            self.data.push(byte);
            return;
        };
        // Capacity equals PARAM_LEN and full parameters are emitted immediately.
        let _ = bytes.push(byte);
        if bytes.len() == PARAM_LEN {
            let param = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out.push(DecodedEvent::Control {
                ch: *ch,
                param: Some(param),
            });
            self.param = None;
        }
    }

    fn accept_control(&mut self, ch: ControlChar, out: &mut Vec<DecodedEvent>) {
        self.flush_data(out);
        if let Some((interrupted, bytes)) = self.param.take() {
            out.push(DecodedEvent::CodecError(CodecError::InterruptedParameter {
                interrupted,
                received: bytes.len(),
                by: ch,
            }));
        }
        if self.parametrized && ch.is_parametrized() {
            self.param = Some((ch, ParamBytes::new()));
        } else {
            out.push(DecodedEvent::Control { ch, param: None });
        }
    }

    fn fault(&mut self, error: CodecError, out: &mut Vec<DecodedEvent>) {
        self.flush_data(out);
        self.param = None;
        out.push(DecodedEvent::CodecError(error));
    }

    fn flush_data(&mut self, out: &mut Vec<DecodedEvent>) {
        if !self.data.is_empty() {
            out.push(DecodedEvent::Data(core::mem::take(&mut self.data)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl(ch: ControlChar) -> DecodedEvent {
        DecodedEvent::Control { ch, param: None }
    }

    #[test]
    fn test_data_round_trip_all_byte_values() {
        let data: Vec<u8> = (0..=255).collect();
        let mut wire = Vec::new();
        encode_data(&data, &mut wire);
        assert_eq!(wire.len(), 128 + 2 * 128);

        let events = Decoder::new().decode(&wire);
        assert_eq!(events, vec![DecodedEvent::Data(data)]);
    }

    #[test]
    fn test_data_flushed_before_control() {
        let mut wire = Vec::new();
        encode_control(ControlChar::StartPacket, &mut wire);
        encode_data(b"abc", &mut wire);
        encode_control(ControlChar::EndPacket, &mut wire);

        let events = Decoder::parametrized().decode(&wire);
        assert_eq!(
            events,
            vec![
                ctrl(ControlChar::StartPacket),
                DecodedEvent::Data(b"abc".to_vec()),
                ctrl(ControlChar::EndPacket),
            ]
        );
    }

    #[test]
    fn test_escape_split_across_calls() {
        let mut wire = Vec::new();
        encode_data(&[0xC3], &mut wire);
        assert_eq!(wire, vec![0x87, 0x43]);

        let mut decoder = Decoder::new();
        assert!(decoder.decode(&wire[..1]).is_empty());
        assert_eq!(decoder.decode(&wire[1..]), vec![DecodedEvent::Data(vec![0xC3])]);
    }

    #[test]
    fn test_escape_followed_by_control_is_reported() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(&[0x01, 0x87, 0x85]);
        assert_eq!(
            events,
            vec![
                DecodedEvent::Data(vec![0x01]),
                DecodedEvent::CodecError(CodecError::EscapedControl(0x85)),
                ctrl(ControlChar::FlowControl),
            ]
        );
    }

    #[test]
    fn test_undefined_control_is_reported() {
        let events = Decoder::new().decode(&[0xFE]);
        assert_eq!(events, vec![DecodedEvent::CodecError(CodecError::UndefinedControl(0xFE))]);
        assert_eq!(ControlChar::try_from(0xFE), Err(CodecError::UndefinedControl(0xFE)));
    }

    #[test]
    fn test_parameter_decoding_with_escaped_bytes() {
        let mut wire = Vec::new();
        encode_control_param(ControlChar::Handshake1, 0x80FF_0102, &mut wire);

        let mut decoder = Decoder::parametrized();
        let mut events = Vec::new();
        for byte in &wire {
            decoder.decode_into(core::slice::from_ref(byte), &mut events);
        }
        assert_eq!(
            events,
            vec![DecodedEvent::Control {
                ch: ControlChar::Handshake1,
                param: Some(0x80FF_0102),
            }]
        );
    }

    #[test]
    fn test_interrupted_parameter_is_reported() {
        let events = Decoder::parametrized().decode(&[0x81, 0x00, 0x01, 0x85]);
        assert_eq!(
            events,
            vec![
                DecodedEvent::CodecError(CodecError::InterruptedParameter {
                    interrupted: ControlChar::Handshake2,
                    received: 2,
                    by: ControlChar::FlowControl,
                }),
                ctrl(ControlChar::FlowControl),
            ]
        );
    }

    #[test]
    fn test_plain_decoder_ignores_parameters() {
        let events = Decoder::new().decode(&[0x80, 0x01]);
        assert_eq!(events, vec![ctrl(ControlChar::Handshake1), DecodedEvent::Data(vec![0x01])]);
    }

    #[test]
    #[should_panic(expected = "takes no parameter")]
    fn test_param_on_bare_symbol_is_fatal() {
        encode_control_param(ControlChar::FlowControl, 1, &mut Vec::new());
    }
}
