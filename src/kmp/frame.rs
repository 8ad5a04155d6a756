//! # KMP Frame Codec
//!
//! This module encodes register requests for, and decodes register responses
//! from, Kamstrup meters speaking the Kamstrup Meter Protocol (KMP).
//!
//! ## Frame layout
//!
//! ```text
//! start | dst 0x3F | cid 0x10 | data ... | crc_hi | crc_lo | stop 0x0D
//! ```
//!
//! Requests start with `0x80`, responses with `0x40`. Everything between the
//! delimiters is byte-stuffed: each of `0x06 0x0D 0x1B 0x40 0x80` is sent as
//! `0x1B, byte ^ 0xFF`. The CRC is CRC-16/XMODEM over the unstuffed payload.
//!
//! A request carries `n key_hi key_lo ...`; a response carries one block per
//! register:
//!
//! ```text
//! key_hi | key_lo | unit | len | siex | mantissa[len]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kamstrup_rs::kmp::frame::{decode_response, encode_request, encode_response};
//! use kamstrup_rs::payload::{RawSample, RegisterKey};
//!
//! let request = encode_request(&[RegisterKey(60), RegisterKey(68)]).unwrap();
//! assert_eq!(request[0], 0x80);
//!
//! let sample = RawSample { key: RegisterKey(60), unit_code: 2, mantissa: 1234, exponent: 0 };
//! let decoded = decode_response(&encode_response(&[sample])).unwrap();
//! assert_eq!(decoded.samples, vec![sample]);
//! ```

use crate::constants::{
    KMP_CID_GET_REGISTER, KMP_DESTINATION_ADDRESS, KMP_ESCAPE, KMP_ESCAPE_MASK,
    KMP_MAX_MANTISSA_BYTES, KMP_MAX_REGISTERS_PER_REQUEST, KMP_RESERVED_BYTES,
    KMP_SIEX_EXPONENT_MASK, KMP_SIEX_EXPONENT_NEGATIVE, KMP_SIEX_MANTISSA_NEGATIVE,
    KMP_START_REQUEST, KMP_START_RESPONSE, KMP_STOP,
};
use crate::error::{DecodeError, EncodeError};
use crate::payload::record::{Measurement, RawSample, RegisterKey};
use crate::payload::units::is_known_unit;
use crc::{Crc, CRC_16_XMODEM};
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;

const KMP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Size of the header of a response register block (key, unit, len, siex).
const BLOCK_HEADER_LEN: usize = 5;

/// The outcome of decoding a register response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedResponse {
    /// One sample per register block, in frame order.
    pub samples: Vec<RawSample>,
    /// Non-fatal problems, currently only [`DecodeError::UnknownUnit`].
    pub warnings: Vec<DecodeError>,
}

impl DecodedResponse {
    /// Scales every sample through the unit table.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.samples.iter().map(RawSample::to_measurement).collect()
    }
}

/// Computes the KMP checksum of an unstuffed payload.
pub fn crc16(data: &[u8]) -> u16 {
    KMP_CRC.checksum(data)
}

/// Builds a "get register" request for up to eight registers.
pub fn encode_request(keys: &[RegisterKey]) -> Result<Vec<u8>, EncodeError> {
    if keys.is_empty() {
        return Err(EncodeError::Empty);
    }
    if keys.len() > KMP_MAX_REGISTERS_PER_REQUEST {
        return Err(EncodeError::TooManyKeys {
            count: keys.len(),
            max: KMP_MAX_REGISTERS_PER_REQUEST,
        });
    }

    let mut payload = Vec::with_capacity(3 + keys.len() * 2);
    payload.push(KMP_DESTINATION_ADDRESS);
    payload.push(KMP_CID_GET_REGISTER);
    payload.push(keys.len() as u8);
    for key in keys {
        payload.extend_from_slice(&key.to_be_bytes());
    }

    Ok(wrap_frame(KMP_START_REQUEST, payload))
}

/// Builds the meter's answer to a register request. Used by the meter
/// simulator; the exponent magnitude is limited to six bits on the wire.
pub fn encode_response(samples: &[RawSample]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + samples.len() * (BLOCK_HEADER_LEN + 4));
    payload.push(KMP_DESTINATION_ADDRESS);
    payload.push(KMP_CID_GET_REGISTER);

    for sample in samples {
        let magnitude = sample.mantissa.unsigned_abs();
        let width = mantissa_width(magnitude);

        let mut siex = sample.exponent.unsigned_abs() & KMP_SIEX_EXPONENT_MASK;
        if sample.exponent < 0 {
            siex |= KMP_SIEX_EXPONENT_NEGATIVE;
        }
        if sample.mantissa < 0 {
            siex |= KMP_SIEX_MANTISSA_NEGATIVE;
        }

        payload.extend_from_slice(&sample.key.to_be_bytes());
        payload.push(sample.unit_code);
        payload.push(width as u8);
        payload.push(siex);
        payload.extend_from_slice(&magnitude.to_be_bytes()[KMP_MAX_MANTISSA_BYTES - width..]);
    }

    wrap_frame(KMP_START_RESPONSE, payload)
}

/// Decodes a register response into raw samples.
///
/// `bytes` must span exactly one frame, from the `0x40` start byte up to and
/// including the stop byte.
pub fn decode_response(bytes: &[u8]) -> Result<DecodedResponse, DecodeError> {
    let payload = unwrap_frame(bytes, KMP_START_RESPONSE)?;
    let mut input = check_header(&payload)?;

    let mut response = DecodedResponse::default();
    while !input.is_empty() {
        let (rest, sample) = parse_register_block(input)?;
        if !is_known_unit(sample.unit_code) {
            response.warnings.push(DecodeError::UnknownUnit {
                key: sample.key,
                code: sample.unit_code,
            });
        }
        response.samples.push(sample);
        input = rest;
    }

    Ok(response)
}

/// Decodes a register request into the requested keys.
pub fn decode_request(bytes: &[u8]) -> Result<Vec<RegisterKey>, DecodeError> {
    let payload = unwrap_frame(bytes, KMP_START_REQUEST)?;
    let body = check_header(&payload)?;

    let (keys, count) = be_u8::<_, nom::error::Error<&[u8]>>(body).map_err(|_| {
        DecodeError::Truncated {
            needed: 1,
            available: 0,
        }
    })?;
    let needed = usize::from(count) * 2;
    if keys.len() != needed {
        return Err(DecodeError::Truncated {
            needed,
            available: keys.len(),
        });
    }

    Ok(keys
        .chunks_exact(2)
        .map(|pair| RegisterKey(u16::from_be_bytes([pair[0], pair[1]])))
        .collect())
}

/// Appends the CRC, stuffs reserved bytes and adds the delimiters.
fn wrap_frame(start: u8, mut payload: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&payload);
    payload.extend_from_slice(&crc.to_be_bytes());

    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(start);
    for byte in payload {
        if KMP_RESERVED_BYTES.contains(&byte) {
            frame.push(KMP_ESCAPE);
            frame.push(byte ^ KMP_ESCAPE_MASK);
        } else {
            frame.push(byte);
        }
    }
    frame.push(KMP_STOP);
    frame
}

/// Strips the delimiters, reverses the byte stuffing and validates the CRC.
/// Returns the payload without the CRC.
fn unwrap_frame(bytes: &[u8], start: u8) -> Result<Vec<u8>, DecodeError> {
    let inner = match bytes {
        [first, inner @ .., last] if *first == start && *last == KMP_STOP => inner,
        _ => return Err(DecodeError::Delimiter),
    };

    let mut payload = Vec::with_capacity(inner.len());
    let mut iter = inner.iter();
    while let Some(&byte) = iter.next() {
        if byte == KMP_ESCAPE {
            let escaped = iter.next().ok_or(DecodeError::DanglingEscape)?;
            payload.push(escaped ^ KMP_ESCAPE_MASK);
        } else {
            payload.push(byte);
        }
    }

    if payload.len() < 2 {
        return Err(DecodeError::Truncated {
            needed: 2,
            available: payload.len(),
        });
    }

    let (body, crc_bytes) = payload.split_at(payload.len() - 2);
    let expected = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
    let calculated = crc16(body);
    if expected != calculated {
        return Err(DecodeError::ChecksumMismatch {
            expected,
            calculated,
        });
    }

    payload.truncate(payload.len() - 2);
    Ok(payload)
}

/// Checks the destination address and command id, returning the data part.
fn check_header(payload: &[u8]) -> Result<&[u8], DecodeError> {
    match payload {
        [address, command, data @ ..] => {
            if *address != KMP_DESTINATION_ADDRESS || *command != KMP_CID_GET_REGISTER {
                return Err(DecodeError::UnexpectedHeader {
                    address: *address,
                    command: *command,
                });
            }
            Ok(data)
        }
        _ => Err(DecodeError::Truncated {
            needed: 2,
            available: payload.len(),
        }),
    }
}

/// Parses the fixed header of a register block.
fn block_header(input: &[u8]) -> IResult<&[u8], (u16, u8, u8, u8)> {
    tuple((be_u16, be_u8, be_u8, be_u8))(input)
}

/// Parses one register block into a raw sample.
fn parse_register_block(input: &[u8]) -> Result<(&[u8], RawSample), DecodeError> {
    let (input, (id, unit_code, width, siex)) =
        block_header(input).map_err(|_| DecodeError::Truncated {
            needed: BLOCK_HEADER_LEN,
            available: input.len(),
        })?;
    let key = RegisterKey(id);

    let width_bytes = usize::from(width);
    if width_bytes == 0 || width_bytes > KMP_MAX_MANTISSA_BYTES {
        return Err(DecodeError::MantissaWidth(width));
    }

    let (rest, digits) = take::<_, _, nom::error::Error<&[u8]>>(width_bytes)(input).map_err(
        |_| DecodeError::Truncated {
            needed: width_bytes,
            available: input.len(),
        },
    )?;

    let magnitude = digits
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
    let magnitude = i128::from(magnitude);
    let signed = if siex & KMP_SIEX_MANTISSA_NEGATIVE != 0 {
        -magnitude
    } else {
        magnitude
    };
    let mantissa = i64::try_from(signed).map_err(|_| DecodeError::MantissaOverflow { key })?;

    let mut exponent = (siex & KMP_SIEX_EXPONENT_MASK) as i8;
    if siex & KMP_SIEX_EXPONENT_NEGATIVE != 0 {
        exponent = -exponent;
    }

    Ok((
        rest,
        RawSample {
            key,
            unit_code,
            mantissa,
            exponent,
        },
    ))
}

/// Number of big-endian bytes needed for a mantissa magnitude (at least one).
fn mantissa_width(magnitude: u64) -> usize {
    let bits = 64 - magnitude.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u16, unit_code: u8, mantissa: i64, exponent: i8) -> RawSample {
        RawSample {
            key: RegisterKey(id),
            unit_code,
            mantissa,
            exponent,
        }
    }

    #[test]
    fn test_encode_single_register_request() {
        // Heat energy (0x003C); CRC of 3F 10 01 00 3C
        let frame = encode_request(&[RegisterKey(0x3C)]).unwrap();
        let crc = crc16(&[0x3F, 0x10, 0x01, 0x00, 0x3C]).to_be_bytes();
        assert_eq!(frame[..6], [0x80, 0x3F, 0x10, 0x01, 0x00, 0x3C]);
        assert_eq!(*frame.last().unwrap(), 0x0D);
        assert_eq!(decode_request(&frame).unwrap(), vec![RegisterKey(0x3C)]);
        if !KMP_RESERVED_BYTES.contains(&crc[0]) && !KMP_RESERVED_BYTES.contains(&crc[1]) {
            assert_eq!(frame[6..8], crc);
        }
    }

    #[test]
    fn test_crc_known_vector() {
        // CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_request_limits() {
        assert_eq!(encode_request(&[]), Err(EncodeError::Empty));
        let keys: Vec<RegisterKey> = (1..=9).map(RegisterKey).collect();
        assert_eq!(
            encode_request(&keys),
            Err(EncodeError::TooManyKeys { count: 9, max: 8 })
        );
        assert!(encode_request(&keys[..8]).is_ok());
    }

    #[test]
    fn test_reserved_bytes_are_stuffed() {
        // 0x0D40 contains two reserved bytes
        let frame = encode_request(&[RegisterKey(0x0D40)]).unwrap();
        let inner = &frame[1..frame.len() - 1];
        assert!(!inner.contains(&KMP_STOP));
        assert!(!inner.contains(&KMP_START_RESPONSE));
        assert!(inner.windows(2).any(|w| w == [0x1B, 0xF2]));
        assert!(inner.windows(2).any(|w| w == [0x1B, 0xBF]));
        assert_eq!(decode_request(&frame).unwrap(), vec![RegisterKey(0x0D40)]);
    }

    #[test]
    fn test_decode_response_values() {
        let samples = [sample(60, 2, 12345, 0), sample(86, 37, -250, -2)];
        let decoded = decode_response(&encode_response(&samples)).unwrap();
        assert_eq!(decoded.samples, samples);
        assert!(decoded.warnings.is_empty());

        let measurements = decoded.measurements();
        assert_eq!(measurements[0].value, 12345.0);
        assert_eq!(measurements[1].value, -2.5);
        assert_eq!(measurements[1].unit, Some("°C"));
    }

    #[test]
    fn test_decode_handcrafted_block() {
        // 0x003C, kWh, 4 bytes, 10^-1, 0x0001E240 = 123456
        let payload = vec![0x3F, 0x10, 0x00, 0x3C, 0x02, 0x04, 0x41, 0x00, 0x01, 0xE2, 0x40];
        let frame = wrap_frame(KMP_START_RESPONSE, payload);
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded.samples, vec![sample(60, 2, 123456, -1)]);
        assert_eq!(decoded.measurements()[0].value, 12345.6);
    }

    #[test]
    fn test_decode_extreme_mantissas() {
        let samples = [
            sample(1, 1, i64::MAX, 0),
            sample(2, 1, i64::MIN, 0),
            sample(3, 1, 0, 63),
            sample(4, 1, -1, -63),
        ];
        let decoded = decode_response(&encode_response(&samples)).unwrap();
        assert_eq!(decoded.samples, samples);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = encode_response(&[sample(60, 2, 7, 0)]);
        // 40 3F 10 00 3C 02 01 00 07 ...: byte 8 is the mantissa
        assert_eq!(frame[8], 0x07);
        frame[8] ^= 0x10;
        assert!(matches!(
            decode_response(&frame),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_delimiters() {
        let frame = encode_response(&[sample(60, 2, 7, 0)]);
        assert_eq!(decode_response(&frame[1..]), Err(DecodeError::Delimiter));
        assert_eq!(
            decode_response(&frame[..frame.len() - 1]),
            Err(DecodeError::Delimiter)
        );
        assert_eq!(decode_response(&[]), Err(DecodeError::Delimiter));
        // A request is not a response
        let request = encode_request(&[RegisterKey(60)]).unwrap();
        assert_eq!(decode_response(&request), Err(DecodeError::Delimiter));
    }

    #[test]
    fn test_dangling_escape() {
        assert_eq!(
            decode_response(&[0x40, 0x3F, 0x1B, 0x0D]),
            Err(DecodeError::DanglingEscape)
        );
    }

    #[test]
    fn test_truncated_block() {
        // Declares a 4-byte mantissa but carries 2
        let payload = vec![0x3F, 0x10, 0x00, 0x3C, 0x02, 0x04, 0x00, 0x01, 0x02];
        let frame = wrap_frame(KMP_START_RESPONSE, payload);
        assert_eq!(
            decode_response(&frame),
            Err(DecodeError::Truncated {
                needed: 4,
                available: 2
            })
        );

        let payload = vec![0x3F, 0x10, 0x00, 0x3C, 0x02];
        let frame = wrap_frame(KMP_START_RESPONSE, payload);
        assert_eq!(
            decode_response(&frame),
            Err(DecodeError::Truncated {
                needed: 5,
                available: 3
            })
        );

        assert!(matches!(
            decode_response(&[0x40, 0x3F, 0x0D]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_mantissa_width() {
        let payload = vec![0x3F, 0x10, 0x00, 0x3C, 0x02, 0x00, 0x00];
        let frame = wrap_frame(KMP_START_RESPONSE, payload);
        assert_eq!(decode_response(&frame), Err(DecodeError::MantissaWidth(0)));
    }

    #[test]
    fn test_mantissa_overflow() {
        let mut payload = vec![0x3F, 0x10, 0x00, 0x3C, 0x02, 0x08, 0x00];
        payload.extend_from_slice(&u64::MAX.to_be_bytes());
        let frame = wrap_frame(KMP_START_RESPONSE, payload);
        assert_eq!(
            decode_response(&frame),
            Err(DecodeError::MantissaOverflow {
                key: RegisterKey(60)
            })
        );
    }

    #[test]
    fn test_unexpected_header() {
        let frame = wrap_frame(KMP_START_RESPONSE, vec![0x3F, 0x11]);
        assert_eq!(
            decode_response(&frame),
            Err(DecodeError::UnexpectedHeader {
                address: 0x3F,
                command: 0x11
            })
        );
    }

    #[test]
    fn test_unknown_unit_is_a_warning() {
        let decoded = decode_response(&encode_response(&[sample(60, 0xC8, 5, 0)])).unwrap();
        assert_eq!(decoded.samples.len(), 1);
        assert_eq!(
            decoded.warnings,
            vec![DecodeError::UnknownUnit {
                key: RegisterKey(60),
                code: 0xC8
            }]
        );
        assert_eq!(decoded.measurements()[0].unit, None);
    }

    #[test]
    fn test_empty_response_has_no_samples() {
        let frame = wrap_frame(KMP_START_RESPONSE, vec![0x3F, 0x10]);
        assert!(decode_response(&frame).unwrap().samples.is_empty());
    }

    #[test]
    fn test_mantissa_width() {
        assert_eq!(mantissa_width(0), 1);
        assert_eq!(mantissa_width(0xFF), 1);
        assert_eq!(mantissa_width(0x100), 2);
        assert_eq!(mantissa_width(u64::MAX), 8);
    }
}
