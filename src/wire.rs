//! RTDE wire format: package headers, control messages and value codecs
//!
//! Every package starts with a 3 byte header, a big-endian `u16` total size
//! (header included) followed by a single type tag. All numbers on the wire
//! are in network byte order.

use crate::catalog::{DataType, Value, DOF};
use crate::{Result, RtdeError};

/// Size of the package header
pub const HEADER_SIZE: usize = 3;

/// Largest package the controller will send or accept
pub const MAX_PACKAGE_SIZE: usize = 2000;

/// Size of the scratch buffers used for a single package
pub const BUFFER_SIZE: usize = 2048;

pub const PROTOCOL_VERSION: u16 = 2;

/// Header plus the recipe id byte
pub const DATA_PACKAGE_OVERHEAD: usize = HEADER_SIZE + 1;

/// RTDE package types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    RequestProtocolVersion = 86,
    GetUrcontrolVersion = 118,
    TextMessage = 77,
    DataPackage = 85,
    ControlPackageSetupOutputs = 79,
    ControlPackageSetupInputs = 73,
    ControlPackageStart = 83,
    ControlPackagePause = 80,
}

impl PackageType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PackageType {
    type Error = RtdeError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            86 => Ok(PackageType::RequestProtocolVersion),
            118 => Ok(PackageType::GetUrcontrolVersion),
            77 => Ok(PackageType::TextMessage),
            85 => Ok(PackageType::DataPackage),
            79 => Ok(PackageType::ControlPackageSetupOutputs),
            73 => Ok(PackageType::ControlPackageSetupInputs),
            83 => Ok(PackageType::ControlPackageStart),
            80 => Ok(PackageType::ControlPackagePause),
            _ => Err(RtdeError::MalformedFrame(format!("Unknown package type: {}", tag))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageHeader {
    /// Total package size, header included
    pub size: u16,
    pub package_type: PackageType,
}

impl PackageHeader {
    pub fn new(size: usize, package_type: PackageType) -> Result<Self> {
        if !(HEADER_SIZE..=MAX_PACKAGE_SIZE).contains(&size) {
            return Err(RtdeError::MalformedFrame(format!(
                "Package size {} outside {}..={}",
                size, HEADER_SIZE, MAX_PACKAGE_SIZE
            )));
        }
        Ok(Self { size: size as u16, package_type })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let size = self.size.to_be_bytes();
        [size[0], size[1], self.package_type.tag()]
    }

    /// Write the header into the first bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE {
            return Err(RtdeError::Precondition("Buffer too small for header".to_string()));
        }
        buf[..HEADER_SIZE].copy_from_slice(&self.encode());
        Ok(())
    }

    /// Decode and validate a header.
    ///
    /// Fails on a size below the header size, above the 2000 byte cap, on an
    /// unknown tag, or when `expected` is given and the tag differs.
    pub fn decode(buf: &[u8], expected: Option<PackageType>) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(RtdeError::MalformedFrame(format!(
                "Short header: {} bytes",
                buf.len()
            )));
        }
        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if !(HEADER_SIZE..=MAX_PACKAGE_SIZE).contains(&size) {
            return Err(RtdeError::MalformedFrame(format!("Invalid package size: {}", size)));
        }
        let package_type = PackageType::try_from(buf[2])?;
        if let Some(expected) = expected {
            if package_type != expected {
                return Err(RtdeError::MalformedFrame(format!(
                    "Expected {:?}, got {:?}",
                    expected, package_type
                )));
            }
        }
        Ok(Self { size: size as u16, package_type })
    }
}

/// Bit-exact conversion of a double to network byte order
pub fn encode_network_double(value: f64) -> [u8; 8] {
    value.to_bits().to_be_bytes()
}

/// Inverse of [`encode_network_double`]; NaN payloads and signed zeros survive
pub fn decode_network_double(bytes: [u8; 8]) -> f64 {
    f64::from_bits(u64::from_be_bytes(bytes))
}

fn take<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Write `value` as `data_type` into the start of `buf`
pub fn encode_value(data_type: DataType, value: &Value, buf: &mut [u8]) -> Result<()> {
    let width = data_type.width();
    if data_type.is_sentinel() {
        return Err(RtdeError::Precondition(format!("Cannot encode a {} field", data_type)));
    }
    if buf.len() < width {
        return Err(RtdeError::Precondition(format!(
            "Buffer of {} bytes too small for {}",
            buf.len(),
            data_type
        )));
    }
    if !value.fits(data_type) {
        return Err(RtdeError::Precondition(format!(
            "Value {:?} does not fit a {} field",
            value, data_type
        )));
    }

    match *value {
        Value::Bool(b) => buf[0] = b as u8,
        Value::U8(v) => buf[0] = v,
        Value::U32(v) => buf[..4].copy_from_slice(&v.to_be_bytes()),
        Value::U64(v) => buf[..8].copy_from_slice(&v.to_be_bytes()),
        Value::I32(v) => buf[..4].copy_from_slice(&v.to_be_bytes()),
        Value::F64(v) => buf[..8].copy_from_slice(&encode_network_double(v)),
        Value::Vector3d(v) => {
            for (i, x) in v.iter().enumerate() {
                buf[i * 8..i * 8 + 8].copy_from_slice(&encode_network_double(*x));
            }
        }
        Value::Vector6d(v) => {
            for (i, x) in v.iter().enumerate() {
                buf[i * 8..i * 8 + 8].copy_from_slice(&encode_network_double(*x));
            }
        }
        Value::Vector6Int32(v) => {
            for (i, x) in v.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&x.to_be_bytes());
            }
        }
        Value::Vector6Uint32(v) => {
            for (i, x) in v.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&x.to_be_bytes());
            }
        }
    }
    Ok(())
}

/// Read a `data_type` value from the start of `buf`
pub fn decode_value(data_type: DataType, buf: &[u8]) -> Result<Value> {
    if buf.len() < data_type.width() {
        return Err(RtdeError::MalformedFrame(format!(
            "Need {} bytes for {}, have {}",
            data_type.width(),
            data_type,
            buf.len()
        )));
    }

    let value = match data_type {
        DataType::Bool => Value::Bool(buf[0] != 0),
        DataType::Uint8 | DataType::String => Value::U8(buf[0]),
        DataType::Uint32 => Value::U32(u32::from_be_bytes(take(buf, 0))),
        DataType::Uint64 => Value::U64(u64::from_be_bytes(take(buf, 0))),
        DataType::Int32 => Value::I32(i32::from_be_bytes(take(buf, 0))),
        DataType::Double => Value::F64(decode_network_double(take(buf, 0))),
        DataType::Vector3d => {
            let mut v = [0.0; 3];
            for (i, x) in v.iter_mut().enumerate() {
                *x = decode_network_double(take(buf, i * 8));
            }
            Value::Vector3d(v)
        }
        DataType::Vector6d => {
            let mut v = [0.0; DOF];
            for (i, x) in v.iter_mut().enumerate() {
                *x = decode_network_double(take(buf, i * 8));
            }
            Value::Vector6d(v)
        }
        DataType::Vector6Int32 => {
            let mut v = [0i32; DOF];
            for (i, x) in v.iter_mut().enumerate() {
                *x = i32::from_be_bytes(take(buf, i * 4));
            }
            Value::Vector6Int32(v)
        }
        DataType::Vector6Uint32 => {
            let mut v = [0u32; DOF];
            for (i, x) in v.iter_mut().enumerate() {
                *x = u32::from_be_bytes(take(buf, i * 4));
            }
            Value::Vector6Uint32(v)
        }
        DataType::InUse | DataType::NotFound => {
            return Err(RtdeError::Precondition(format!("Cannot decode a {} field", data_type)));
        }
    };
    Ok(value)
}

fn bare_request(package_type: PackageType) -> Vec<u8> {
    PackageHeader { size: HEADER_SIZE as u16, package_type }.encode().to_vec()
}

/// `[0, 5, 'V', 0, 2]`
pub fn version_request() -> Vec<u8> {
    let mut msg = PackageHeader {
        size: (HEADER_SIZE + 2) as u16,
        package_type: PackageType::RequestProtocolVersion,
    }
    .encode()
    .to_vec();
    msg.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    msg
}

/// True if the controller accepted the requested protocol version
pub fn parse_version_response(resp: &[u8]) -> Result<bool> {
    let header = PackageHeader::decode(resp, Some(PackageType::RequestProtocolVersion))?;
    if header.size != 4 || resp.len() < 4 {
        return Err(RtdeError::MalformedFrame(format!(
            "Version response of size {}",
            header.size
        )));
    }
    Ok(resp[3] != 0)
}

pub fn urcontrol_version_request() -> Vec<u8> {
    bare_request(PackageType::GetUrcontrolVersion)
}

/// Software version reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ControllerVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
    pub build: u32,
}

impl std::fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.bugfix, self.build)
    }
}

const URCONTROL_VERSION_SIZE: usize = HEADER_SIZE + 16;

pub fn parse_urcontrol_version(resp: &[u8]) -> Result<ControllerVersion> {
    let header = PackageHeader::decode(resp, Some(PackageType::GetUrcontrolVersion))?;
    if header.size as usize != URCONTROL_VERSION_SIZE || resp.len() < URCONTROL_VERSION_SIZE {
        return Err(RtdeError::MalformedFrame(format!(
            "Controller version response of size {}",
            header.size
        )));
    }
    let field = |i: usize| u32::from_be_bytes(take(resp, HEADER_SIZE + i * 4));
    Ok(ControllerVersion {
        major: field(0),
        minor: field(1),
        bugfix: field(2),
        build: field(3),
    })
}

/// Severity of an RTDE text message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Exception = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
}

impl TryFrom<u8> for MessageLevel {
    type Error = RtdeError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(MessageLevel::Exception),
            1 => Ok(MessageLevel::Error),
            2 => Ok(MessageLevel::Warning),
            3 => Ok(MessageLevel::Info),
            _ => Err(RtdeError::MalformedFrame(format!("Unknown message level: {}", level))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub message: String,
    pub source: String,
    pub level: MessageLevel,
}

/// Build a text message package: header, msg length, msg, source length,
/// source, level.
pub fn text_message(message: &str, source: &str, level: MessageLevel) -> Result<Vec<u8>> {
    if message.len() > 0xff || source.len() > 0xff {
        return Err(RtdeError::Precondition(
            "Text message and source are limited to 255 bytes each".to_string(),
        ));
    }
    let size = HEADER_SIZE + 3 + message.len() + source.len();
    let mut msg = PackageHeader::new(size, PackageType::TextMessage)?.encode().to_vec();
    msg.push(message.len() as u8);
    msg.extend_from_slice(message.as_bytes());
    msg.push(source.len() as u8);
    msg.extend_from_slice(source.as_bytes());
    msg.push(level as u8);
    Ok(msg)
}

pub fn parse_text_message(buf: &[u8]) -> Result<TextMessage> {
    let header = PackageHeader::decode(buf, Some(PackageType::TextMessage))?;
    let end = (header.size as usize).min(buf.len());
    let body = &buf[HEADER_SIZE..end];
    let short = || RtdeError::MalformedFrame("Truncated text message".to_string());

    let msg_len = *body.first().ok_or_else(short)? as usize;
    let message = body.get(1..1 + msg_len).ok_or_else(short)?;
    let src_len = *body.get(1 + msg_len).ok_or_else(short)? as usize;
    let source = body.get(2 + msg_len..2 + msg_len + src_len).ok_or_else(short)?;
    let level = *body.get(2 + msg_len + src_len).ok_or_else(short)?;

    Ok(TextMessage {
        message: String::from_utf8_lossy(message).into_owned(),
        source: String::from_utf8_lossy(source).into_owned(),
        level: MessageLevel::try_from(level)?,
    })
}

pub fn start_request() -> Vec<u8> {
    bare_request(PackageType::ControlPackageStart)
}

pub fn pause_request() -> Vec<u8> {
    bare_request(PackageType::ControlPackagePause)
}

/// Validate a start or pause reply: exactly 4 bytes, matching tag, accepted
pub fn parse_start_pause(resp: &[u8], expected: PackageType) -> Result<()> {
    let header = PackageHeader::decode(resp, Some(expected))?;
    if header.size != 4 || resp.len() < 4 {
        return Err(RtdeError::MalformedFrame(format!(
            "{:?} reply of size {}",
            expected, header.size
        )));
    }
    if resp[3] == 0 {
        return Err(RtdeError::Protocol(format!("Controller refused {:?}", expected)));
    }
    Ok(())
}

/// Header and recipe id of a data package carrying `width` payload bytes
pub fn data_package_header(recipe_id: u8, width: usize) -> Result<[u8; DATA_PACKAGE_OVERHEAD]> {
    let header = PackageHeader::new(DATA_PACKAGE_OVERHEAD + width, PackageType::DataPackage)?;
    let h = header.encode();
    Ok([h[0], h[1], h[2], recipe_id])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_bounds() {
        assert!(PackageHeader::decode(&[0, 3, b'S'], None).is_ok());
        assert!(PackageHeader::decode(&[0, 2, b'S'], None).is_err());
        // 2001
        assert!(PackageHeader::decode(&[0x07, 0xd1, b'U'], None).is_err());
        assert!(PackageHeader::decode(&[0x07, 0xd0, b'U'], None).is_ok());
        let pause = Some(PackageType::ControlPackagePause);
        assert!(PackageHeader::decode(&[0, 4, b'S'], pause).is_err());
        assert!(PackageHeader::decode(&[0, 4, b'x'], None).is_err());
        assert!(PackageHeader::decode(&[0, 4], None).is_err());
    }

    #[test]
    fn test_version_request_bytes() {
        assert_eq!(version_request(), vec![0, 5, b'V', 0, 2]);
        assert!(parse_version_response(&[0, 4, b'V', 1]).unwrap());
        assert!(!parse_version_response(&[0, 4, b'V', 0]).unwrap());
        assert!(parse_version_response(&[0, 5, b'V', 1, 0]).is_err());
        assert!(parse_version_response(&[0, 4, b'S', 1]).is_err());
    }

    #[test]
    fn test_urcontrol_version() {
        assert_eq!(urcontrol_version_request(), vec![0, 3, b'v']);
        let mut resp = vec![0, 19, b'v'];
        for v in [5u32, 11, 2, 108_318] {
            resp.extend_from_slice(&v.to_be_bytes());
        }
        let version = parse_urcontrol_version(&resp).unwrap();
        assert_eq!(version.major, 5);
        assert_eq!(version.build, 108_318);
        assert_eq!(version.to_string(), "5.11.2.108318");

        resp[1] = 18;
        assert!(parse_urcontrol_version(&resp).is_err());
    }

    #[test]
    fn test_text_message_layout() {
        let msg = text_message("hi", "urx", MessageLevel::Warning).unwrap();
        assert_eq!(msg, vec![0, 11, b'M', 2, b'h', b'i', 3, b'u', b'r', b'x', 2]);

        let parsed = parse_text_message(&msg).unwrap();
        assert_eq!(parsed.message, "hi");
        assert_eq!(parsed.source, "urx");
        assert_eq!(parsed.level, MessageLevel::Warning);

        assert!(text_message(&"x".repeat(256), "urx", MessageLevel::Info).is_err());
        assert!(parse_text_message(&[0, 6, b'M', 5, b'a', b'b']).is_err());
    }

    #[test]
    fn test_start_pause_replies() {
        assert_eq!(start_request(), vec![0, 3, b'S']);
        assert_eq!(pause_request(), vec![0, 3, b'P']);
        assert!(parse_start_pause(&[0, 4, b'S', 1], PackageType::ControlPackageStart).is_ok());
        assert!(matches!(
            parse_start_pause(&[0, 4, b'S', 0], PackageType::ControlPackageStart),
            Err(RtdeError::Protocol(_))
        ));
        assert!(parse_start_pause(&[0, 4, b'S', 1], PackageType::ControlPackagePause).is_err());
        assert!(parse_start_pause(&[0, 5, b'P', 1, 1], PackageType::ControlPackagePause).is_err());
    }

    #[test]
    fn test_value_codec() {
        let mut buf = [0u8; 48];
        encode_value(DataType::Int32, &Value::I32(-2), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(decode_value(DataType::Int32, &buf).unwrap(), Value::I32(-2));

        encode_value(DataType::Double, &Value::F64(1.0), &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x3f, 0xf0, 0, 0, 0, 0, 0, 0]);

        let joints = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        encode_value(DataType::Vector6d, &Value::Vector6d(joints), &mut buf).unwrap();
        assert_eq!(decode_value(DataType::Vector6d, &buf).unwrap(), Value::Vector6d(joints));

        assert!(encode_value(DataType::Int32, &Value::F64(1.0), &mut buf).is_err());
        let short = &mut buf[..40];
        assert!(encode_value(DataType::Vector6d, &Value::Vector6d(joints), short).is_err());
        assert!(decode_value(DataType::NotFound, &buf).is_err());
    }

    #[test]
    fn test_bool_decodes_any_nonzero() {
        assert_eq!(decode_value(DataType::Bool, &[0x80]).unwrap(), Value::Bool(true));
        assert_eq!(decode_value(DataType::Bool, &[0]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_double_special_values() {
        for v in [0.0f64, -0.0, f64::INFINITY, f64::MIN_POSITIVE / 2.0] {
            let back = decode_network_double(encode_network_double(v));
            assert_eq!(back.to_bits(), v.to_bits());
        }
        let nan = f64::from_bits(0x7ff8_dead_beef_0001);
        assert_eq!(decode_network_double(encode_network_double(nan)).to_bits(), nan.to_bits());
    }

    proptest! {
        #[test]
        fn prop_network_double_round_trip(bits in any::<u64>()) {
            let v = f64::from_bits(bits);
            prop_assert_eq!(decode_network_double(encode_network_double(v)).to_bits(), bits);
        }
    }
}
