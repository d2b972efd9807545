use std::net::Ipv4Addr;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

use crate::types::Target;

/// Largest allowed `port_end - port_start`.
pub const MAX_RANGE_SPAN: u16 = 1000;

/// Rejection of scan input, scoped to the field that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid IPv4 address {0:?}: expected four dot-separated octets 0-255")]
    InvalidHost(String),
    #[error("invalid start port {0:?}: expected an integer in 1-65535")]
    InvalidPortStart(String),
    #[error("invalid end port {0:?}: expected an integer in 1-65535")]
    InvalidPortEnd(String),
    #[error("port range {start}-{end} is too large (at most 1000 ports apart)")]
    RangeTooLarge { start: u16, end: u16 },
    #[error("start port {start} is greater than end port {end}")]
    RangeInverted { start: u16, end: u16 },
}

impl ValidationError {
    /// Name of the input field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::InvalidHost(_) => "host",
            ValidationError::InvalidPortStart(_) => "port_start",
            ValidationError::InvalidPortEnd(_) => "port_end",
            ValidationError::RangeTooLarge { .. } | ValidationError::RangeInverted { .. } => {
                "range"
            }
        }
    }
}

impl Serialize for ValidationError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ValidationError", 2)?;
        s.serialize_field("field", self.field())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Validate raw form input into a [`Target`].
///
/// Checks run host, start port, end port, then the range; the first failure is returned.
/// No I/O happens here.
pub fn validate(host: &str, port_start: &str, port_end: &str) -> Result<Target, ValidationError> {
    let ip = parse_ipv4(host).ok_or_else(|| ValidationError::InvalidHost(host.to_string()))?;
    let start = parse_port_str(port_start)
        .ok_or_else(|| ValidationError::InvalidPortStart(port_start.to_string()))?;
    let end = parse_port_str(port_end)
        .ok_or_else(|| ValidationError::InvalidPortEnd(port_end.to_string()))?;
    Target::new(ip, start, end)
}

pub(crate) fn check_range(start: u16, end: u16) -> Result<(), ValidationError> {
    if start == 0 {
        return Err(ValidationError::InvalidPortStart(start.to_string()));
    }
    if end == 0 {
        return Err(ValidationError::InvalidPortEnd(end.to_string()));
    }
    if start > end {
        return Err(ValidationError::RangeInverted { start, end });
    }
    if end - start > MAX_RANGE_SPAN {
        return Err(ValidationError::RangeTooLarge { start, end });
    }
    Ok(())
}

/// Strict dotted-quad parser. Leading zeros are tolerated inside the 3-digit limit.
fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for slot in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse::<u8>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

fn parse_port_str(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let val: u32 = s.parse().ok()?;
    if val == 0 || val > 65535 {
        return None;
    }
    Some(val as u16)
}
