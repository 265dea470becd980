//! WebSocket close status codes and close-source tracking

/// RFC 6455 close status codes
///
/// The standard set plus a catch-all for application-defined codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// 1000: normal closure
    Normal,
    /// 1001: endpoint going away
    GoingAway,
    /// 1002: protocol error
    ProtocolError,
    /// 1003: unsupported data
    UnsupportedData,
    /// 1005: no status code present in the close frame
    NoStatusReceived,
    /// 1006: abnormal closure, no close frame at all
    Abnormal,
    /// 1007: invalid frame payload data
    InvalidPayload,
    /// 1008: policy violation
    PolicyViolation,
    /// 1009: message too big
    MessageTooBig,
    /// 1010: mandatory extension missing
    MandatoryExtension,
    /// 1011: internal server error
    InternalError,
    /// 1012: service restart
    ServiceRestart,
    /// 1013: try again later
    TryAgainLater,
    /// 1014: bad gateway
    BadGateway,
    /// 1015: TLS handshake failure
    TlsHandshake,
    /// Any other code
    Other(u16),
}

impl CloseStatus {
    /// The numeric close code
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatusReceived => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
            Self::TlsHandshake => 1015,
            Self::Other(code) => code,
        }
    }

    /// Build a status from a numeric close code
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatusReceived,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            other => Self::Other(other),
        }
    }
}

impl From<u16> for CloseStatus {
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl From<CloseStatus> for u16 {
    fn from(status: CloseStatus) -> Self {
        status.as_u16()
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Which side of the connection recorded the close first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    /// The peer sent a close frame (or dropped the transport)
    Client,
    /// Framework or handler code closed the socket
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_standard_codes() {
        for code in [
            1000, 1001, 1002, 1003, 1005, 1006, 1007, 1008, 1009, 1010, 1011, 1012, 1013, 1014,
            1015,
        ] {
            let status = CloseStatus::from_u16(code);
            assert_eq!(status.as_u16(), code);
            assert!(!matches!(status, CloseStatus::Other(_)));
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let status = CloseStatus::from_u16(4001);
        assert_eq!(status, CloseStatus::Other(4001));
        assert_eq!(u16::from(status), 4001);
    }
}
