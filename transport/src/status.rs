//! RPC status codes and their mappings to and from HTTP.

use http2::ErrorCode;

/// RPC status codes (distinct from HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Invalid argument was provided.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// Resource has been exhausted.
    ResourceExhausted = 8,
    /// System is not in a state required for the operation.
    FailedPrecondition = 9,
    /// Operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Map an HTTP status to an RPC code, for surfacing responses from
/// servers that turned out not to speak HTTP/2.
pub fn http_status_to_code(status: u16) -> Code {
    match status {
        200 => Code::Ok,
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Map an RPC code to the HTTP/2 error code used when resetting a stream
/// for that reason.
pub fn code_to_http2_error(code: Code) -> ErrorCode {
    match code {
        Code::Ok => ErrorCode::NoError,
        Code::Cancelled | Code::DeadlineExceeded => ErrorCode::Cancel,
        Code::ResourceExhausted => ErrorCode::EnhanceYourCalm,
        Code::PermissionDenied => ErrorCode::InadequateSecurity,
        Code::Unavailable => ErrorCode::RefusedStream,
        _ => ErrorCode::InternalError,
    }
}

/// Map an HTTP/2 error code on a received RST_STREAM to the RPC code
/// reported for the aborted call.
pub fn http2_error_to_code(error: ErrorCode) -> Code {
    match error {
        ErrorCode::NoError => Code::Internal,
        ErrorCode::Cancel => Code::Cancelled,
        ErrorCode::EnhanceYourCalm => Code::ResourceExhausted,
        ErrorCode::InadequateSecurity => Code::PermissionDenied,
        ErrorCode::RefusedStream => Code::Unavailable,
        _ => Code::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for i in 0..=16 {
            assert_eq!(Code::from_u32(i).as_u32(), i);
        }
        assert_eq!(Code::from_u32(99), Code::Unknown);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status_to_code(404), Code::Unimplemented);
        assert_eq!(http_status_to_code(401), Code::Unauthenticated);
        assert_eq!(http_status_to_code(403), Code::PermissionDenied);
        assert_eq!(http_status_to_code(503), Code::Unavailable);
        assert_eq!(http_status_to_code(418), Code::Unknown);
    }

    #[test]
    fn test_rst_code_mappings_invert() {
        assert_eq!(http2_error_to_code(code_to_http2_error(Code::Cancelled)), Code::Cancelled);
        assert_eq!(
            http2_error_to_code(code_to_http2_error(Code::ResourceExhausted)),
            Code::ResourceExhausted
        );
        assert_eq!(http2_error_to_code(ErrorCode::ProtocolError), Code::Internal);
    }

    #[test]
    fn test_display() {
        assert_eq!(Code::Unavailable.to_string(), "UNAVAILABLE");
        assert_eq!(Code::Ok.to_string(), "OK");
    }
}
