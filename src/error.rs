//! Error taxonomy for the node core.
//!
//! Five kinds of failure exist: fatal (stop using the node), input
//! (dropped and traced), credential (rejected, not installed),
//! certificate (the enumerated conditions below), and transient
//! (silently dropped with trace). Only [`ResultCode`] crosses the
//! public API boundary; everything else is internal plumbing or
//! surfaces through the event callback.

use thiserror::Error;

/// Result codes returned by every public node operation.
///
/// Fatal codes live in `[100, 1000)`; anything at or above 1000 is a
/// non-fatal per-call failure. `Ok` is zero so the numeric values can
/// cross a C ABI unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,

    // Fatal: the node instance should no longer be used.
    FatalOutOfMemory = 100,
    FatalDataStoreFailed = 101,
    FatalInternal = 102,

    // Non-fatal per-call errors.
    ErrorNetworkNotFound = 1000,
    ErrorUnsupportedOperation = 1001,
    ErrorBadParameter = 1002,
    ErrorInvalidCredential = 1003,
    ErrorCollidingObject = 1004,
    ErrorInternal = 1005,
}

impl ResultCode {
    /// True when the code indicates the whole instance is broken.
    #[inline]
    pub fn is_fatal(self) -> bool {
        let v = self as i32;
        (100..1000).contains(&v)
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

/// Verification and store errors for certificates.
///
/// The discriminants match the deployed ABI: `HaveNewerCert` is the
/// only positive "error" (the offered cert is merely stale), negative
/// values are genuine rejections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum CertificateError {
    #[error("a newer certificate with the same issuer and subject unique ID exists")]
    HaveNewerCert = 1,
    #[error("certificate format is invalid or a required field is missing")]
    InvalidFormat = -1,
    #[error("an identity in the certificate is invalid or fails its consistency check")]
    InvalidIdentity = -2,
    #[error("primary signature verification failed")]
    InvalidPrimarySignature = -3,
    #[error("no chain to a locally trusted root within path length limits")]
    InvalidChain = -4,
    #[error("a signed component (locator) carries an invalid signature")]
    InvalidComponentSignature = -5,
    #[error("subject unique ID proof signature is invalid")]
    InvalidUniqueIdProof = -6,
    #[error("certificate is missing required fields")]
    MissingRequiredFields = -7,
    #[error("certificate is expired or not yet in effect")]
    OutOfValidTimeWindow = -8,
}

/// Rejection reasons for network credentials (COM, capability, tag,
/// certificate of ownership, revocation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential signature verification failed")]
    SignatureVerificationFailed,
    #[error("credential has been revoked")]
    Revoked,
    #[error("credential is older than the newest we hold")]
    OlderThanLatest,
    #[error("credential is structurally invalid")]
    Invalid,
    #[error("credential belongs to a different network")]
    WrongNetwork,
}

/// Errors from binary marshal/unmarshal of wire objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("object truncated or too short")]
    Underflow,
    #[error("object exceeds its structural bounds")]
    Overflow,
    #[error("unrecognized type tag")]
    UnknownType,
    #[error("field contains an invalid value")]
    InvalidField,
}

/// Reasons an incoming VL1 packet was dropped, reported via trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDropReason {
    Unspecified,
    MalformedPacket,
    MacFailed,
    RateLimitExceeded,
    InvalidObject,
    UnrecognizedVerb,
    ReplyNotExpected,
    UnsupportedCipher,
}

/// Reasons a VL2 frame was dropped, reported via trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameDropReason {
    Unspecified,
    BridgingNotAllowedRemote,
    BridgingNotAllowedLocal,
    MulticastDisabled,
    BroadcastDisabled,
    FilterBlocked,
    PermissionDenied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_range_predicate() {
        assert!(!ResultCode::Ok.is_fatal());
        assert!(ResultCode::FatalOutOfMemory.is_fatal());
        assert!(ResultCode::FatalDataStoreFailed.is_fatal());
        assert!(ResultCode::FatalInternal.is_fatal());
        assert!(!ResultCode::ErrorNetworkNotFound.is_fatal());
        assert!(!ResultCode::ErrorBadParameter.is_fatal());
        assert!(!ResultCode::ErrorInternal.is_fatal());
    }

    #[test]
    fn certificate_error_codes_match_abi() {
        assert_eq!(CertificateError::HaveNewerCert as i32, 1);
        assert_eq!(CertificateError::InvalidFormat as i32, -1);
        assert_eq!(CertificateError::OutOfValidTimeWindow as i32, -8);
    }
}
