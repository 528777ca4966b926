//! Error taxonomy and the numeric return codes that cross the command
//! queue.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, PtlError>;

/// Everything that can go wrong short of an invariant violation (those
/// abort the process instead of being reported).
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtlError {
    #[error("library not initialized")]
    NoInit,
    #[error("invalid argument")]
    InvalidArg,
    #[error("out of space")]
    NoSpace,
    #[error("object still in use")]
    InUse,
    #[error("operation still in progress")]
    InProgress,
    #[error("peer connection failed")]
    NetworkFailure,
    #[error("wait interrupted")]
    Interrupted,
    #[error("operation failed")]
    Fail,
}

/// Wire form of an operation result. Command replies carry one of these;
/// the client converts back at the boundary.
#[repr(u32)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetCode {
    Ok = 0,
    Fail = 1,
    ArgInvalid = 2,
    NoInit = 3,
    NoSpace = 4,
    InUse = 5,
    InProgress = 6,
    NetworkFailure = 7,
    Interrupted = 8,
}

impl From<PtlError> for RetCode {
    fn from(err: PtlError) -> Self {
        match err {
            PtlError::NoInit => RetCode::NoInit,
            PtlError::InvalidArg => RetCode::ArgInvalid,
            PtlError::NoSpace => RetCode::NoSpace,
            PtlError::InUse => RetCode::InUse,
            PtlError::InProgress => RetCode::InProgress,
            PtlError::NetworkFailure => RetCode::NetworkFailure,
            PtlError::Interrupted => RetCode::Interrupted,
            PtlError::Fail => RetCode::Fail,
        }
    }
}

impl RetCode {
    pub fn encode(res: Result<()>) -> u32 {
        match res {
            Ok(()) => RetCode::Ok.into(),
            Err(err) => RetCode::from(err).into(),
        }
    }

    /// Decode a reply field. Unknown codes mean the reply was corrupted,
    /// which is an invariant violation at the caller.
    pub fn decode(raw: u32) -> Result<()> {
        match RetCode::try_from(raw) {
            Ok(RetCode::Ok) => Ok(()),
            Ok(RetCode::Fail) => Err(PtlError::Fail),
            Ok(RetCode::ArgInvalid) => Err(PtlError::InvalidArg),
            Ok(RetCode::NoInit) => Err(PtlError::NoInit),
            Ok(RetCode::NoSpace) => Err(PtlError::NoSpace),
            Ok(RetCode::InUse) => Err(PtlError::InUse),
            Ok(RetCode::InProgress) => Err(PtlError::InProgress),
            Ok(RetCode::NetworkFailure) => Err(PtlError::NetworkFailure),
            Ok(RetCode::Interrupted) => Err(PtlError::Interrupted),
            Err(_) => Err(PtlError::Fail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            PtlError::NoInit,
            PtlError::InvalidArg,
            PtlError::NoSpace,
            PtlError::InUse,
            PtlError::InProgress,
            PtlError::NetworkFailure,
            PtlError::Interrupted,
            PtlError::Fail,
        ] {
            let raw = RetCode::encode(Err(err));
            assert_eq!(RetCode::decode(raw), Err(err));
        }
        assert_eq!(RetCode::decode(RetCode::encode(Ok(()))), Ok(()));
    }
}
