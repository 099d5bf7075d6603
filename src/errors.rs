/// Errors surfaced by card operations.
///
/// The card-side part of the taxonomy mirrors the DESFire status codes; the
/// raw status byte of a rejected command is preserved in
/// [`NfcError::UnexpectedStatus`] and can also be queried via
/// `last_status_code` on the card handle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NfcError {
    /// The reader or the card channel could not be driven.
    TransportFailure,

    /// The card answered a command with a terminal status other than
    /// OPERATION_OK (0x00).
    UnexpectedStatus(u8),

    /// A CMAC or legacy MAC attached to a response did not verify.
    CmacMismatch,

    /// The CRC inside an enciphered response did not verify.
    CrcMismatch,

    /// The card returned a wrong nonce during mutual authentication.
    AuthenticationRejected,

    /// Bad argument on the host side, e.g. a key length that does not match
    /// the key type or an out-of-range page number.
    InvalidArgument,

    /// A command that requires a secure session was attempted without one.
    NotAuthenticated,

    /// None of the relevant access-rights nibbles permit the operation.
    AccessDenied,

    /// A response was too short or otherwise malformed.
    ByteParse,
}

pub type NfcResult<T> = Result<T, NfcError>;

impl std::fmt::Display for NfcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for NfcError {}

impl From<pcsc::Error> for NfcError {
    fn from(_err: pcsc::Error) -> Self {
        NfcError::TransportFailure
    }
}

impl From<std::io::Error> for NfcError {
    fn from(_err: std::io::Error) -> Self {
        NfcError::ByteParse
    }
}

impl From<block_modes::BlockModeError> for NfcError {
    fn from(_err: block_modes::BlockModeError) -> Self {
        NfcError::ByteParse
    }
}

impl From<block_modes::InvalidKeyIvLength> for NfcError {
    fn from(_err: block_modes::InvalidKeyIvLength) -> Self {
        NfcError::InvalidArgument
    }
}
