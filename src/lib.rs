//! Client library for MIFARE DESFire EV1 and MIFARE Ultralight C
//! contactless smart cards, spoken over ISO/IEC 7816-4 APDUs.
//!
//! The DESFire stack covers the four-variant mutual authentication, the
//! per-session secure-messaging pipeline (plain, MACed and enciphered
//! traffic with a single threaded IV), multi-frame chaining and the
//! file-level access-rights resolution. The Ultralight C stack shares the
//! 3DES primitive for its authenticate and restricted-page flow.
//!
//! Cards are driven through the [`transport::SmartCardTransport`] channel;
//! [`transport::PcscReader`] connects to the first PC/SC reader.

#[macro_use]
extern crate hex_literal;

pub mod crypto;
pub mod desfire;
mod errors;
pub mod transport;
pub mod ultralight;
pub mod utils;

pub use desfire::{KeyType, MiFareDESFire};
pub use errors::{NfcError, NfcResult};
pub use transport::{PcscReader, SmartCardTransport};
pub use ultralight::MiFareUltralightC;
