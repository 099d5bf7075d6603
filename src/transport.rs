//! The APDU channel the card stacks drive.

use log::{trace, warn};

use crate::errors::{NfcError, NfcResult};
use crate::utils::bytes_to_string;

/// One reader plus one card channel.
///
/// A card session is strictly sequential: each `transmit` is a blocking
/// request/response exchange and the returned buffer always includes the two
/// trailing status bytes.
pub trait SmartCardTransport {
    /// Acquire a reader and a card channel.
    fn connect(&mut self) -> bool;

    /// Release the reader and the card channel. Must be idempotent.
    fn disconnect(&mut self) -> bool;

    /// Exchange one APDU. The response includes `SW1 SW2` at the end.
    fn transmit(&mut self, cmd: &[u8]) -> NfcResult<Vec<u8>>;
}

/// PC/SC backed transport. Connects to the first reader reported by the
/// smart card service.
pub struct PcscReader {
    card: Option<pcsc::Card>,
}

impl PcscReader {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        PcscReader { card: None }
    }

    /// The ATR of the currently connected card.
    pub fn atr(&self) -> NfcResult<Vec<u8>> {
        let card = self.card.as_ref().ok_or(NfcError::TransportFailure)?;

        let len = card.get_attribute_len(pcsc::Attribute::AtrString)?;
        let mut buf = vec![0; len];
        let atr = card.get_attribute(pcsc::Attribute::AtrString, &mut buf)?;

        Ok(atr.to_vec())
    }
}

impl SmartCardTransport for PcscReader {
    fn connect(&mut self) -> bool {
        let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Cannot connect to the smart card service: {}", e);
                return false;
            }
        };

        let mut readers_buf = [0; 2048];
        let mut names = match ctx.list_readers(&mut readers_buf) {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list readers: {}", e);
                return false;
            }
        };
        let name = match names.next() {
            Some(name) => name,
            None => {
                warn!("No reader attached");
                return false;
            }
        };

        match ctx.connect(name, pcsc::ShareMode::Exclusive, pcsc::Protocols::ANY) {
            Ok(card) => {
                self.card = Some(card);
                true
            }
            Err(e) => {
                warn!("Failed to connect to card: {}", e);
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        match self.card.take() {
            Some(card) => card.disconnect(pcsc::Disposition::ResetCard).is_ok(),
            None => true,
        }
    }

    fn transmit(&mut self, cmd: &[u8]) -> NfcResult<Vec<u8>> {
        let card = self.card.as_ref().ok_or(NfcError::TransportFailure)?;

        trace!(">> {}", bytes_to_string(cmd));
        let mut data_buf = [0; pcsc::MAX_BUFFER_SIZE];
        let data = card.transmit(cmd, &mut data_buf)?;
        trace!("<< {}", bytes_to_string(data));

        Ok(data.to_vec())
    }
}
