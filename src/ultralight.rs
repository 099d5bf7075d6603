//! MIFARE Ultralight C: 3DES mutual authentication and 4-byte page access.
//!
//! The reader wraps the native commands in pseudo-APDUs: `FF EF` carries the
//! authentication frames, `FF B0`/`FF D6` read and update single pages.

use crate::crypto;
use crate::errors::{NfcError, NfcResult};
use crate::transport::SmartCardTransport;

/// Last page readable over the pseudo-APDU interface.
const LAST_PAGE: u8 = 43;
/// User memory spans pages 4..=39; everything above is configuration and key
/// storage.
const USER_PAGES: std::ops::RangeInclusive<u8> = 4..=39;

pub struct MiFareUltralightC<T: SmartCardTransport> {
    pub transport: T,
}

impl<T: SmartCardTransport> MiFareUltralightC<T> {
    /// ATR of MIFARE Ultralight C cards as reported through PC/SC.
    pub const ATR: [u8; 20] =
        hex!("3B 8F 80 01 80 4F 0C A0 00 00 03 06 03 00 03 00 00 00 00 68");

    pub fn is_compatible(atr: &[u8]) -> bool {
        atr == Self::ATR
    }

    pub fn new(transport: T) -> Self {
        MiFareUltralightC { transport }
    }

    pub fn connect(&mut self) -> bool {
        self.transport.connect()
    }

    pub fn disconnect(&mut self) -> bool {
        self.transport.disconnect()
    }

    /// Mutual 3DES authentication with the 16-byte card key (K1||K2).
    pub fn authenticate(&mut self, key: &[u8]) -> NfcResult<()> {
        if key.len() != 16 {
            return Err(NfcError::InvalidArgument);
        }

        // message exchange 1: native AUTHENTICATE (0x1A)
        let r1 = self
            .transport
            .transmit(&hex!("FF EF 00 00 02 1A 00"))?;
        if r1.len() < 9 {
            return Err(NfcError::ByteParse);
        }
        if r1[0] != 0xAF {
            return Err(NfcError::UnexpectedStatus(r1[0]));
        }

        let ek_rand_b = &r1[1..9];
        let rand_b = crypto::tdes_decrypt(key, &[0u8; 8], ek_rand_b)?;

        let rand_a = crypto::generate_nonce(8);
        let mut plaintext = rand_a.clone();
        plaintext.extend_from_slice(&crypto::rotate_left(&rand_b));
        let token = crypto::tdes_encrypt(key, ek_rand_b, &plaintext)?;

        // message exchange 2
        let mut apdu = hex!("FF EF 00 00 11 AF").to_vec();
        apdu.extend_from_slice(&token);
        let r2 = self.transport.transmit(&apdu)?;
        if r2.len() < 9 {
            return Err(NfcError::ByteParse);
        }
        if r2[0] != 0x00 {
            return Err(NfcError::UnexpectedStatus(r2[0]));
        }

        let iv = &token[8..16];
        let rand_a_rotated = crypto::tdes_decrypt(key, iv, &r2[1..9])?;
        if rand_a_rotated != crypto::rotate_left(&rand_a) {
            return Err(NfcError::AuthenticationRejected);
        }

        Ok(())
    }

    /// Read a 4-byte page (0..=43).
    pub fn read_page(&mut self, page: u8) -> NfcResult<[u8; 4]> {
        if page > LAST_PAGE {
            return Err(NfcError::InvalidArgument);
        }

        let response = self
            .transport
            .transmit(&[0xFF, 0xB0, 0x00, page, 0x04])?;
        let data = Self::check_status(&response)?;
        if data.len() < 4 {
            return Err(NfcError::ByteParse);
        }

        let mut out = [0u8; 4];
        out.copy_from_slice(&data[..4]);
        Ok(out)
    }

    /// Update a 4-byte page within user memory (4..=39).
    pub fn update_page(&mut self, page: u8, data: [u8; 4]) -> NfcResult<()> {
        if !USER_PAGES.contains(&page) {
            return Err(NfcError::InvalidArgument);
        }
        self.write_page(page, data)
    }

    fn write_page(&mut self, page: u8, data: [u8; 4]) -> NfcResult<()> {
        let apdu = [0xFF, 0xD6, 0x00, page, 0x04, data[0], data[1], data[2], data[3]];
        let response = self.transport.transmit(&apdu)?;
        Self::check_status(&response)?;
        Ok(())
    }

    /// Write a new 16-byte authentication key into pages 44..=47. The key
    /// halves go out word-swapped, most significant byte of each half first.
    pub fn change_secret_key(&mut self, new_key: &[u8; 16]) -> NfcResult<()> {
        let k = new_key;
        self.write_page(0x2C, [k[7], k[6], k[5], k[4]])?;
        self.write_page(0x2D, [k[3], k[2], k[1], k[0]])?;
        self.write_page(0x2E, [k[15], k[14], k[13], k[12]])?;
        self.write_page(0x2F, [k[11], k[10], k[9], k[8]])?;
        Ok(())
    }

    /// First page that requires authentication; 48 disables the restriction.
    pub fn set_auth0(&mut self, page: u8) -> NfcResult<()> {
        if page > 48 {
            return Err(NfcError::InvalidArgument);
        }
        self.write_page(0x2A, [page, 0x00, 0x00, 0x00])
    }

    /// Whether the restricted range is write protected only (`true`) or
    /// read and write protected (`false`).
    pub fn set_auth1(&mut self, allow_read: bool) -> NfcResult<()> {
        let value = if allow_read { 0x01 } else { 0x00 };
        self.write_page(0x2B, [value, 0x00, 0x00, 0x00])
    }

    fn check_status(response: &[u8]) -> NfcResult<&[u8]> {
        if response.len() < 2 {
            return Err(NfcError::ByteParse);
        }
        let sw1 = response[response.len() - 2];
        let sw2 = response[response.len() - 1];
        if sw1 != 0x90 || sw2 != 0x00 {
            return Err(NfcError::UnexpectedStatus(sw2));
        }
        Ok(&response[..response.len() - 2])
    }
}
