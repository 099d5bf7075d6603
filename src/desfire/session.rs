//! Authentication state and the per-session secure-messaging pipeline.
//!
//! A DESFire session threads a single IV through every command and response:
//! after each successful exchange the IV is either the last CMAC
//! (plain/MACed traffic) or the last ciphertext block (enciphered traffic).
//! Legacy DES/2K3DES sessions carry no IV; every cryptogram starts from
//! zeros.

use zeroize::Zeroize;

use super::types::{CommunicationSetting, KeyType};
use crate::crypto;
use crate::errors::{NfcError, NfcResult};

/// Session key derivation from the mutual-authentication nonces.
pub fn generate_session_key(rand_a: &[u8], rand_b: &[u8], key_type: KeyType) -> Vec<u8> {
    let mut skey = Vec::with_capacity(key_type.key_len());

    match key_type {
        KeyType::Des => {
            skey.extend_from_slice(&rand_a[0..4]);
            skey.extend_from_slice(&rand_b[0..4]);
        }
        KeyType::Tdes => {
            skey.extend_from_slice(&rand_a[0..4]);
            skey.extend_from_slice(&rand_b[0..4]);
            skey.extend_from_slice(&rand_a[4..8]);
            skey.extend_from_slice(&rand_b[4..8]);
        }
        KeyType::Tktdes => {
            skey.extend_from_slice(&rand_a[0..4]);
            skey.extend_from_slice(&rand_b[0..4]);
            skey.extend_from_slice(&rand_a[6..10]);
            skey.extend_from_slice(&rand_b[6..10]);
            skey.extend_from_slice(&rand_a[12..16]);
            skey.extend_from_slice(&rand_b[12..16]);
        }
        KeyType::Aes => {
            skey.extend_from_slice(&rand_a[0..4]);
            skey.extend_from_slice(&rand_b[0..4]);
            skey.extend_from_slice(&rand_a[12..16]);
            skey.extend_from_slice(&rand_b[12..16]);
        }
    }

    skey
}

/// File-settings cache: one entry, raw bytes as returned by the card.
#[derive(Debug)]
pub(crate) struct FileCache {
    pub file_no: u8,
    pub settings: Vec<u8>,
}

/// Authentication state of one card connection.
///
/// Commands that need a secure session pattern-match on `Authenticated`;
/// everything in it dies together on reset.
#[derive(Debug)]
pub(crate) enum Session {
    Unauthenticated,
    Authenticated {
        key_type: KeyType,
        key_no: u8,
        iv: Vec<u8>,
        session_key: Vec<u8>,
        file_cache: Option<FileCache>,
    },
}

/// The CMAC input of a command APDU: `INS || body`, leaving out CLA, the
/// length bytes and the `Le` trailer.
fn cmac_input(apdu: &[u8]) -> Vec<u8> {
    let mut block = vec![apdu[1]];
    if apdu.len() > 5 {
        block.extend_from_slice(&apdu[5..apdu.len() - 1]);
    }
    block
}

/// Rebuild an APDU with `extra` appended to its body, recomputing `Lc`.
fn splice_body(apdu: &[u8], extra: &[u8]) -> Vec<u8> {
    let body = if apdu.len() > 5 {
        &apdu[5..apdu.len() - 1]
    } else {
        &[][..]
    };

    let mut out = Vec::with_capacity(5 + body.len() + extra.len() + 1);
    out.extend_from_slice(&apdu[..4]);
    out.push((body.len() + extra.len()) as u8);
    out.extend_from_slice(body);
    out.extend_from_slice(extra);
    out.push(0x00);
    out
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated { .. })
    }

    pub fn key_type(&self) -> Option<KeyType> {
        match self {
            Session::Authenticated { key_type, .. } => Some(*key_type),
            Session::Unauthenticated => None,
        }
    }

    pub fn key_no(&self) -> Option<u8> {
        match self {
            Session::Authenticated { key_no, .. } => Some(*key_no),
            Session::Unauthenticated => None,
        }
    }

    /// Wipe the key material and fall back to the unauthenticated state.
    /// The AID selection survives; everything else does not.
    pub fn reset(&mut self) {
        if let Session::Authenticated {
            session_key, iv, ..
        } = self
        {
            session_key.zeroize();
            iv.zeroize();
        }
        *self = Session::Unauthenticated;
    }

    /// Enter the authenticated state with a fresh all-zero IV.
    pub fn install(&mut self, key_type: KeyType, key_no: u8, session_key: Vec<u8>) {
        self.reset();
        let iv = if key_type.is_legacy() {
            Vec::new()
        } else {
            vec![0u8; key_type.block_size()]
        };
        *self = Session::Authenticated {
            key_type,
            key_no,
            iv,
            session_key,
            file_cache: None,
        };
    }

    pub fn cached_file_settings(&self, file_no: u8) -> Option<&[u8]> {
        match self {
            Session::Authenticated {
                file_cache: Some(cache),
                ..
            } if cache.file_no == file_no => Some(&cache.settings),
            _ => None,
        }
    }

    pub fn cache_file_settings(&mut self, file_no: u8, settings: Vec<u8>) {
        if let Session::Authenticated { file_cache, .. } = self {
            *file_cache = Some(FileCache { file_no, settings });
        }
    }

    pub fn forget_file(&mut self, file_no: u8) {
        if let Session::Authenticated { file_cache, .. } = self {
            if matches!(file_cache, Some(cache) if cache.file_no == file_no) {
                *file_cache = None;
            }
        }
    }

    /// Transform an outbound APDU into its wire form for `mode`.
    ///
    /// `offset` is the number of body bytes that stay in clear in enciphered
    /// mode (e.g. the file number of Credit) or are excluded from the legacy
    /// MAC.
    ///
    /// Without a session the APDU passes through unchanged.
    pub fn preprocess(
        &mut self,
        apdu: &[u8],
        offset: usize,
        mode: CommunicationSetting,
    ) -> NfcResult<Vec<u8>> {
        if !self.is_authenticated() {
            return Ok(apdu.to_vec());
        }

        match mode {
            CommunicationSetting::Plain => self.preprocess_plain(apdu),
            CommunicationSetting::Maced => self.preprocess_maced(apdu, offset),
            CommunicationSetting::Enciphered => self.preprocess_enciphered(apdu, offset),
        }
    }

    fn preprocess_plain(&mut self, apdu: &[u8]) -> NfcResult<Vec<u8>> {
        if let Some(key_type) = self.key_type() {
            if !key_type.is_legacy() {
                // the IV moves even though nothing is appended
                self.advance_iv_cmac(&cmac_input(apdu))?;
            }
        }
        Ok(apdu.to_vec())
    }

    fn preprocess_maced(&mut self, apdu: &[u8], offset: usize) -> NfcResult<Vec<u8>> {
        match self {
            Session::Authenticated {
                key_type,
                session_key,
                ..
            } if key_type.is_legacy() => {
                let body = if apdu.len() > 5 {
                    &apdu[5 + offset..apdu.len() - 1]
                } else {
                    &[][..]
                };
                let mac = crypto::retail_mac(session_key, body)?;
                Ok(splice_body(apdu, &mac))
            }
            Session::Authenticated { .. } => {
                let mac = self.advance_iv_cmac(&cmac_input(apdu))?;
                Ok(splice_body(apdu, &mac[..8]))
            }
            Session::Unauthenticated => Err(NfcError::NotAuthenticated),
        }
    }

    fn preprocess_enciphered(&mut self, apdu: &[u8], offset: usize) -> NfcResult<Vec<u8>> {
        let key_type = self.key_type().ok_or(NfcError::NotAuthenticated)?;
        let body = if apdu.len() > 5 {
            &apdu[5..apdu.len() - 1]
        } else {
            &[][..]
        };
        if offset > body.len() {
            return Err(NfcError::InvalidArgument);
        }

        let mut plaintext = body[offset..].to_vec();
        if key_type.is_legacy() {
            plaintext.extend_from_slice(&crypto::crc16(&body[offset..]));
        } else {
            plaintext.extend_from_slice(&crypto::crc32(&cmac_input(apdu)));
        }
        let plaintext = crypto::zero_pad(&plaintext, key_type.block_size());
        let ciphertext = self.encrypt_with_session(&plaintext)?;

        let mut out = Vec::with_capacity(5 + offset + ciphertext.len() + 1);
        out.extend_from_slice(&apdu[..4]);
        out.push((offset + ciphertext.len()) as u8);
        out.extend_from_slice(&body[..offset]);
        out.extend_from_slice(&ciphertext);
        out.push(0x00);
        Ok(out)
    }

    /// Verify and unwrap an inbound response for `mode`.
    ///
    /// `expected_len` is the plaintext length of an enciphered response (the
    /// CRC trailer and the padding are beyond it).
    ///
    /// A terminal status other than 0x00, and any MAC or CRC mismatch, resets
    /// the session, mirroring what the card does on its side.
    pub fn postprocess(
        &mut self,
        response: &[u8],
        expected_len: Option<usize>,
        mode: CommunicationSetting,
    ) -> NfcResult<Vec<u8>> {
        if response.len() < 2 {
            return Err(NfcError::ByteParse);
        }
        let sw2 = response[response.len() - 1];
        if sw2 != 0x00 {
            self.reset();
            return Err(NfcError::UnexpectedStatus(sw2));
        }

        let data = &response[..response.len() - 2];
        if !self.is_authenticated() {
            return Ok(data.to_vec());
        }
        let legacy = self.key_type().map(KeyType::is_legacy).unwrap_or(true);

        let result = match mode {
            CommunicationSetting::Plain if legacy => Ok(data.to_vec()),
            // a short plain response cannot carry a CMAC (GetVersion)
            CommunicationSetting::Plain if data.len() < 8 => Ok(data.to_vec()),
            CommunicationSetting::Plain | CommunicationSetting::Maced => self.verify_mac(response),
            CommunicationSetting::Enciphered => {
                let length = expected_len.ok_or(NfcError::InvalidArgument)?;
                self.decipher_response(response, length)
            }
        };

        if matches!(
            result,
            Err(NfcError::CmacMismatch) | Err(NfcError::CrcMismatch)
        ) {
            self.reset();
        }
        result
    }

    fn verify_mac(&mut self, response: &[u8]) -> NfcResult<Vec<u8>> {
        let data = &response[..response.len() - 2];
        let sw2 = response[response.len() - 1];

        match self {
            Session::Authenticated {
                key_type,
                iv,
                session_key,
                ..
            } => {
                if key_type.is_legacy() {
                    if data.len() < 4 {
                        return Err(NfcError::CmacMismatch);
                    }
                    let mac = crypto::retail_mac(session_key, &data[..data.len() - 4])?;
                    if mac != data[data.len() - 4..] {
                        return Err(NfcError::CmacMismatch);
                    }
                    Ok(data[..data.len() - 4].to_vec())
                } else {
                    if data.len() < 8 {
                        return Err(NfcError::CmacMismatch);
                    }
                    let mut block = data[..data.len() - 8].to_vec();
                    block.push(sw2);
                    let mac = match key_type {
                        KeyType::Tktdes => crypto::cmac_tdes(session_key, iv, &block)?,
                        _ => crypto::cmac_aes(session_key, iv, &block)?,
                    };
                    if mac[..8] != data[data.len() - 8..] {
                        return Err(NfcError::CmacMismatch);
                    }
                    iv.clear();
                    iv.extend_from_slice(&mac);
                    Ok(data[..data.len() - 8].to_vec())
                }
            }
            Session::Unauthenticated => Err(NfcError::NotAuthenticated),
        }
    }

    fn decipher_response(&mut self, response: &[u8], length: usize) -> NfcResult<Vec<u8>> {
        let sw2 = response[response.len() - 1];
        let ciphertext = &response[..response.len() - 2];

        let plaintext = self.decrypt_with_session(ciphertext)?;
        let legacy = self.key_type().map(KeyType::is_legacy).unwrap_or(true);
        let crc_len = if legacy { 2 } else { 4 };
        if length + crc_len > plaintext.len() {
            return Err(NfcError::CrcMismatch);
        }

        let crc: Vec<u8> = if legacy {
            crypto::crc16(&plaintext[..length]).to_vec()
        } else {
            let mut block = plaintext[..length].to_vec();
            block.push(sw2);
            crypto::crc32(&block).to_vec()
        };
        if crc.as_slice() != &plaintext[length..length + crc_len] {
            return Err(NfcError::CrcMismatch);
        }

        Ok(plaintext[..length].to_vec())
    }

    /// CMAC the given block with the session key, store the tag as the new
    /// IV and return it.
    fn advance_iv_cmac(&mut self, data: &[u8]) -> NfcResult<Vec<u8>> {
        match self {
            Session::Authenticated {
                key_type,
                iv,
                session_key,
                ..
            } => {
                let mac = match key_type {
                    KeyType::Tktdes => crypto::cmac_tdes(session_key, iv, data)?,
                    KeyType::Aes => crypto::cmac_aes(session_key, iv, data)?,
                    _ => return Err(NfcError::InvalidArgument),
                };
                iv.clear();
                iv.extend_from_slice(&mac);
                Ok(mac)
            }
            Session::Unauthenticated => Err(NfcError::NotAuthenticated),
        }
    }

    /// Encrypt with the session key. 3K3DES/AES chain from the session IV
    /// and leave the last ciphertext block in it; legacy sessions use the
    /// MF3ICD40 send mode starting from zeros.
    pub fn encrypt_with_session(&mut self, plaintext: &[u8]) -> NfcResult<Vec<u8>> {
        match self {
            Session::Authenticated {
                key_type,
                iv,
                session_key,
                ..
            } => {
                let ciphertext = match key_type {
                    KeyType::Des | KeyType::Tdes => crypto::des_send(session_key, plaintext)?,
                    KeyType::Tktdes => crypto::tdes_encrypt(session_key, iv, plaintext)?,
                    KeyType::Aes => crypto::aes_encrypt(session_key, iv, plaintext)?,
                };
                if !key_type.is_legacy() {
                    let block_size = key_type.block_size();
                    iv.clear();
                    iv.extend_from_slice(&ciphertext[ciphertext.len() - block_size..]);
                }
                Ok(ciphertext)
            }
            Session::Unauthenticated => Err(NfcError::NotAuthenticated),
        }
    }

    /// Decrypt with the session key; the counterpart of
    /// [`Session::encrypt_with_session`]. The new IV is the last block of
    /// the received ciphertext.
    fn decrypt_with_session(&mut self, ciphertext: &[u8]) -> NfcResult<Vec<u8>> {
        match self {
            Session::Authenticated {
                key_type,
                iv,
                session_key,
                ..
            } => {
                let plaintext = match key_type {
                    KeyType::Des | KeyType::Tdes => crypto::des_receive(session_key, ciphertext)?,
                    KeyType::Tktdes => crypto::tdes_decrypt(session_key, iv, ciphertext)?,
                    KeyType::Aes => crypto::aes_decrypt(session_key, iv, ciphertext)?,
                };
                if !key_type.is_legacy() {
                    let block_size = key_type.block_size();
                    if ciphertext.len() < block_size {
                        return Err(NfcError::ByteParse);
                    }
                    iv.clear();
                    iv.extend_from_slice(&ciphertext[ciphertext.len() - block_size..]);
                }
                Ok(plaintext)
            }
            Session::Unauthenticated => Err(NfcError::NotAuthenticated),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Session::Authenticated {
            session_key, iv, ..
        } = self
        {
            session_key.zeroize();
            iv.zeroize();
        }
    }
}
