//! MIFARE DESFire EV1 command set.
//!
//! Every command builds a `CLA=0x90` short APDU, runs it through the session
//! preprocess step, exchanges it (collecting additional frames where the
//! protocol chains), and verifies the response in the postprocess step.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use super::session::{generate_session_key, Session};
use super::types::*;
use crate::crypto;
use crate::errors::{NfcError, NfcResult};
use crate::transport::SmartCardTransport;
use crate::utils::Serializable;

/// Maximum payload bytes per write frame.
const WRITE_FRAME_SIZE: usize = 52;

const PICC_AID: [u8; 3] = [0x00, 0x00, 0x00];

pub struct MiFareDESFire<T: SmartCardTransport> {
    pub transport: T,
    session: Session,
    aid: [u8; 3],
    last_status: u8,
}

fn read_u24_le(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}

impl<T: SmartCardTransport> MiFareDESFire<T> {
    /// ATR of MIFARE DESFire cards as reported through PC/SC.
    pub const ATR: [u8; 6] = hex!("3B 81 80 01 80 80");

    pub fn is_compatible(atr: &[u8]) -> bool {
        atr == Self::ATR
    }

    pub fn new(transport: T) -> Self {
        MiFareDESFire {
            transport,
            session: Session::Unauthenticated,
            aid: PICC_AID,
            last_status: 0x00,
        }
    }

    pub fn connect(&mut self) -> bool {
        self.transport.connect()
    }

    /// Tears the session down (zeroizing key material) and releases the
    /// reader.
    pub fn disconnect(&mut self) -> bool {
        self.session.reset();
        self.transport.disconnect()
    }

    /// Status byte (`SW2`) of the previous command, for diagnostics.
    pub fn last_status_code(&self) -> u8 {
        self.last_status
    }

    /// The currently selected AID; all zeros at PICC level.
    pub fn selected_aid(&self) -> [u8; 3] {
        self.aid
    }

    fn build_apdu(ins: u8, body: &[u8]) -> Vec<u8> {
        let mut apdu = Vec::with_capacity(5 + body.len() + 1);
        apdu.push(0x90);
        apdu.push(ins);
        apdu.push(0x00);
        apdu.push(0x00);
        if body.is_empty() {
            apdu.push(0x00);
        } else {
            apdu.push(body.len() as u8);
            apdu.extend_from_slice(body);
            apdu.push(0x00);
        }
        apdu
    }

    fn transmit(&mut self, apdu: &[u8]) -> NfcResult<Vec<u8>> {
        let response = self.transport.transmit(apdu)?;
        if response.len() < 2 {
            return Err(NfcError::TransportFailure);
        }
        self.last_status = response[response.len() - 1];
        trace!("card status: {:?}", Status::parse(self.last_status));
        Ok(response)
    }

    /// One wrapped exchange without frame chaining.
    fn exchange(
        &mut self,
        apdu: Vec<u8>,
        out_mode: CommunicationSetting,
        offset: usize,
        in_mode: CommunicationSetting,
        expected_len: Option<usize>,
    ) -> NfcResult<Vec<u8>> {
        let apdu = self.session.preprocess(&apdu, offset, out_mode)?;
        let response = self.transmit(&apdu)?;
        self.session.postprocess(&response, expected_len, in_mode)
    }

    /// Issue a command and keep requesting additional frames while the card
    /// answers 0xAF. Returns the concatenated data followed by the final
    /// `SW1 SW2`; postprocessing runs once on that aggregate.
    fn transmit_chained(&mut self, apdu: &[u8]) -> NfcResult<Vec<u8>> {
        let mut response = self.transmit(apdu)?;
        let mut data: Vec<u8> = Vec::new();
        loop {
            data.extend_from_slice(&response[..response.len() - 2]);
            if self.last_status != STATUS_ADDITIONAL_FRAME {
                break;
            }
            response = self.transmit(&Self::build_apdu(STATUS_ADDITIONAL_FRAME, &[]))?;
        }
        data.extend_from_slice(&response[response.len() - 2..]);
        Ok(data)
    }

    // Security related commands

    /// Mutual authentication. On success the session key is installed
    /// together with an all-zero IV, and also returned to the caller.
    #[allow(non_snake_case)]
    pub fn authenticate(&mut self, key_no: u8, key: &[u8], key_type: KeyType) -> NfcResult<Vec<u8>> {
        validate_key(key, key_type)?;
        self.session.reset();

        let mut key = key.to_vec();
        if key_type != KeyType::Aes {
            // the version bits do not take part in the crypto
            set_key_version(&mut key, 0x00);
        }

        let block_size = key_type.block_size();

        let response = self.transmit(&Self::build_apdu(key_type.auth_ins(), &[key_no]))?;
        if self.last_status != STATUS_ADDITIONAL_FRAME {
            return Err(NfcError::UnexpectedStatus(self.last_status));
        }
        let ek_rndB = &response[..response.len() - 2];
        if ek_rndB.len() != block_size {
            return Err(NfcError::ByteParse);
        }

        let rndB = Self::recv(&key, ek_rndB, key_type, &vec![0u8; block_size])?;
        let rndA = crypto::generate_nonce(rndB.len());

        let mut plaintext = rndA.clone();
        plaintext.extend_from_slice(&crypto::rotate_left(&rndB));
        let iv1 = &ek_rndB[ek_rndB.len() - block_size..];
        let token = Self::send(&key, &plaintext, key_type, iv1)?;

        let response = self.transmit(&Self::build_apdu(STATUS_ADDITIONAL_FRAME, &token))?;
        if self.last_status != STATUS_OPERATION_OK {
            return Err(NfcError::UnexpectedStatus(self.last_status));
        }

        let iv2 = &token[token.len() - block_size..];
        let rndA_card = Self::recv(&key, &response[..response.len() - 2], key_type, iv2)?;
        if rndA_card != crypto::rotate_left(&rndA) {
            return Err(NfcError::AuthenticationRejected);
        }

        let session_key = generate_session_key(&rndA, &rndB, key_type);
        self.session.install(key_type, key_no, session_key.clone());

        Ok(session_key)
    }

    // Enciphering data towards the card with the shared key. Legacy DES
    // paths run the cipher in send mode and ignore the IV.
    fn send(key: &[u8], data: &[u8], key_type: KeyType, iv: &[u8]) -> NfcResult<Vec<u8>> {
        match key_type {
            KeyType::Des | KeyType::Tdes => crypto::des_send(key, data),
            KeyType::Tktdes => crypto::tdes_encrypt(key, iv, data),
            KeyType::Aes => crypto::aes_encrypt(key, iv, data),
        }
    }

    fn recv(key: &[u8], data: &[u8], key_type: KeyType, iv: &[u8]) -> NfcResult<Vec<u8>> {
        match key_type {
            KeyType::Des | KeyType::Tdes => crypto::des_receive(key, data),
            KeyType::Tktdes => crypto::tdes_decrypt(key, iv, data),
            KeyType::Aes => crypto::aes_decrypt(key, iv, data),
        }
    }

    /// Change the PICC or application master key settings.
    /// Requires a preceding authentication.
    pub fn change_key_settings(&mut self, settings: &KeySettings) -> NfcResult<()> {
        if !self.session.is_authenticated() {
            return Err(NfcError::NotAuthenticated);
        }

        let apdu = Self::build_apdu(0x54, &[settings.to_byte()?]);
        self.exchange(
            apdu,
            CommunicationSetting::Enciphered,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    pub fn get_key_settings(&mut self) -> NfcResult<(KeySettings, u8)> {
        let result = self.exchange(
            Self::build_apdu(0x45, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;

        let mut cursor = Cursor::new(result.as_slice());
        let settings = KeySettings::from_bytes(&mut cursor)?;
        let max_keys = cursor.read_u8()?;

        Ok((settings, max_keys))
    }

    pub fn get_key_version(&mut self, key_no: u8) -> NfcResult<u8> {
        let result = self.exchange(
            Self::build_apdu(0x64, &[key_no]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        if result.len() != 1 {
            return Err(NfcError::ByteParse);
        }
        Ok(result[0])
    }

    /// Change any key stored on the PICC.
    ///
    /// `old_key` is required when the key being changed differs from the one
    /// authenticated with. At PICC level only key 0 exists, and the key
    /// number signals the new cipher family (0x40 for 3K3DES, 0x80 for AES).
    /// Changing the authenticated key itself invalidates the session.
    pub fn change_key(
        &mut self,
        key_no: u8,
        version: u8,
        new_type: KeyType,
        new_key: &[u8],
        old_key: Option<&[u8]>,
    ) -> NfcResult<()> {
        let session_type = self.session.key_type().ok_or(NfcError::NotAuthenticated)?;
        let auth_key_no = self.session.key_no().ok_or(NfcError::NotAuthenticated)?;
        validate_key(new_key, new_type)?;
        if self.aid == PICC_AID && key_no != 0x00 {
            return Err(NfcError::InvalidArgument);
        }

        let same_key = (key_no & 0x0F) == (auth_key_no & 0x0F);
        let old_key = if same_key {
            None
        } else {
            let old = old_key.ok_or(NfcError::InvalidArgument)?;
            if old.len() != session_type.key_len() {
                return Err(NfcError::InvalidArgument);
            }
            Some(old.to_vec())
        };

        let new_key_len = if new_type == KeyType::Tktdes { 24 } else { 16 };
        let mut plaintext = match session_type {
            KeyType::Des | KeyType::Tdes => {
                vec![0u8; if new_type == KeyType::Tktdes { 32 } else { 24 }]
            }
            KeyType::Tktdes | KeyType::Aes => vec![0u8; 32],
        };

        let mut key = new_key.to_vec();
        if new_type == KeyType::Aes {
            plaintext[16] = version;
        } else {
            set_key_version(&mut key, version);
        }
        plaintext[..key.len()].copy_from_slice(&key);
        if new_type == KeyType::Des {
            // 8-byte DES keys travel as 16 bytes, duplicated
            plaintext[8..16].copy_from_slice(&key);
            key = plaintext[..16].to_vec();
        }

        let mut key_no = key_no;
        if self.aid == PICC_AID {
            match new_type {
                KeyType::Tktdes => key_no |= 0x40,
                KeyType::Aes => key_no |= 0x80,
                _ => {}
            }
        }

        if let Some(old) = &old_key {
            for i in 0..key.len() {
                plaintext[i] ^= old[i % old.len()];
            }
        }

        let version_byte = usize::from(new_type == KeyType::Aes);
        let crc_at = new_key_len + version_byte;

        let ciphertext = match session_type {
            KeyType::Des | KeyType::Tdes => {
                let crc = crypto::crc16(&plaintext[..crc_at]);
                plaintext[crc_at..crc_at + 2].copy_from_slice(&crc);
                if old_key.is_some() {
                    let crc = crypto::crc16(&key);
                    plaintext[crc_at + 2..crc_at + 4].copy_from_slice(&crc);
                }
                self.session.encrypt_with_session(&plaintext)?
            }
            KeyType::Tktdes | KeyType::Aes => {
                let mut crc_input = vec![0xC4, key_no];
                crc_input.extend_from_slice(&plaintext[..crc_at]);
                let crc = crypto::crc32(&crc_input);
                plaintext[crc_at..crc_at + 4].copy_from_slice(&crc);
                if old_key.is_some() {
                    let crc = crypto::crc32(&key);
                    plaintext[crc_at + 4..crc_at + 8].copy_from_slice(&crc);
                }
                self.session.encrypt_with_session(&plaintext)?
            }
        };

        let mut body = Vec::with_capacity(1 + ciphertext.len());
        body.push(key_no);
        body.extend_from_slice(&ciphertext);
        let response = self.transmit(&Self::build_apdu(0xC4, &body))?;

        if self.last_status != STATUS_OPERATION_OK {
            self.session.reset();
            return Err(NfcError::UnexpectedStatus(self.last_status));
        }
        if same_key {
            // the key under our session just changed
            self.session.reset();
        } else {
            self.session
                .postprocess(&response, None, CommunicationSetting::Plain)?;
        }

        Ok(())
    }

    // PICC level commands

    /// Requires the PICC-level AID to be selected.
    pub fn create_application(
        &mut self,
        aid: [u8; 3],
        settings: KeySettings,
        num_keys: u8,
    ) -> NfcResult<()> {
        let body = [aid[0], aid[1], aid[2], settings.to_byte()?, num_keys];
        self.exchange(
            Self::build_apdu(0xCA, &body),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    pub fn delete_application(&mut self, aid: [u8; 3]) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xDA, &aid),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;

        if self.aid == aid {
            // deleting the selected application drops back to PICC level
            self.session.reset();
            self.aid = PICC_AID;
        }
        Ok(())
    }

    /// AIDs of all active applications. PICC level only.
    pub fn get_application_ids(&mut self) -> NfcResult<Vec<[u8; 3]>> {
        let apdu =
            self.session
                .preprocess(&Self::build_apdu(0x6A, &[]), 0, CommunicationSetting::Plain)?;
        let response = self.transmit_chained(&apdu)?;
        let result = self
            .session
            .postprocess(&response, None, CommunicationSetting::Plain)?;

        let mut ids = Vec::with_capacity(result.len() / 3);
        for chunk in result.chunks_exact(3) {
            ids.push([chunk[0], chunk[1], chunk[2]]);
        }
        Ok(ids)
    }

    /// Free user memory on the card, in bytes.
    pub fn free_memory(&mut self) -> NfcResult<u32> {
        let result = self.exchange(
            Self::build_apdu(0x6E, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;

        let mut cursor = Cursor::new(result.as_slice());
        Ok(cursor.read_u24::<LittleEndian>()?)
    }

    /// Select the PICC or an application. The authentication state is lost
    /// either way.
    pub fn select_application(&mut self, aid: [u8; 3]) -> NfcResult<()> {
        let result = self.transmit(&Self::build_apdu(0x5A, &aid));
        self.session.reset();

        let response = result?;
        let sw2 = response[response.len() - 1];
        if sw2 != STATUS_OPERATION_OK {
            return Err(NfcError::UnexpectedStatus(sw2));
        }
        self.aid = aid;
        Ok(())
    }

    /// Release all user memory: deletes every application and file. The PICC
    /// master key survives. Requires a PICC master key authentication.
    pub fn format_picc(&mut self) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xFC, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    /// Manufacturing related data, spread over three frames.
    pub fn get_version(&mut self) -> NfcResult<Version> {
        let apdu =
            self.session
                .preprocess(&Self::build_apdu(0x60, &[]), 0, CommunicationSetting::Plain)?;
        let response = self.transmit_chained(&apdu)?;
        let result = self
            .session
            .postprocess(&response, None, CommunicationSetting::Plain)?;

        Version::from_slice(&result)
    }

    /// The 7-byte UID, transferred enciphered. Requires authentication.
    pub fn get_card_uid(&mut self) -> NfcResult<[u8; 7]> {
        if !self.session.is_authenticated() {
            return Err(NfcError::NotAuthenticated);
        }

        let result = self.exchange(
            Self::build_apdu(0x51, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Enciphered,
            Some(7),
        )?;

        let mut uid = [0u8; 7];
        uid.copy_from_slice(&result[..7]);
        Ok(uid)
    }

    // Application level commands

    pub fn get_file_ids(&mut self) -> NfcResult<Vec<u8>> {
        self.exchange(
            Self::build_apdu(0x6F, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )
    }

    pub fn get_file_settings(&mut self, file_no: u8) -> NfcResult<FileSettings> {
        let raw = self.file_settings_raw(file_no)?;
        FileSettings::from_slice(&raw)
    }

    fn file_settings_raw(&mut self, file_no: u8) -> NfcResult<Vec<u8>> {
        self.exchange(
            Self::build_apdu(0xF5, &[file_no]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )
    }

    fn cached_file_settings(&mut self, file_no: u8, force_refresh: bool) -> NfcResult<Vec<u8>> {
        if !force_refresh {
            if let Some(settings) = self.session.cached_file_settings(file_no) {
                return Ok(settings.to_vec());
            }
        }

        let settings = self.file_settings_raw(file_no)?;
        self.session.cache_file_settings(file_no, settings.clone());
        Ok(settings)
    }

    /// Pick the secure-messaging mode for an operation on a file from the
    /// relevant access-rights nibbles and the authenticated key number.
    fn file_comm_mode(
        &mut self,
        file_no: u8,
        rw: bool,
        car: bool,
        r: bool,
        w: bool,
        force_refresh: bool,
    ) -> NfcResult<CommunicationSetting> {
        let settings = self.cached_file_settings(file_no, force_refresh)?;
        if settings.len() < 4 {
            return Err(NfcError::ByteParse);
        }
        let key_no = self.session.key_no();

        let mut key_matches = false;
        let mut free_access = false;
        let mut check = |nibble: u8| {
            if Some(nibble) == key_no {
                key_matches = true;
            } else if nibble == 0x0E {
                free_access = true;
            }
        };

        if rw {
            check(settings[2] >> 4);
        }
        if car {
            // change-access-rights has its own policy
            let nibble = settings[2] & 0x0F;
            if Some(nibble) == key_no {
                return Ok(CommunicationSetting::Enciphered);
            }
            if nibble == 0x0E {
                return Ok(CommunicationSetting::Plain);
            }
        }
        if r {
            check(settings[3] >> 4);
        }
        if w {
            check(settings[3] & 0x0F);
        }

        if key_matches {
            CommunicationSetting::from_byte(settings[1])
        } else if free_access {
            Ok(CommunicationSetting::Plain)
        } else if key_no.is_none() {
            Err(NfcError::NotAuthenticated)
        } else {
            Err(NfcError::AccessDenied)
        }
    }

    /// Requires an authentication with the CAR key (or a free CAR nibble).
    pub fn change_file_settings(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
    ) -> NfcResult<()> {
        let mode = self.file_comm_mode(file_no, false, true, false, false, false)?;

        let mut body = vec![file_no];
        communication.to_bytes(&mut body)?;
        access_rights.to_bytes(&mut body)?;

        // the file number stays in clear
        self.exchange(
            Self::build_apdu(0x5F, &body),
            mode,
            1,
            CommunicationSetting::Plain,
            None,
        )?;
        self.session.forget_file(file_no);
        Ok(())
    }

    pub fn create_std_data_file(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        file_size: u32,
    ) -> NfcResult<()> {
        self.create_data_file(0xCD, file_no, communication, access_rights, file_size)
    }

    /// Backup data files stage their writes until `commit_transaction`, at
    /// twice the memory cost of a standard data file.
    pub fn create_backup_data_file(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        file_size: u32,
    ) -> NfcResult<()> {
        self.create_data_file(0xCB, file_no, communication, access_rights, file_size)
    }

    fn create_data_file(
        &mut self,
        ins: u8,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        file_size: u32,
    ) -> NfcResult<()> {
        let mut body: Vec<u8> = Vec::new();
        body.write_u8(file_no)?;
        communication.to_bytes(&mut body)?;
        access_rights.to_bytes(&mut body)?;
        body.write_u24::<LittleEndian>(file_size)?;

        self.exchange(
            Self::build_apdu(ins, &body),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_value_file(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        lower_limit: i32,
        upper_limit: i32,
        value: i32,
        limited_credit_enabled: bool,
    ) -> NfcResult<()> {
        let mut body: Vec<u8> = Vec::new();
        body.write_u8(file_no)?;
        communication.to_bytes(&mut body)?;
        access_rights.to_bytes(&mut body)?;
        body.write_i32::<LittleEndian>(lower_limit)?;
        body.write_i32::<LittleEndian>(upper_limit)?;
        body.write_i32::<LittleEndian>(value)?;
        body.write_u8(if limited_credit_enabled { 0x01 } else { 0x00 })?;

        self.exchange(
            Self::build_apdu(0xCC, &body),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    pub fn create_linear_record_file(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        record_size: u32,
        max_records: u32,
    ) -> NfcResult<()> {
        self.create_record_file(0xC1, file_no, communication, access_rights, record_size, max_records)
    }

    /// A cyclic record file keeps `max_records - 1` usable records; once
    /// full, the oldest record is overwritten.
    pub fn create_cyclic_record_file(
        &mut self,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        record_size: u32,
        max_records: u32,
    ) -> NfcResult<()> {
        self.create_record_file(0xC0, file_no, communication, access_rights, record_size, max_records)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_record_file(
        &mut self,
        ins: u8,
        file_no: u8,
        communication: CommunicationSetting,
        access_rights: AccessRights,
        record_size: u32,
        max_records: u32,
    ) -> NfcResult<()> {
        let mut body: Vec<u8> = Vec::new();
        body.write_u8(file_no)?;
        communication.to_bytes(&mut body)?;
        access_rights.to_bytes(&mut body)?;
        body.write_u24::<LittleEndian>(record_size)?;
        body.write_u24::<LittleEndian>(max_records)?;

        self.exchange(
            Self::build_apdu(ins, &body),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    pub fn delete_file(&mut self, file_no: u8) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xDF, &[file_no]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        self.session.forget_file(file_no);
        Ok(())
    }

    // Data manipulation commands

    /// Read from a standard or backup data file. A `length` of zero reads
    /// the whole file starting at `offset`.
    pub fn read_data(&mut self, file_no: u8, offset: u32, length: u32) -> NfcResult<Vec<u8>> {
        self.read_file(0xBD, file_no, offset, length)
    }

    /// Read complete records, oldest first. A `count` of zero reads all
    /// records starting at `offset` (counted from the most recent).
    pub fn read_records(&mut self, file_no: u8, offset: u32, count: u32) -> NfcResult<Vec<u8>> {
        self.read_file(0xBB, file_no, offset, count)
    }

    fn read_file(&mut self, ins: u8, file_no: u8, offset: u32, length: u32) -> NfcResult<Vec<u8>> {
        // the cached current-record count may be stale, refresh for records
        let mode = self.file_comm_mode(file_no, true, false, true, false, ins == 0xBB)?;
        let expected = self.expected_read_length(ins, file_no, offset, length)?;

        let mut body: Vec<u8> = Vec::new();
        body.write_u8(file_no)?;
        body.write_u24::<LittleEndian>(offset)?;
        body.write_u24::<LittleEndian>(length)?;

        let apdu = self.session.preprocess(
            &Self::build_apdu(ins, &body),
            0,
            CommunicationSetting::Plain,
        )?;
        let response = self.transmit_chained(&apdu)?;
        self.session.postprocess(&response, Some(expected), mode)
    }

    /// Plaintext length of the upcoming read; the enciphered response is
    /// longer than this because of the CRC trailer and the padding.
    fn expected_read_length(
        &mut self,
        ins: u8,
        file_no: u8,
        offset: u32,
        length: u32,
    ) -> NfcResult<usize> {
        if ins == 0xBD {
            if length != 0 {
                return Ok(length as usize);
            }
            let settings = self.cached_file_settings(file_no, false)?;
            if settings.len() < 7 {
                return Err(NfcError::ByteParse);
            }
            let file_size = read_u24_le(&settings[4..7]);
            Ok(file_size.saturating_sub(offset) as usize)
        } else {
            let settings = self.cached_file_settings(file_no, false)?;
            if settings.len() < 13 {
                return Err(NfcError::ByteParse);
            }
            let record_size = read_u24_le(&settings[4..7]);
            let records = if length != 0 {
                length
            } else {
                read_u24_le(&settings[10..13]).saturating_sub(offset)
            };
            Ok((record_size * records) as usize)
        }
    }

    /// Write to a standard or backup data file. Backup files require a
    /// `commit_transaction` before the data becomes visible.
    pub fn write_data(&mut self, file_no: u8, offset: u32, data: &[u8]) -> NfcResult<()> {
        self.write_file(0x3D, file_no, offset, data)
    }

    /// Write into the newest record of a record file; validated by
    /// `commit_transaction`.
    pub fn write_record(&mut self, file_no: u8, offset: u32, data: &[u8]) -> NfcResult<()> {
        self.write_file(0x3B, file_no, offset, data)
    }

    fn write_file(&mut self, ins: u8, file_no: u8, offset: u32, data: &[u8]) -> NfcResult<()> {
        let mode = self.file_comm_mode(file_no, true, false, false, true, false)?;

        let mut body = Vec::with_capacity(7 + data.len());
        body.write_u8(file_no)?;
        body.write_u24::<LittleEndian>(offset)?;
        body.write_u24::<LittleEndian>(data.len() as u32)?;
        body.extend_from_slice(data);

        // fileNo + offset + length stay in clear
        let apdu = self
            .session
            .preprocess(&Self::build_apdu(ins, &body), 7, mode)?;
        let payload = &apdu[5..apdu.len() - 1];

        let mut sent = 0;
        let mut response;
        loop {
            let frame_len = (payload.len() - sent).min(WRITE_FRAME_SIZE);
            let frame_ins = if sent == 0 { ins } else { STATUS_ADDITIONAL_FRAME };
            response = self.transmit(&Self::build_apdu(frame_ins, &payload[sent..sent + frame_len]))?;
            sent += frame_len;
            if sent >= payload.len() || self.last_status != STATUS_ADDITIONAL_FRAME {
                break;
            }
        }

        self.session
            .postprocess(&response, None, CommunicationSetting::Plain)?;
        Ok(())
    }

    /// Current value of a value file (not including uncommitted changes).
    pub fn get_value(&mut self, file_no: u8) -> NfcResult<i32> {
        let mode = self.file_comm_mode(file_no, true, false, true, true, false)?;

        let result = self.exchange(
            Self::build_apdu(0x6C, &[file_no]),
            CommunicationSetting::Plain,
            0,
            mode,
            Some(4),
        )?;

        let mut cursor = Cursor::new(result.as_slice());
        Ok(cursor.read_i32::<LittleEndian>()?)
    }

    /// Stage an increase of a value file; validated by
    /// `commit_transaction`.
    pub fn credit(&mut self, file_no: u8, value: i32) -> NfcResult<()> {
        self.value_op(0x0C, file_no, value)
    }

    /// Stage a decrease of a value file; validated by
    /// `commit_transaction`.
    pub fn debit(&mut self, file_no: u8, value: i32) -> NfcResult<()> {
        self.value_op(0xDC, file_no, value)
    }

    /// Stage a limited increase, bounded by the debits of the previous
    /// transaction. Only available with limited credit enabled.
    pub fn limited_credit(&mut self, file_no: u8, value: i32) -> NfcResult<()> {
        self.value_op(0x1C, file_no, value)
    }

    fn value_op(&mut self, ins: u8, file_no: u8, value: i32) -> NfcResult<()> {
        let mode = self.file_comm_mode(file_no, true, false, true, true, false)?;

        let mut body = vec![file_no];
        body.write_i32::<LittleEndian>(value)?;

        // the file number prefix stays in clear
        self.exchange(
            Self::build_apdu(ins, &body),
            mode,
            1,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    /// Reset a record file to the empty state; requires a subsequent
    /// `commit_transaction`.
    pub fn clear_record_file(&mut self, file_no: u8) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xEB, &[file_no]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    /// Validate all staged writes to value, backup and record files of the
    /// selected application.
    pub fn commit_transaction(&mut self) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xC7, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }

    /// Discard all staged writes of the selected application.
    pub fn abort_transaction(&mut self) -> NfcResult<()> {
        self.exchange(
            Self::build_apdu(0xA7, &[]),
            CommunicationSetting::Plain,
            0,
            CommunicationSetting::Plain,
            None,
        )?;
        Ok(())
    }
}
