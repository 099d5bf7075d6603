//! Wire-level data structures of the DESFire EV1 command set.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{NfcError, NfcResult};
use crate::utils::Serializable;

pub const STATUS_OPERATION_OK: u8 = 0x00;
pub const STATUS_ADDITIONAL_FRAME: u8 = 0xAF;

/// Status byte (`SW2`) of a DESFire response.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Status {
    OperationOk,
    NoChanges,
    OutOfEepromError,
    IllegalCommandCode,
    IntegrityError,
    NoSuchKey,
    LengthError,
    PermissionDenied,
    ParameterError,
    ApplicationNotFound,
    ApplIntegrityError,
    AuthenticationError,
    AdditionalFrame,
    BoundaryError,
    PiccIntegrityError,
    CommandAborted,
    PiccDisabledError,
    CountError,
    DuplicateError,
    EepromError,
    FileNotFound,
    FileIntegrityError,
    Unknown(u8),
}

impl Status {
    pub fn parse(code: u8) -> Status {
        match code {
            0x00 => Status::OperationOk,
            0x0C => Status::NoChanges,
            0x0E => Status::OutOfEepromError,
            0x1C => Status::IllegalCommandCode,
            0x1E => Status::IntegrityError,
            0x40 => Status::NoSuchKey,
            0x7E => Status::LengthError,
            0x9D => Status::PermissionDenied,
            0x9E => Status::ParameterError,
            0xA0 => Status::ApplicationNotFound,
            0xA1 => Status::ApplIntegrityError,
            0xAE => Status::AuthenticationError,
            0xAF => Status::AdditionalFrame,
            0xBE => Status::BoundaryError,
            0xC1 => Status::PiccIntegrityError,
            0xCA => Status::CommandAborted,
            0xCD => Status::PiccDisabledError,
            0xCE => Status::CountError,
            0xDE => Status::DuplicateError,
            0xEE => Status::EepromError,
            0xF0 => Status::FileNotFound,
            0xF1 => Status::FileIntegrityError,
            code => Status::Unknown(code),
        }
    }
}

/// Ciphers supported by DESFire EV1 for authentication and secure messaging.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum KeyType {
    /// Single DES, 8-byte key.
    Des,
    /// Two-key 3DES, 16-byte key.
    Tdes,
    /// Three-key 3DES, 24-byte key.
    Tktdes,
    /// AES-128, 16-byte key.
    Aes,
}

impl KeyType {
    pub fn key_len(self) -> usize {
        match self {
            KeyType::Des => 8,
            KeyType::Tdes => 16,
            KeyType::Tktdes => 24,
            KeyType::Aes => 16,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            KeyType::Aes => 16,
            _ => 8,
        }
    }

    pub fn auth_ins(self) -> u8 {
        match self {
            KeyType::Des | KeyType::Tdes => 0x0A,
            KeyType::Tktdes => 0x1A,
            KeyType::Aes => 0xAA,
        }
    }

    /// DES and 2K3DES sessions use the MF3ICD40-compatible wrapping: no
    /// session IV, 4-byte retail MAC, CRC-16.
    pub fn is_legacy(self) -> bool {
        matches!(self, KeyType::Des | KeyType::Tdes)
    }
}

/// Check a key against its declared type.
pub fn validate_key(key: &[u8], key_type: KeyType) -> NfcResult<()> {
    if key.len() != key_type.key_len() {
        return Err(NfcError::InvalidArgument);
    }
    if key_type == KeyType::Tdes && !is_key_3des(key) {
        return Err(NfcError::InvalidArgument);
    }
    Ok(())
}

/// Encode a key version into the least significant bit of each byte of a
/// DES family key. The version repeats every 8 bytes on 16/24-byte keys.
pub fn set_key_version(key: &mut [u8], version: u8) {
    if key.len() != 8 && key.len() != 16 && key.len() != 24 {
        return;
    }
    let mut j = 0;
    for i in (0..key.len()).rev() {
        key[i] = (key[i] & 0xFE) | ((version >> j) & 0x01);
        j = (j + 1) % 8;
    }
}

/// Read the key version carried in the parity bits of the first 8 bytes of a
/// DES family key.
pub fn key_version(key: &[u8]) -> u8 {
    let mut version = 0;
    for (i, b) in key.iter().take(8).enumerate() {
        version |= (b & 0x01) << (7 - i);
    }
    version
}

/// A 16-byte key is a real 2K3DES key only if its halves differ once the
/// version bits are cleared.
pub fn is_key_3des(key: &[u8]) -> bool {
    if key.len() != 16 {
        return false;
    }
    let mut tmp = key.to_vec();
    set_key_version(&mut tmp, 0x00);
    tmp[0..8] != tmp[8..16]
}

/// The secure-messaging mode negotiated per file and operation.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CommunicationSetting {
    Plain,
    Maced,
    Enciphered,
}

impl Serializable for CommunicationSetting {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        match cursor.read_u8()? & 0x03 {
            0x00 | 0x02 => Ok(CommunicationSetting::Plain),
            0x01 => Ok(CommunicationSetting::Maced),
            0x03 => Ok(CommunicationSetting::Enciphered),
            _ => Err(NfcError::ByteParse),
        }
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> NfcResult<()> {
        let value = match self {
            CommunicationSetting::Plain => 0x00,
            CommunicationSetting::Maced => 0x01,
            CommunicationSetting::Enciphered => 0x03,
        };

        bytes.write_u8(value)?;
        Ok(())
    }
}

/// One access-rights nibble: a key number, free access, or denied.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AccessKey {
    Key(u8),
    Free,
    Deny,
}

impl AccessKey {
    pub fn from_nibble(nibble: u8) -> AccessKey {
        match nibble & 0x0F {
            0x0E => AccessKey::Free,
            0x0F => AccessKey::Deny,
            n => AccessKey::Key(n),
        }
    }

    pub fn to_nibble(self) -> NfcResult<u8> {
        match self {
            AccessKey::Key(n) if n <= 0x0D => Ok(n),
            AccessKey::Key(_) => Err(NfcError::InvalidArgument),
            AccessKey::Free => Ok(0x0E),
            AccessKey::Deny => Ok(0x0F),
        }
    }
}

/// The four access-rights nibbles of a file, packed on the wire as
/// `(RW << 4) | CAR` followed by `(R << 4) | W`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct AccessRights {
    pub read: AccessKey,
    pub write: AccessKey,
    pub read_write: AccessKey,
    pub change_access: AccessKey,
}

impl AccessRights {
    pub fn new(read: AccessKey, write: AccessKey, read_write: AccessKey, change_access: AccessKey) -> Self {
        AccessRights {
            read,
            write,
            read_write,
            change_access,
        }
    }
}

impl Serializable for AccessRights {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        let ar1 = cursor.read_u8()?;
        let ar2 = cursor.read_u8()?;

        Ok(AccessRights {
            read: AccessKey::from_nibble(ar2 >> 4),
            write: AccessKey::from_nibble(ar2),
            read_write: AccessKey::from_nibble(ar1 >> 4),
            change_access: AccessKey::from_nibble(ar1),
        })
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> NfcResult<()> {
        let ar1 = (self.read_write.to_nibble()? << 4) | self.change_access.to_nibble()?;
        let ar2 = (self.read.to_nibble()? << 4) | self.write.to_nibble()?;

        bytes.write_u8(ar1)?;
        bytes.write_u8(ar2)?;
        Ok(())
    }
}

/// Which key may change keys within the selected application (high nibble of
/// the key-settings byte).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChangeKeyAccess {
    Key(u8),
    SameKey,
    Frozen,
}

impl ChangeKeyAccess {
    fn from_high_nibble(byte: u8) -> ChangeKeyAccess {
        match byte >> 4 {
            0x0E => ChangeKeyAccess::SameKey,
            0x0F => ChangeKeyAccess::Frozen,
            n => ChangeKeyAccess::Key(n),
        }
    }

    fn to_high_nibble(self) -> NfcResult<u8> {
        match self {
            ChangeKeyAccess::Key(n) if n <= 0x0D => Ok(n << 4),
            ChangeKeyAccess::Key(_) => Err(NfcError::InvalidArgument),
            ChangeKeyAccess::SameKey => Ok(0xE0),
            ChangeKeyAccess::Frozen => Ok(0xF0),
        }
    }
}

/// Master key settings of the PICC or of an application.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct KeySettings {
    pub change_key_access: ChangeKeyAccess,
    pub settings_changeable: bool,
    pub create_delete_without_master_key: bool,
    pub directory_access_without_master_key: bool,
    pub master_key_changeable: bool,
}

impl Serializable for KeySettings {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        let data = cursor.read_u8()?;

        Ok(KeySettings {
            change_key_access: ChangeKeyAccess::from_high_nibble(data),
            settings_changeable: data & 0x08 == 0x08,
            create_delete_without_master_key: data & 0x04 == 0x04,
            directory_access_without_master_key: data & 0x02 == 0x02,
            master_key_changeable: data & 0x01 == 0x01,
        })
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> NfcResult<()> {
        let mut data = self.change_key_access.to_high_nibble()?;
        if self.settings_changeable {
            data |= 0x08;
        }
        if self.create_delete_without_master_key {
            data |= 0x04;
        }
        if self.directory_access_without_master_key {
            data |= 0x02;
        }
        if self.master_key_changeable {
            data |= 0x01;
        }

        bytes.write_u8(data)?;
        Ok(())
    }
}

/// Parsed `GetFileSettings` response.
#[derive(Debug)]
pub enum FileSettings {
    DataFile {
        communication: CommunicationSetting,
        access_rights: AccessRights,
        file_size: u32,
    },
    ValueFile {
        communication: CommunicationSetting,
        access_rights: AccessRights,
        lower_limit: i32,
        upper_limit: i32,
        limited_credit_value: i32,
        limited_credit_enabled: bool,
    },
    RecordFile {
        communication: CommunicationSetting,
        access_rights: AccessRights,
        record_size: u32,
        max_records: u32,
        current_records: u32,
    },
}

impl FileSettings {
    fn data_file_from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        Ok(FileSettings::DataFile {
            communication: CommunicationSetting::from_bytes(cursor)?,
            access_rights: AccessRights::from_bytes(cursor)?,
            file_size: cursor.read_u24::<LittleEndian>()?,
        })
    }

    fn value_file_from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        Ok(FileSettings::ValueFile {
            communication: CommunicationSetting::from_bytes(cursor)?,
            access_rights: AccessRights::from_bytes(cursor)?,
            lower_limit: cursor.read_i32::<LittleEndian>()?,
            upper_limit: cursor.read_i32::<LittleEndian>()?,
            limited_credit_value: cursor.read_i32::<LittleEndian>()?,
            limited_credit_enabled: cursor.read_u8()? != 0x00,
        })
    }

    fn record_file_from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        Ok(FileSettings::RecordFile {
            communication: CommunicationSetting::from_bytes(cursor)?,
            access_rights: AccessRights::from_bytes(cursor)?,
            record_size: cursor.read_u24::<LittleEndian>()?,
            max_records: cursor.read_u24::<LittleEndian>()?,
            current_records: cursor.read_u24::<LittleEndian>()?,
        })
    }
}

impl Serializable for FileSettings {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        match cursor.read_u8()? {
            0x00 | 0x01 => FileSettings::data_file_from_bytes(cursor),
            0x02 => FileSettings::value_file_from_bytes(cursor),
            0x03 | 0x04 => FileSettings::record_file_from_bytes(cursor),
            _ => Err(NfcError::ByteParse),
        }
    }
}

#[derive(Debug)]
pub struct VersionInformation {
    pub vendor_id: u8,
    pub card_type: u8,
    pub card_subtype: u8,
    pub major: u8,
    pub minor: u8,
    pub storage_size: u8,
    pub communication_protocol: u8,
}

impl Serializable for VersionInformation {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        Ok(VersionInformation {
            vendor_id: cursor.read_u8()?,
            card_type: cursor.read_u8()?,
            card_subtype: cursor.read_u8()?,
            major: cursor.read_u8()?,
            minor: cursor.read_u8()?,
            storage_size: cursor.read_u8()?,
            communication_protocol: cursor.read_u8()?,
        })
    }
}

/// Manufacturing data returned by `GetVersion` (three frames, 28 bytes).
#[derive(Debug)]
pub struct Version {
    pub hardware: VersionInformation,
    pub software: VersionInformation,
    pub uid: [u8; 7],
    pub batch_nr: [u8; 5],
    pub calendar_week_of_production: u8,
    pub year_of_production: u8,
}

impl Serializable for Version {
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        let hardware = VersionInformation::from_bytes(cursor)?;
        let software = VersionInformation::from_bytes(cursor)?;

        let mut uid = [0u8; 7];
        cursor.read_exact(&mut uid)?;
        let mut batch_nr = [0u8; 5];
        cursor.read_exact(&mut batch_nr)?;

        Ok(Version {
            hardware,
            software,
            uid,
            batch_nr,
            calendar_week_of_production: cursor.read_u8()?,
            year_of_production: cursor.read_u8()?,
        })
    }
}
