use std::io::Cursor;

use crate::errors::{NfcError, NfcResult};

pub fn bytes_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|x| format!("{:02X}", x))
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn str_to_bytes(s: &str) -> Vec<u8> {
    s.split(' ')
        .map(|x| u8::from_str_radix(x, 16).unwrap_or(0))
        .collect()
}

/// Conversion between wire bytes and typed card structures.
///
/// Implementors provide the direction(s) that make sense for them; the
/// missing direction reports a parse error.
pub trait Serializable
where
    Self: std::marker::Sized,
{
    fn from_bytes(cursor: &mut Cursor<&[u8]>) -> NfcResult<Self> {
        let _ = cursor;
        Err(NfcError::ByteParse)
    }

    fn to_bytes(&self, bytes: &mut Vec<u8>) -> NfcResult<()> {
        let _ = bytes;
        Err(NfcError::ByteParse)
    }

    fn from_byte(byte: u8) -> NfcResult<Self> {
        let bytes = &[byte];
        Self::from_bytes(&mut Cursor::new(bytes))
    }

    fn to_byte(&self) -> NfcResult<u8> {
        let mut bytes: Vec<u8> = Vec::new();

        self.to_bytes(&mut bytes)?;

        if bytes.len() != 1 {
            Err(NfcError::ByteParse)
        } else {
            Ok(bytes[0])
        }
    }

    fn from_slice(bytes: &[u8]) -> NfcResult<Self> {
        Self::from_bytes(&mut Cursor::new(bytes))
    }

    fn to_vec(&self) -> NfcResult<Vec<u8>> {
        let mut bytes: Vec<u8> = Vec::new();

        self.to_bytes(&mut bytes)?;

        Ok(bytes)
    }
}

#[test]
fn hex_string_round_trip() {
    let bytes = hex!("90 5A 00 00 03 C0 FF EE 00");
    let s = bytes_to_string(&bytes);
    assert_eq!(s, "90 5A 00 00 03 C0 FF EE 00");
    assert_eq!(str_to_bytes(&s), bytes.to_vec());
}
