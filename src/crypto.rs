//! Cipher, MAC and checksum primitives used by the DESFire EV1 and
//! Ultralight C protocols.
//!
//! All functions are pure: keys, IVs and data go in, bytes come out. Session
//! state (IV threading) is handled by the callers.

use aes::Aes128;
use block_modes::block_padding::NoPadding;
use block_modes::{BlockMode, Cbc};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, NewBlockCipher};
use des::TdesEde3;

use crate::errors::{NfcError, NfcResult};

pub const DES_BLOCK_SIZE: usize = 8;
pub const AES_BLOCK_SIZE: usize = 16;

type TdesCbc = Cbc<TdesEde3, NoPadding>;
type AesCbc = Cbc<Aes128, NoPadding>;

/// Expand an 8/16/24-byte DES family key to the 24-byte EDE3 form:
/// K1||K1||K1 for single DES, K1||K2||K1 for two-key 3DES.
fn tdes_key24(key: &[u8]) -> NfcResult<[u8; 24]> {
    let mut k = [0u8; 24];
    match key.len() {
        8 => {
            k[0..8].copy_from_slice(key);
            k[8..16].copy_from_slice(key);
            k[16..24].copy_from_slice(key);
        }
        16 => {
            k[0..16].copy_from_slice(key);
            k[16..24].copy_from_slice(&key[0..8]);
        }
        24 => k.copy_from_slice(key),
        _ => return Err(NfcError::InvalidArgument),
    }
    Ok(k)
}

/// Append zeros until `data` is a multiple of `block_size`.
pub fn zero_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut v = data.to_vec();
    while v.len() % block_size != 0 {
        v.push(0x00);
    }
    v
}

/// Rotate one byte to the left: `a[1..] || a[0]`.
pub fn rotate_left(a: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(a.len());
    ret.extend_from_slice(&a[1..]);
    ret.push(a[0]);
    ret
}

pub fn generate_nonce(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub fn tdes_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    if data.len() % DES_BLOCK_SIZE != 0 {
        return Err(NfcError::InvalidArgument);
    }
    let key = tdes_key24(key)?;
    let cipher = TdesCbc::new_from_slices(&key, iv)?;
    Ok(cipher.encrypt_vec(data))
}

pub fn tdes_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let key = tdes_key24(key)?;
    let cipher = TdesCbc::new_from_slices(&key, iv)?;
    Ok(cipher.decrypt_vec(data)?)
}

pub fn aes_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(NfcError::InvalidArgument);
    }
    let cipher = AesCbc::new_from_slices(key, iv)?;
    Ok(cipher.encrypt_vec(data))
}

pub fn aes_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let cipher = AesCbc::new_from_slices(key, iv)?;
    Ok(cipher.decrypt_vec(data)?)
}

/// MF3ICD40 send mode: XOR each block with the previous ciphered block, then
/// run the cipher in decrypt direction. The PCD enciphers by decrypting on
/// this path; the IV is all zeros and is reset for every operation.
pub fn des_send(key: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let cipher = raw_tdes(key)?;
    if data.len() % DES_BLOCK_SIZE != 0 {
        return Err(NfcError::InvalidArgument);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut prev = [0u8; DES_BLOCK_SIZE];
    for chunk in data.chunks(DES_BLOCK_SIZE) {
        let mut block = [0u8; DES_BLOCK_SIZE];
        for (i, b) in chunk.iter().enumerate() {
            block[i] = b ^ prev[i];
        }
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        prev = block;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// MF3ICD40 receive mode: run the cipher in decrypt direction, then XOR with
/// the previous input block (zero IV, reset per operation).
pub fn des_receive(key: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let cipher = raw_tdes(key)?;
    if data.len() % DES_BLOCK_SIZE != 0 {
        return Err(NfcError::InvalidArgument);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut prev = [0u8; DES_BLOCK_SIZE];
    for chunk in data.chunks(DES_BLOCK_SIZE) {
        let mut block = [0u8; DES_BLOCK_SIZE];
        block.copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        for (i, b) in chunk.iter().enumerate() {
            block[i] ^= prev[i];
            prev[i] = *b;
        }
        out.extend_from_slice(&block);
    }
    Ok(out)
}

fn raw_tdes(key: &[u8]) -> NfcResult<TdesEde3> {
    let key = tdes_key24(key)?;
    TdesEde3::new_from_slice(&key).map_err(|_| NfcError::InvalidArgument)
}

/// Legacy 4-byte MAC for DES/2K3DES sessions: 3DES-CBC over the zero-padded
/// data with a zero IV, taking the first 4 bytes of the last block.
pub fn retail_mac(key: &[u8], data: &[u8]) -> NfcResult<[u8; 4]> {
    let mut padded = zero_pad(data, DES_BLOCK_SIZE);
    if padded.is_empty() {
        padded = vec![0u8; DES_BLOCK_SIZE];
    }

    let ciphertext = tdes_encrypt(key, &[0u8; DES_BLOCK_SIZE], &padded)?;
    let index = ciphertext.len() - DES_BLOCK_SIZE;

    Ok([
        ciphertext[index],
        ciphertext[index + 1],
        ciphertext[index + 2],
        ciphertext[index + 3],
    ])
}

/// CMAC (RFC 4493) with AES-128, chained from an explicit IV.
/// Returns the full 16-byte tag.
pub fn cmac_aes(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| NfcError::InvalidArgument)?;
    let encrypt = |block: &mut [u8]| {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    };
    Ok(cmac_core(AES_BLOCK_SIZE, 0x87, iv, data, &encrypt))
}

/// CMAC with three-key 3DES (24-byte session key), chained from an explicit
/// IV. Returns the full 8-byte tag.
pub fn cmac_tdes(key: &[u8], iv: &[u8], data: &[u8]) -> NfcResult<Vec<u8>> {
    let cipher = raw_tdes(key)?;
    let encrypt = |block: &mut [u8]| {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    };
    Ok(cmac_core(DES_BLOCK_SIZE, 0x1B, iv, data, &encrypt))
}

/// Subkey doubling in GF(2^n): shift left one bit, conditionally XOR the
/// field constant into the last byte.
fn dbl(block: &mut [u8], rb: u8) {
    let carry = block[0] & 0x80 != 0;
    for i in 0..block.len() {
        block[i] <<= 1;
        if i + 1 < block.len() && block[i + 1] & 0x80 != 0 {
            block[i] |= 0x01;
        }
    }
    if carry {
        let last = block.len() - 1;
        block[last] ^= rb;
    }
}

fn cmac_core(
    block_size: usize,
    rb: u8,
    iv: &[u8],
    data: &[u8],
    encrypt: &dyn Fn(&mut [u8]),
) -> Vec<u8> {
    let mut k1 = vec![0u8; block_size];
    encrypt(&mut k1);
    dbl(&mut k1, rb);
    let mut k2 = k1.clone();
    dbl(&mut k2, rb);

    let mut message = data.to_vec();
    let complete = !message.is_empty() && message.len() % block_size == 0;
    if !complete {
        message.push(0x80);
        while message.len() % block_size != 0 {
            message.push(0x00);
        }
    }
    let subkey = if complete { &k1 } else { &k2 };
    let last = message.len() - block_size;
    for i in 0..block_size {
        message[last + i] ^= subkey[i];
    }

    let mut prev = iv.to_vec();
    for chunk in message.chunks(block_size) {
        for i in 0..block_size {
            prev[i] ^= chunk[i];
        }
        encrypt(&mut prev);
    }
    prev
}

/// CRC as used by DESFire for DES/2K3DES sessions (ISO/IEC 13239 variant,
/// polynomial 0x8408, initial value 0x6363, little-endian result).
#[allow(non_snake_case)]
pub fn crc16(value: &[u8]) -> [u8; 2] {
    let mut wCrc: u32 = 0x6363;
    for b in value {
        let br = ((wCrc & 0xFF) as u8) ^ b;
        let br = br ^ (br << 4);
        let br_long = br as u32;
        wCrc = (wCrc >> 8) ^ (br_long << 8) ^ (br_long << 3) ^ (br_long >> 4);
    }

    [(wCrc & 0xFF) as u8, ((wCrc >> 8) & 0xFF) as u8]
}

/// CRC as used by DESFire for 3K3DES/AES sessions: reflected 0xEDB88320,
/// initial value 0xFFFFFFFF, no final XOR, little-endian result.
pub fn crc32(value: &[u8]) -> [u8; 4] {
    let mut crc: u32 = 0xFFFF_FFFF;
    for b in value {
        crc ^= *b as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.to_le_bytes()
}

#[test]
pub fn crc16_vectors() {
    let crc = crc16(&hex!("00 00"));
    assert_eq!(crc, hex!("A0 1E"));

    let crc = crc16(&hex!("12 34"));
    assert_eq!(crc, hex!("26 CF"));
}

#[test]
pub fn crc32_vector() {
    let crc = crc32(b"123456789");
    assert_eq!(crc, hex!("D9 C6 0B 34"));
}

#[test]
pub fn aes_cmac_rfc4493_vectors() {
    let key = hex!("2b7e1516 28aed2a6 abf71588 09cf4f3c");
    let iv = [0u8; 16];

    let tag = cmac_aes(&key, &iv, &[]).unwrap();
    assert_eq!(tag, hex!("bb1d6929 e9593728 7fa37d12 9b756746"));

    let tag = cmac_aes(&key, &iv, &hex!("6bc1bee2 2e409f96 e93d7e11 7393172a")).unwrap();
    assert_eq!(tag, hex!("070a16b4 6b4d4144 f79bdd9d d04a287c"));

    let m40 = hex!(
        "6bc1bee2 2e409f96 e93d7e11 7393172a
         ae2d8a57 1e03ac9c 9eb76fac 45af8e51
         30c81c46 a35ce411"
    );
    let tag = cmac_aes(&key, &iv, &m40).unwrap();
    assert_eq!(tag, hex!("dfa66747 de9ae630 30ca3261 1497c827"));
}

#[test]
pub fn aes_cmac_iv_chains_into_first_block() {
    // A chained CMAC equals the zero-IV CMAC of the message with the IV
    // XORed into its first (complete) block.
    let key = hex!("2b7e1516 28aed2a6 abf71588 09cf4f3c");
    let iv = hex!("000102030405060708090a0b0c0d0e0f");
    let message = hex!(
        "6bc1bee2 2e409f96 e93d7e11 7393172a
         ae2d8a57 1e03ac9c 9eb76fac 45af8e51"
    );

    let chained = cmac_aes(&key, &iv, &message).unwrap();

    let mut mixed = message;
    for i in 0..16 {
        mixed[i] ^= iv[i];
    }
    let plain = cmac_aes(&key, &[0u8; 16], &mixed).unwrap();

    assert_eq!(chained, plain);
}

#[test]
pub fn aes_cbc_nist_vector() {
    let key = hex!("2b7e1516 28aed2a6 abf71588 09cf4f3c");
    let iv = hex!("00010203 04050607 08090a0b 0c0d0e0f");
    let plaintext = hex!(
        "6bc1bee2 2e409f96 e93d7e11 7393172a
         ae2d8a57 1e03ac9c 9eb76fac 45af8e51"
    );
    let expected = hex!(
        "7649abac 8119b246 cee98e9b 12e9197d
         5086cb9b 507219ee 95db113a 917678b2"
    );

    let ciphertext = aes_encrypt(&key, &iv, &plaintext).unwrap();
    assert_eq!(ciphertext, expected.to_vec());
    assert_eq!(aes_decrypt(&key, &iv, &ciphertext).unwrap(), plaintext.to_vec());
}

#[test]
pub fn single_des_known_answer() {
    // An 8-byte key expands to K1||K1||K1, degenerating EDE3 to single DES.
    let key = hex!("01 01 01 01 01 01 01 01");
    let ciphertext = tdes_encrypt(&key, &[0u8; 8], &[0u8; 8]).unwrap();
    assert_eq!(ciphertext, hex!("8C A6 4D E9 C1 B1 23 A7").to_vec());
}

#[test]
pub fn des_receive_is_cbc_decryption() {
    let key = hex!("00 11 22 33 44 55 66 77 88 99 AA BB CC DD EE FF");
    let data = hex!("DE AD BE EF 00 11 22 33 99 88 77 66 55 44 33 22");

    let received = des_receive(&key, &data).unwrap();
    let reference = tdes_decrypt(&key, &[0u8; 8], &data).unwrap();
    assert_eq!(received, reference);
}

#[test]
pub fn des_send_decrypts_each_block() {
    // A single send-mode block is the raw decryption of that block, so
    // re-encrypting it must give back the input.
    let key = hex!("00 11 22 33 44 55 66 77 88 99 AA BB CC DD EE FF");
    let block = hex!("01 23 45 67 89 AB CD EF");

    let sent = des_send(&key, &block).unwrap();
    let restored = tdes_encrypt(&key, &[0u8; 8], &sent).unwrap();
    assert_eq!(restored, block.to_vec());
}

#[test]
pub fn retail_mac_is_last_block_prefix() {
    let key = hex!("00 11 22 33 44 55 66 77 88 99 AA BB CC DD EE FF");
    let data = hex!("01 02 03 04 05");

    let mac = retail_mac(&key, &data).unwrap();
    let ciphertext = tdes_encrypt(&key, &[0u8; 8], &zero_pad(&data, 8)).unwrap();
    assert_eq!(mac, ciphertext[ciphertext.len() - 8..ciphertext.len() - 4]);
}
