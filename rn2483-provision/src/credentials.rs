//! ABP credentials written to the module.
//!
//! All values are checked when constructed, so a `DeviceCredentials` that
//! exists is one the module will accept: an 8 digit hex device address and
//! session keys that are either absent or exactly 32 hex digits.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length in hex digits of a device address.
pub const DEVADDR_HEX_LEN: usize = 8;

/// Length in hex digits of a session key (16 bytes).
pub const SESSION_KEY_HEX_LEN: usize = 32;

/// Which credential failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Field {
    #[strum(serialize = "devaddr")]
    DevAddr,
    #[strum(serialize = "appskey")]
    AppSKey,
    #[strum(serialize = "nwkskey")]
    NwkSKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("{field} must be {expected} hex digits, got {actual}")]
    Length {
        field: Field,
        expected: usize,
        actual: usize,
    },
    #[error("{field} contains a non-hex character")]
    NotHex { field: Field },
    #[error("devaddr is required")]
    MissingDevAddr,
}

fn check_hex(field: Field, text: &str, expected: usize) -> Result<Vec<u8>, CredentialError> {
    if text.len() != expected {
        return Err(CredentialError::Length {
            field,
            expected,
            actual: text.len(),
        });
    }
    hex::decode(text).map_err(|_| CredentialError::NotHex { field })
}

/// 32-bit LoRaWAN device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevAddr(u32);

impl DevAddr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl FromStr for DevAddr {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = check_hex(Field::DevAddr, s.trim(), DEVADDR_HEX_LEN)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes);
        Ok(Self(u32::from_be_bytes(word)))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// 128-bit AES session key.
///
/// `Debug` and `Display` never print the key material; use
/// [`SessionKey::to_hex`] to get the wire form.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 16]);

impl SessionKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    fn parse(field: Field, s: &str) -> Result<Self, CredentialError> {
        let bytes = check_hex(field, s.trim(), SESSION_KEY_HEX_LEN)?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Upper-case hex, as the module expects it.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Placeholder printed in place of key material.
pub const REDACTED: &str = "********************************";

/// Everything written to the module during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub devaddr: DevAddr,
    pub appskey: Option<SessionKey>,
    pub nwkskey: Option<SessionKey>,
}

impl DeviceCredentials {
    /// Validate credentials given as hex text.
    ///
    /// Empty (or all-whitespace) keys are treated as absent.
    pub fn parse(devaddr: &str, appskey: &str, nwkskey: &str) -> Result<Self, CredentialError> {
        if devaddr.trim().is_empty() {
            return Err(CredentialError::MissingDevAddr);
        }
        Ok(Self {
            devaddr: devaddr.parse()?,
            appskey: optional_key(Field::AppSKey, appskey)?,
            nwkskey: optional_key(Field::NwkSKey, nwkskey)?,
        })
    }
}

fn optional_key(field: Field, text: &str) -> Result<Option<SessionKey>, CredentialError> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        SessionKey::parse(field, text).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const APPSKEY: &str = "00112233445566778899AABBCCDDEEFF";
    const NWKSKEY: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF";

    #[test]
    fn parses_full_credentials() {
        let creds = DeviceCredentials::parse("02011100", APPSKEY, NWKSKEY).unwrap();
        assert_eq!(creds.devaddr.value(), 0x0201_1100);
        assert_eq!(creds.devaddr.to_string(), "02011100");
        assert_eq!(creds.appskey.unwrap().to_hex(), APPSKEY);
        assert_eq!(creds.nwkskey.unwrap().as_bytes(), &[0xff; 16]);
    }

    #[test]
    fn lower_case_hex_is_normalized() {
        let creds = DeviceCredentials::parse("0201abcd", &APPSKEY.to_lowercase(), "").unwrap();
        assert_eq!(creds.devaddr.to_string(), "0201ABCD");
        assert_eq!(creds.appskey.unwrap().to_hex(), APPSKEY);
    }

    #[test]
    fn empty_keys_are_absent() {
        let creds = DeviceCredentials::parse("02011100", "", "  ").unwrap();
        assert!(creds.appskey.is_none());
        assert!(creds.nwkskey.is_none());
    }

    #[test_case("0201110" ; "too short")]
    #[test_case("020111000" ; "too long")]
    fn devaddr_length_rejected(devaddr: &str) {
        let err = DeviceCredentials::parse(devaddr, APPSKEY, NWKSKEY).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Length { field: Field::DevAddr, expected: 8, .. }
        ));
    }

    #[test]
    fn devaddr_template_rejected() {
        // The block address with its placeholder still in it.
        let err = DeviceCredentials::parse("020111xx", APPSKEY, NWKSKEY).unwrap_err();
        assert_eq!(err, CredentialError::NotHex { field: Field::DevAddr });
    }

    #[test]
    fn missing_devaddr_rejected() {
        assert_eq!(
            DeviceCredentials::parse("", APPSKEY, NWKSKEY).unwrap_err(),
            CredentialError::MissingDevAddr
        );
    }

    #[test_case(&APPSKEY[..31], "" ; "appskey short")]
    #[test_case("", "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF" ; "nwkskey long")]
    fn key_length_rejected(appskey: &str, nwkskey: &str) {
        let err = DeviceCredentials::parse("02011100", appskey, nwkskey).unwrap_err();
        assert!(matches!(err, CredentialError::Length { expected: 32, .. }));
    }

    #[test]
    fn non_hex_key_rejected() {
        let key = "G0112233445566778899AABBCCDDEEFF";
        let err = DeviceCredentials::parse("02011100", "", key).unwrap_err();
        assert_eq!(err, CredentialError::NotHex { field: Field::NwkSKey });
        assert_eq!(err.to_string(), "nwkskey contains a non-hex character");
    }

    #[test]
    fn keys_are_redacted() {
        let creds = DeviceCredentials::parse("02011100", APPSKEY, NWKSKEY).unwrap();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains(APPSKEY));
        assert!(!debug.contains(NWKSKEY));
        assert!(debug.contains("redacted"));
        assert_eq!(creds.appskey.unwrap().to_string(), REDACTED);
    }
}
