//! RN2483 command protocol.
//!
//! The module speaks ASCII lines: every command is terminated by `\r\n` and
//! is answered with one line (some commands with a second, later one). This
//! module holds the command vocabulary, the ordered provisioning steps, the
//! classification of reply lines, and the codec that frames lines on the
//! serial stream.
//!
//! Command reference: Microchip RN2483 LoRa Technology Module Command
//! Reference User's Guide (DS40001784).

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::credentials::{DevAddr, SessionKey, REDACTED};

/// Line terminator expected by the module.
pub const LINE_ENDING: &[u8] = b"\r\n";

/// Longest reply line accepted before the stream is considered garbage.
pub const MAX_LINE_LENGTH: usize = 256;

/// Plain acknowledgment.
pub const OK: &str = "ok";

/// Replies the module uses to refuse a command or report a failure.
pub const ERROR_REPLIES: &[&str] = &[
    "invalid_param",
    "err",
    "busy",
    "denied",
    "not_joined",
    "keys_not_init",
    "no_free_ch",
    "silent",
    "frame_counter_err_rejoin_needed",
    "mac_paused",
    "invalid_data_len",
    "mac_err",
    "no_channel",
    "radio_err",
];

/// The provisioning steps, in the order they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum Step {
    #[strum(serialize = "factory reset")]
    FactoryReset,
    #[strum(serialize = "set devaddr")]
    SetDevAddr,
    #[strum(serialize = "set appskey")]
    SetAppSKey,
    #[strum(serialize = "set nwkskey")]
    SetNwkSKey,
    #[strum(serialize = "disable adr")]
    DisableAdr,
    #[strum(serialize = "save")]
    Save,
}

impl Step {
    /// 1-based position in the sequence, as reported to the operator.
    pub fn number(self) -> usize {
        self as usize + 1
    }
}

/// What a command must get back to count as acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Exactly `ok`.
    Ok,
    /// Any line that is not an error reply. `sys factoryRESET` answers
    /// with the firmware banner once the module has rebooted.
    AnyLine,
}

/// One command line, with a copy of its text safe to log.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    redacted: String,
    expect: Expect,
}

impl Command {
    fn plain(text: impl Into<String>, expect: Expect) -> Self {
        let text = text.into();
        Self {
            redacted: text.clone(),
            text,
            expect,
        }
    }

    fn secret(prefix: &str, key: &SessionKey) -> Self {
        Self {
            text: format!("{} {}", prefix, key.to_hex()),
            redacted: format!("{} {}", prefix, REDACTED),
            expect: Expect::Ok,
        }
    }

    pub fn factory_reset() -> Self {
        Self::plain("sys factoryRESET", Expect::AnyLine)
    }

    pub fn get_version() -> Self {
        Self::plain("sys get ver", Expect::AnyLine)
    }

    pub fn set_devaddr(addr: DevAddr) -> Self {
        Self::plain(format!("mac set devaddr {}", addr), Expect::Ok)
    }

    pub fn set_appskey(key: &SessionKey) -> Self {
        Self::secret("mac set appskey", key)
    }

    pub fn set_nwkskey(key: &SessionKey) -> Self {
        Self::secret("mac set nwkskey", key)
    }

    pub fn set_adr(on: bool) -> Self {
        Self::plain(
            format!("mac set adr {}", if on { "on" } else { "off" }),
            Expect::Ok,
        )
    }

    pub fn save() -> Self {
        Self::plain("mac save", Expect::Ok)
    }

    pub fn join_abp() -> Self {
        Self::plain("mac join abp", Expect::Ok)
    }

    /// Unconfirmed uplink of `payload` on LoRaWAN application `port`.
    pub fn tx_uncnf(port: u8, payload: &[u8]) -> Self {
        Self::plain(
            format!("mac tx uncnf {} {}", port, hex::encode_upper(payload)),
            Expect::Ok,
        )
    }

    /// The exact text written to the module.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The text with any key material replaced.
    pub fn redacted(&self) -> &str {
        &self.redacted
    }

    pub fn expect(&self) -> Expect {
        self.expect
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.redacted)
            .field("expect", &self.expect)
            .finish()
    }
}

/// A reply line sorted into what it means for the command that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error(String),
    Other(String),
}

impl Reply {
    pub fn classify(line: &str) -> Self {
        let line = line.trim();
        if line == OK {
            Reply::Ok
        } else if ERROR_REPLIES.contains(&line) {
            Reply::Error(line.to_string())
        } else {
            Reply::Other(line.to_string())
        }
    }

    /// Whether this reply acknowledges a command expecting `expect`.
    pub fn satisfies(&self, expect: Expect) -> bool {
        match (self, expect) {
            (Reply::Error(_), _) => false,
            (Reply::Ok, _) => true,
            (Reply::Other(_), Expect::AnyLine) => true,
            (Reply::Other(_), Expect::Ok) => false,
        }
    }
}

/// Frames outgoing lines with `\r\n` and splits incoming bytes into lines.
///
/// Incoming lines may end in `\r\n` or a bare `\n`; the terminator is
/// stripped.
#[derive(Debug)]
pub struct LineCodec {
    lines: LinesCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("reply longer than {} bytes", MAX_LINE_LENGTH),
        ),
        LinesCodecError::Io(e) => e,
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.lines.decode(src).map_err(lines_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.lines.decode_eof(src).map_err(lines_error)
    }
}

impl<'a> Encoder<&'a str> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: &'a str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.contains(['\r', '\n']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command contains a line break",
            ));
        }
        dst.reserve(line.len() + LINE_ENDING.len());
        dst.put_slice(line.as_bytes());
        dst.put_slice(LINE_ENDING);
        Ok(())
    }
}

/// The fixed provisioning table: each step with the command that performs it.
///
/// Steps whose key is absent have no command and are skipped.
pub fn provisioning_commands(
    creds: &crate::credentials::DeviceCredentials,
) -> Vec<(Step, Option<Command>)> {
    use strum::IntoEnumIterator;

    Step::iter()
        .map(|step| {
            let command = match step {
                Step::FactoryReset => Some(Command::factory_reset()),
                Step::SetDevAddr => Some(Command::set_devaddr(creds.devaddr)),
                Step::SetAppSKey => creds.appskey.as_ref().map(Command::set_appskey),
                Step::SetNwkSKey => creds.nwkskey.as_ref().map(Command::set_nwkskey),
                Step::DisableAdr => Some(Command::set_adr(false)),
                Step::Save => Some(Command::save()),
            };
            (step, command)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::DeviceCredentials;
    use test_case::test_case;

    const APPSKEY: &str = "00112233445566778899AABBCCDDEEFF";
    const NWKSKEY: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF";

    #[test]
    fn sequence_is_fixed() {
        let creds = DeviceCredentials::parse("02011100", APPSKEY, NWKSKEY).unwrap();
        let table = provisioning_commands(&creds);
        let texts: Vec<&str> = table
            .iter()
            .map(|(_, cmd)| cmd.as_ref().unwrap().text())
            .collect();
        assert_eq!(
            texts,
            [
                "sys factoryRESET",
                "mac set devaddr 02011100",
                "mac set appskey 00112233445566778899AABBCCDDEEFF",
                "mac set nwkskey FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
                "mac set adr off",
                "mac save",
            ]
        );
        let numbers: Vec<usize> = table.iter().map(|(step, _)| step.number()).collect();
        assert_eq!(numbers, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn absent_keys_have_no_command() {
        let creds = DeviceCredentials::parse("02011100", "", NWKSKEY).unwrap();
        let table = provisioning_commands(&creds);
        assert_eq!(table.len(), 6);
        assert_eq!(table[2].0, Step::SetAppSKey);
        assert!(table[2].1.is_none());
        assert!(table[3].1.is_some());
    }

    #[test]
    fn key_commands_are_redacted() {
        let creds = DeviceCredentials::parse("02011100", APPSKEY, NWKSKEY).unwrap();
        let cmd = Command::set_appskey(creds.appskey.as_ref().unwrap());
        assert!(cmd.text().ends_with(APPSKEY));
        assert!(!cmd.to_string().contains(APPSKEY));
        assert!(!format!("{:?}", cmd).contains(APPSKEY));
        assert_eq!(cmd.redacted(), format!("mac set appskey {}", REDACTED));
    }

    #[test]
    fn tx_payload_is_hex() {
        let cmd = Command::tx_uncnf(1, &[0x7f, 0x11, 0xab]);
        assert_eq!(cmd.text(), "mac tx uncnf 1 7F11AB");
    }

    #[test]
    fn step_names() {
        assert_eq!(Step::FactoryReset.to_string(), "factory reset");
        assert_eq!(Step::SetAppSKey.to_string(), "set appskey");
        assert_eq!(Step::Save.number(), 6);
    }

    #[test_case("ok", Reply::Ok ; "ok")]
    #[test_case("ok\r", Reply::Ok ; "ok with stray cr")]
    #[test_case("invalid_param", Reply::Error("invalid_param".into()) ; "invalid param")]
    #[test_case("keys_not_init", Reply::Error("keys_not_init".into()) ; "keys not init")]
    #[test_case("RN2483 1.0.5 Oct 31 2018 15:06:52", Reply::Other("RN2483 1.0.5 Oct 31 2018 15:06:52".into()) ; "banner")]
    fn classify(line: &str, expected: Reply) {
        assert_eq!(Reply::classify(line), expected);
    }

    #[test]
    fn every_error_reply_is_rejected() {
        for code in ERROR_REPLIES {
            let reply = Reply::classify(code);
            assert!(!reply.satisfies(Expect::Ok), "{} accepted", code);
            assert!(!reply.satisfies(Expect::AnyLine), "{} accepted", code);
        }
    }

    #[test]
    fn banner_only_satisfies_any_line() {
        let reply = Reply::classify("RN2483 1.0.5");
        assert!(reply.satisfies(Expect::AnyLine));
        assert!(!reply.satisfies(Expect::Ok));
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("mac save", &mut buf).unwrap();
        assert_eq!(&buf[..], b"mac save\r\n");
    }

    #[test]
    fn refuses_embedded_line_break() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.encode("mac save\r\nsys reset", &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_crlf_and_lf() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"ok\r\ninvalid_param\nmac_t"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ok"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("invalid_param"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"x_ok\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("mac_tx_ok"));
    }

    #[test]
    fn overlong_reply_is_an_error() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&[b'a'; MAX_LINE_LENGTH + 1][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
