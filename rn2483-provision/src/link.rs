//! Line-oriented link to the module.
//!
//! [`connect`] opens the serial port; [`ModuleLink`] wraps any byte stream
//! (the serial port, or an in-memory pipe to the simulator) and performs the
//! one-line-out / one-line-in exchanges the module understands. Every read
//! is bounded by a timeout so a silent module cannot hang the program.

use futures::SinkExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::config::ConnectionConfig;
use crate::error::{CommandError, Error, Result};
use crate::protocol::{Command, LineCodec, Reply};
use crate::tracing::prelude::*;

/// Open the serial port described by `config` (8N1, no flow control).
pub fn connect(config: &ConnectionConfig) -> Result<SerialStream> {
    debug!(port = %config.port, baud = config.baud, "Opening serial port");
    tokio_serial::new(&config.port, config.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|source| Error::Connection {
            port: config.port.clone(),
            source,
        })
}

/// Whether `line` is the banner the module is expected to print.
///
/// The banner carries the firmware version and build date after the
/// module name, so only the prefix is compared.
pub fn matches_banner(line: &str, expected: &str) -> bool {
    line.trim().starts_with(expected.trim())
}

/// Command/reply link over a byte stream.
pub struct ModuleLink<T> {
    framed: Framed<T, LineCodec>,
    timeout: Duration,
}

impl<T> ModuleLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `stream`; `timeout` bounds every wait for a reply line.
    pub fn new(stream: T, timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, LineCodec::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write one line, terminated with `\r\n`.
    pub async fn write_line(&mut self, line: &str) -> std::result::Result<(), CommandError> {
        time::timeout(self.timeout, self.framed.send(line))
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Read the next non-blank line, waiting at most `timeout`.
    pub async fn read_line_within(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<String, CommandError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next = time::timeout_at(deadline, self.framed.next())
                .await
                .map_err(|_| CommandError::Timeout(timeout))?;
            match next {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    trace!(reply = %line, "<-");
                    return Ok(line);
                }
                Some(Err(e)) => return Err(CommandError::Io(e)),
                None => return Err(CommandError::Closed),
            }
        }
    }

    /// Read the next non-blank line within the link's timeout.
    pub async fn read_line(&mut self) -> std::result::Result<String, CommandError> {
        self.read_line_within(self.timeout).await
    }

    /// Send `command` and wait for its acknowledgment.
    ///
    /// Returns the raw reply line when it satisfies the command's
    /// expectation, and `CommandError::Rejected` carrying the line when it
    /// doesn't.
    pub async fn send_command(
        &mut self,
        command: &Command,
    ) -> std::result::Result<String, CommandError> {
        trace!(command = %command, "->");
        self.write_line(command.text()).await?;
        let line = self.read_line().await?;
        if Reply::classify(&line).satisfies(command.expect()) {
            Ok(line)
        } else {
            Err(CommandError::Rejected(line))
        }
    }

    /// Wait for the banner printed at power-up or after a reset.
    ///
    /// Returns `None` if nothing arrives in time or the link closes.
    pub async fn read_banner(&mut self) -> Option<String> {
        match self.read_line().await {
            Ok(line) => Some(line),
            Err(e) => {
                debug!(error = %e, "No banner from module");
                None
            }
        }
    }

    /// Read one line and check it against the expected banner.
    pub async fn verify_identity(&mut self, expected: &str) -> bool {
        self.read_banner()
            .await
            .is_some_and(|line| matches_banner(&line, expected))
    }

    /// Ask the module for its firmware version string (`sys get ver`).
    pub async fn query_version(&mut self) -> std::result::Result<String, CommandError> {
        self.send_command(&Command::get_version()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn banner_prefix_match() {
        assert!(matches_banner("RN2483 1.0.5 Oct 31 2018 15:06:52", "RN2483"));
        assert!(matches_banner("RN2483", "RN2483"));
        assert!(!matches_banner("RN2903 1.0.5", "RN2483"));
        assert!(!matches_banner("", "RN2483"));
    }

    #[tokio::test]
    async fn send_command_writes_crlf_and_returns_reply() {
        let (ours, theirs) = duplex(256);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        let module = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read);
            let mut received = String::new();
            lines.read_line(&mut received).await.unwrap();
            write.write_all(b"ok\r\n").await.unwrap();
            received
        });

        let reply = link.send_command(&Command::save()).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(module.await.unwrap(), "mac save\r\n");
    }

    #[tokio::test]
    async fn error_reply_is_rejected() {
        let (ours, mut theirs) = duplex(256);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        theirs.write_all(b"invalid_param\r\n").await.unwrap();

        let err = link.send_command(&Command::set_adr(false)).await.unwrap_err();
        assert!(matches!(err, CommandError::Rejected(ref line) if line == "invalid_param"));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (ours, mut theirs) = duplex(256);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        theirs.write_all(b"\r\n\r\nok\r\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (ours, _theirs) = duplex(256);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        let started = Instant::now();
        let err = link.read_line().await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(t) if t == TIMEOUT));
        assert!(started.elapsed() <= TIMEOUT + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let (ours, theirs) = duplex(256);
        drop(theirs);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        assert!(matches!(link.read_line().await, Err(CommandError::Closed)));
    }

    #[tokio::test]
    async fn verify_identity_reads_one_line() {
        let (ours, mut theirs) = duplex(256);
        let mut link = ModuleLink::new(ours, TIMEOUT);
        theirs
            .write_all(b"RN2483 1.0.5 Oct 31 2018 15:06:52\r\nRN2903\r\n")
            .await
            .unwrap();
        assert!(link.verify_identity("RN2483").await);
        assert!(!link.verify_identity("RN2483").await);
    }

    #[tokio::test]
    async fn connect_reports_missing_port() {
        let config = ConnectionConfig {
            port: "/dev/does-not-exist-rn2483".into(),
            ..ConnectionConfig::default()
        };
        match connect(&config) {
            Err(Error::Connection { port, .. }) => assert_eq!(port, config.port),
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }
}
