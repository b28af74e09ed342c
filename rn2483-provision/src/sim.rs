//! Simulated RN2483 module.
//!
//! Runs as a tokio task on one end of an in-memory duplex pipe and answers
//! commands the way the module's firmware does, closely enough to exercise
//! the provisioning sequence without hardware. Individual commands can be
//! scripted to fail or to stay silent. The task ends when the host closes
//! its end of the pipe and returns every line it received.

use futures::SinkExt;
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::protocol::{LineCodec, OK};
use crate::tracing::prelude::*;

/// Version string of the simulated firmware.
pub const SIM_VERSION: &str = "RN2483 1.0.5 Oct 31 2018 15:06:52";

const PIPE_CAPACITY: usize = 4096;

/// What the module does when it receives a matching command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer with these lines, in order
    Lines(Vec<String>),
    /// Never answer
    Silent,
}

impl Response {
    pub fn line(line: &str) -> Self {
        Response::Lines(vec![line.to_string()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Personality {
    /// Answer `ok` to everything
    Ok,
    /// Answer like the firmware
    Rn2483,
}

/// Builder and state of a simulated module.
#[derive(Debug, Clone)]
pub struct SimulatedModule {
    personality: Personality,
    banner: Option<String>,
    scripted: Vec<(String, Response)>,
    joined: bool,
}

impl SimulatedModule {
    /// A module that acknowledges every command with `ok`.
    pub fn echo_ok() -> Self {
        Self {
            personality: Personality::Ok,
            banner: None,
            scripted: Vec::new(),
            joined: false,
        }
    }

    /// A module that answers like RN2483 firmware.
    pub fn rn2483() -> Self {
        Self {
            personality: Personality::Rn2483,
            ..Self::echo_ok()
        }
    }

    /// Print `banner` as soon as the link is up, as at power-up.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = Some(banner.to_string());
        self
    }

    /// Answer commands starting with `prefix` with `response`.
    ///
    /// Scripted responses take precedence over the personality, first
    /// match wins.
    pub fn on(mut self, prefix: &str, response: Response) -> Self {
        self.scripted.push((prefix.to_string(), response));
        self
    }

    /// Start the module task and return the host end of the link.
    pub fn spawn(self) -> (DuplexStream, JoinHandle<Vec<String>>) {
        let (host, module) = duplex(PIPE_CAPACITY);
        let task = tokio::spawn(self.run(module));
        (host, task)
    }

    async fn run(mut self, stream: DuplexStream) -> Vec<String> {
        let mut framed = Framed::new(stream, LineCodec::default());
        let mut received = Vec::new();

        if let Some(banner) = self.banner.take() {
            if framed.send(banner.as_str()).await.is_err() {
                return received;
            }
        }

        while let Some(Ok(line)) = framed.next().await {
            trace!(command = %line, "simulated module received");
            let response = self.respond(&line);
            received.push(line);
            if let Response::Lines(lines) = response {
                for reply in lines {
                    if framed.send(reply.as_str()).await.is_err() {
                        return received;
                    }
                }
            }
        }

        trace!(commands = received.len(), "simulated module closed");
        received
    }

    fn respond(&mut self, line: &str) -> Response {
        if let Some((_, response)) = self
            .scripted
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            return response.clone();
        }
        match self.personality {
            Personality::Ok => Response::line(OK),
            Personality::Rn2483 => self.firmware(line),
        }
    }

    fn firmware(&mut self, line: &str) -> Response {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["sys", "factoryRESET"] => {
                self.joined = false;
                Response::line(SIM_VERSION)
            }
            ["sys", "get", "ver"] => Response::line(SIM_VERSION),
            ["mac", "set", "devaddr", addr] => hex_param(addr, 8),
            ["mac", "set", "appskey", key] | ["mac", "set", "nwkskey", key] => hex_param(key, 32),
            ["mac", "set", "adr", "on" | "off"] => Response::line(OK),
            ["mac", "save"] => Response::line(OK),
            ["mac", "join", "abp"] => {
                self.joined = true;
                Response::Lines(vec![OK.to_string(), "accepted".to_string()])
            }
            ["mac", "tx", "uncnf" | "cnf", port, data] => {
                if !self.joined {
                    Response::line("not_joined")
                } else if port.parse::<u8>().map_or(true, |p| !(1..=223).contains(&p))
                    || hex::decode(data).is_err()
                {
                    Response::line("invalid_param")
                } else {
                    Response::Lines(vec![OK.to_string(), "mac_tx_ok".to_string()])
                }
            }
            _ => Response::line("invalid_param"),
        }
    }
}

fn hex_param(value: &str, len: usize) -> Response {
    if value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Response::line(OK)
    } else {
        Response::line("invalid_param")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ModuleLink;
    use crate::protocol::Command;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn firmware_answers() {
        let (host, task) = SimulatedModule::rn2483().spawn();
        let mut link = ModuleLink::new(host, TIMEOUT);

        assert_eq!(link.send_command(&Command::factory_reset()).await.unwrap(), SIM_VERSION);
        link.write_line("mac set devaddr 0201").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "invalid_param");
        link.write_line("mac tx uncnf 1 AA").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "not_joined");
        link.write_line("mac join abp").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "ok");
        assert_eq!(link.read_line().await.unwrap(), "accepted");
        link.write_line("mac tx uncnf 1 AA").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "ok");
        assert_eq!(link.read_line().await.unwrap(), "mac_tx_ok");

        drop(link);
        assert_eq!(task.await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn banner_comes_first() {
        let (host, _task) = SimulatedModule::rn2483().with_banner(SIM_VERSION).spawn();
        let mut link = ModuleLink::new(host, TIMEOUT);
        assert!(link.verify_identity("RN2483").await);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_silence() {
        let (host, task) = SimulatedModule::echo_ok()
            .on("mac save", Response::Silent)
            .spawn();
        let mut link = ModuleLink::new(host, TIMEOUT);
        assert_eq!(link.send_command(&Command::set_adr(false)).await.unwrap(), "ok");
        assert!(link.send_command(&Command::save()).await.is_err());
        drop(link);
        assert_eq!(task.await.unwrap(), ["mac set adr off", "mac save"]);
    }
}
