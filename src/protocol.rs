// src/protocol.rs
//
// Control-plane wire contract between coordinator and drivers: one JSON
// value per line over a TCP stream.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::config::{S3Configuration, TestCaseConfiguration};
use crate::results::BenchmarkResult;

/// Greeting a driver sends right after connecting, as a bare JSON string.
pub const READY_GREETING: &str = "ready for work";

pub const MSG_INIT: &str = "init";
pub const MSG_PREPARATIONS_DONE: &str = "preparations done";
pub const MSG_START_WORK: &str = "start work";
pub const MSG_WORK_DONE: &str = "work done";
pub const MSG_SHUTDOWN: &str = "shutdown";

/// Per-test assignment for one driver: endpoint credentials, the test to run
/// and the identity the driver uses for namespacing. One-shot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConf {
    #[serde(rename = "S3Config")]
    pub s3_config: S3Configuration,
    #[serde(rename = "Test")]
    pub test: TestCaseConfiguration,
    #[serde(rename = "DriverID")]
    pub driver_id: String,
}

/// Envelope for every control message after the greeting. `config` is only
/// present on `init`, `bench_result` only on `work done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMessage {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Config", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DriverConf>,
    #[serde(rename = "BenchResult", default, skip_serializing_if = "Option::is_none")]
    pub bench_result: Option<BenchmarkResult>,
}

impl DriverMessage {
    pub fn plain(message: &str) -> Self {
        DriverMessage {
            message: message.to_string(),
            config: None,
            bench_result: None,
        }
    }

    pub fn init(config: DriverConf) -> Self {
        DriverMessage {
            message: MSG_INIT.to_string(),
            config: Some(config),
            bench_result: None,
        }
    }

    pub fn work_done(result: BenchmarkResult) -> Self {
        DriverMessage {
            message: MSG_WORK_DONE.to_string(),
            config: None,
            bench_result: Some(result),
        }
    }
}

/// A framed control connection. Messages are newline-delimited JSON values;
/// a closed peer surfaces as an error from `recv`.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: String,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: String::new(),
        }
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut frame = serde_json::to_vec(value).context("could not encode message")?;
        frame.push(b'\n');
        self.writer
            .write_all(&frame)
            .await
            .context("could not send message")?;
        self.writer.flush().await.context("could not flush message")?;
        Ok(())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .context("could not read message")?;
        if n == 0 {
            bail!("connection closed by peer");
        }
        serde_json::from_str(self.line.trim_end())
            .with_context(|| format!("could not decode message {:?}", self.line.trim_end()))
    }
}
