//! Serial transport over the `serialport` crate.
//!
//! The port is synchronous, so all I/O runs on Tokio's blocking pool with
//! the handle behind `Arc<Mutex<..>>`. Reads stay non-blocking by checking
//! `bytes_to_read` first; the port's own timeout only covers the rare race
//! where bytes vanish between the check and the read.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tokio::sync::Mutex;

use crate::error::{RfError, RfResult};
use crate::transport::Transport;

/// Connect-time framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default)]
    pub parity: Parity,

    /// Read/write timeout applied to the OS handle.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_timeout_ms() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            parity: Parity::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Names of serial ports currently visible to the OS.
///
/// Discovery heuristics are the caller's business; this is a plain listing
/// for pickers and the CLI's `--list-ports`.
pub fn available_ports() -> RfResult<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Exclusive serial channel to one device.
pub struct SerialTransport {
    port_name: String,
    config: SerialConfig,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            port_name: port_name.into(),
            config,
            port: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port_handle(&self) -> RfResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(RfError::NotConnected)
    }
}

fn join_blocking<T>(result: Result<RfResult<T>, tokio::task::JoinError>) -> RfResult<T> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(RfError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("serial I/O task panicked: {join_err}"),
        ))),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> RfResult<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let name = self.port_name.clone();
        let config = self.config.clone();
        let port = tokio::task::spawn_blocking(move || -> RfResult<Box<dyn SerialPort>> {
            let port = serialport::new(&name, config.baud_rate)
                .parity(config.parity.into())
                .timeout(Duration::from_millis(config.timeout_ms))
                .open()
                .map_err(|e| {
                    RfError::Connection(format!(
                        "failed to open '{}' at {} baud: {}",
                        name, config.baud_rate, e
                    ))
                })?;
            Ok(port)
        })
        .await;

        let port = join_blocking(port)?;
        log::debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name,
            self.config.baud_rate
        );
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn disconnect(&mut self) -> RfResult<()> {
        if self.port.take().is_some() {
            log::debug!("Serial port '{}' closed", self.port_name);
        }
        Ok(())
    }

    async fn try_read(&mut self, buf: &mut Vec<u8>) -> RfResult<usize> {
        let port = self.port_handle()?;

        let chunk = tokio::task::spawn_blocking(move || -> RfResult<Vec<u8>> {
            let mut guard = port.blocking_lock();
            let available = guard.bytes_to_read()? as usize;
            if available == 0 {
                return Ok(Vec::new());
            }

            let mut chunk = vec![0u8; available.min(4096)];
            match guard.read(&mut chunk) {
                Ok(n) => {
                    chunk.truncate(n);
                    Ok(chunk)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(RfError::Io(e)),
            }
        })
        .await;

        let chunk = join_blocking(chunk)?;
        buf.extend_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn write(&mut self, bytes: &[u8]) -> RfResult<()> {
        let port = self.port_handle()?;
        let bytes = bytes.to_vec();

        let result = tokio::task::spawn_blocking(move || -> RfResult<()> {
            let mut guard = port.blocking_lock();
            guard.write_all(&bytes).map_err(RfError::Io)?;
            guard.flush().map_err(RfError::Io)?;
            Ok(())
        })
        .await;

        join_blocking(result)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.timeout_ms, 100);
    }

    #[test]
    fn test_parity_mapping() {
        assert_eq!(serialport::Parity::from(Parity::Odd), serialport::Parity::Odd);
        assert_eq!(
            serialport::Parity::from(Parity::Even),
            serialport::Parity::Even
        );
    }

    #[tokio::test]
    async fn test_io_before_connect_is_rejected() {
        let mut transport = SerialTransport::new("/dev/ttyUSB0", SerialConfig::default());
        assert!(!transport.is_connected());

        let mut buf = Vec::new();
        assert!(matches!(
            transport.try_read(&mut buf).await,
            Err(RfError::NotConnected)
        ));
        assert!(matches!(
            transport.write(b"x").await,
            Err(RfError::NotConnected)
        ));
        // Disconnect is idempotent even when never connected.
        transport.disconnect().await.unwrap();
    }
}
