//! Transports carrying encoded frames

use crate::error::PluginError;
use crate::codec::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Synchronous request/response I/O for one connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame and wait for its response, if the protocol has one
    async fn send(&self, frame: Frame) -> Result<Option<Frame>, PluginError>;

    /// Close the link; further sends fail with `TransportClosed`
    async fn close(&self);
}

/// In-memory device simulator used in virtual mode
///
/// Understands the `JsonCodec` request shape: writes are stored and echoed,
/// reads answer with the stored values (0 for never written points).
#[derive(Default)]
pub struct VirtualTransport {
    registers: DashMap<(String, String), Value>,
    closed: AtomicBool,
}

impl VirtualTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a simulated point value
    pub fn set(&self, device_id: &str, point: &str, value: Value) {
        self.registers
            .insert((device_id.to_string(), point.to_string()), value);
    }

    #[must_use]
    pub fn get(&self, device_id: &str, point: &str) -> Option<Value> {
        self.registers
            .get(&(device_id.to_string(), point.to_string()))
            .map(|v| v.clone())
    }
}

#[async_trait]
impl Transport for VirtualTransport {
    async fn send(&self, frame: Frame) -> Result<Option<Frame>, PluginError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PluginError::TransportClosed("virtual".to_string()));
        }
        let request = frame.into_json()?;
        let device_id = request["id"]
            .as_str()
            .ok_or_else(|| PluginError::ProtocolDataFormat("request without id".into()))?
            .to_string();
        let write = request["mode"] == "write";
        let points = request["values"].as_array().cloned().unwrap_or_default();

        let mut values = Vec::with_capacity(points.len());
        for point in points {
            let Some(name) = point["name"].as_str() else {
                continue;
            };
            let key = (device_id.clone(), name.to_string());
            let value = if write {
                self.registers.insert(key, point["value"].clone());
                point["value"].clone()
            } else {
                self.registers
                    .get(&key)
                    .map_or_else(|| json!(0), |v| v.clone())
            };
            values.push(json!({"name": name, "value": value}));
        }
        Ok(Some(Frame::Json(json!({"id": device_id, "values": values}))))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Newline-delimited JSON over TCP, one response line per request
pub struct TcpLineTransport {
    address: String,
    timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    closed: AtomicBool,
}

impl TcpLineTransport {
    #[must_use]
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn exchange(
        stream: &mut BufReader<TcpStream>,
        payload: &[u8],
    ) -> Result<String, PluginError> {
        stream.get_mut().write_all(payload).await?;
        stream.get_mut().write_all(b"\n").await?;
        stream.get_mut().flush().await?;

        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        Ok(line)
    }
}

#[async_trait]
impl Transport for TcpLineTransport {
    async fn send(&self, frame: Frame) -> Result<Option<Frame>, PluginError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PluginError::TransportClosed(self.address.clone()));
        }
        let payload = match frame {
            Frame::Json(value) => Bytes::from(serde_json::to_vec(&value)?),
            Frame::Bytes(bytes) => bytes,
        };

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            tracing::info!("Connecting to {}", self.address);
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| PluginError::ProtocolTimeout)??;
            *guard = Some(BufReader::new(stream));
        }
        let Some(stream) = guard.as_mut() else {
            return Err(PluginError::TransportClosed(self.address.clone()));
        };

        let result = tokio::time::timeout(self.timeout, Self::exchange(stream, &payload)).await;
        match result {
            Ok(Ok(line)) => {
                tracing::debug!("Received {} bytes from {}", line.len(), self.address);
                Ok(Some(Frame::Bytes(Bytes::from(line.trim_end().to_string()))))
            }
            Ok(Err(e)) => {
                tracing::warn!("I/O error on {}: {}", self.address, e);
                *guard = None;
                Err(e)
            }
            Err(_) => {
                // the response may still arrive; drop the stream to resync
                *guard = None;
                Err(PluginError::ProtocolTimeout)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stream.lock().await.take();
        tracing::debug!("Closed transport {}", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_virtual_transport_echoes_writes() {
        let transport = VirtualTransport::new();
        let write = json!({"id": "d", "mode": "write", "values": [{"name": "fan", "value": 1}]});
        transport.send(Frame::Json(write)).await.unwrap();
        assert_eq!(transport.get("d", "fan"), Some(json!(1)));

        let read = json!({"id": "d", "mode": "read", "values": [
            {"name": "fan", "value": null}, {"name": "temp", "value": null}
        ]});
        let response = transport.send(Frame::Json(read)).await.unwrap().unwrap();
        assert_eq!(
            response.into_json().unwrap()["values"],
            json!([{"name": "fan", "value": 1}, {"name": "temp", "value": 0}])
        );

        transport.close().await;
        assert!(matches!(
            transport.send(Frame::Json(json!({"id": "d"}))).await,
            Err(PluginError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_line_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut line = String::new();
            while reader.read_line(&mut line).await.unwrap() > 0 {
                let reply = format!("{{\"echo\":{}}}\n", line.trim_end());
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
                line.clear();
            }
        });

        let transport = TcpLineTransport::new(address, Duration::from_secs(2));
        let response = transport
            .send(Frame::Json(json!({"id": "dev"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.into_json().unwrap()["echo"]["id"], "dev");
    }

    #[tokio::test]
    async fn test_tcp_line_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = TcpLineTransport::new(address, Duration::from_millis(100));
        assert!(matches!(
            transport.send(Frame::Json(json!({"id": "dev"}))).await,
            Err(PluginError::ProtocolTimeout)
        ));
    }
}
