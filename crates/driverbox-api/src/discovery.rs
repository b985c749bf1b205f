//! UDP discovery responder

use driverbox_core::metadata::{DiscoveryResponse, PRODUCT};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 1024;

/// Bind the discovery socket on all interfaces
pub async fn bind(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!("UDP discovery listening on {}", socket.local_addr()?);
    Ok(socket)
}

fn is_discovery_request(payload: &[u8]) -> bool {
    payload
        .windows(PRODUCT.len())
        .any(|w| w == PRODUCT.as_bytes())
}

/// Answer every request naming the product with the gateway identity
pub async fn serve(socket: UdpSocket, response: DiscoveryResponse) {
    let reply = match serde_json::to_vec(&response) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("Failed to encode discovery response: {}", e);
            return;
        }
    };

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("Discovery receive failed: {}", e);
                continue;
            }
        };
        if !is_discovery_request(&buf[..len]) {
            continue;
        }
        tracing::debug!("Discovery request from {}", peer);
        if let Err(e) = socket.send_to(&reply, peer).await {
            tracing::warn!("Discovery reply to {} failed: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driverbox_core::metadata::Metadata;
    use std::time::Duration;

    #[test]
    fn test_discovery_request_match() {
        assert!(is_discovery_request(b"driver-box"));
        assert!(is_discovery_request(b"who is driver-box?"));
        assert!(!is_discovery_request(b"driverbox"));
        assert!(!is_discovery_request(b""));
    }

    #[tokio::test]
    async fn test_answers_discovery_requests_only() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap();
        let metadata = Metadata {
            serial_no: "abc123".into(),
            product: PRODUCT.into(),
            version: "0.1.0".into(),
            host_name: None,
        };
        let task = tokio::spawn(serve(server, metadata.discovery(8081)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", address).await.unwrap();
        client.send_to(b"driver-box", address).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(reply["serialNo"], "abc123");
        assert_eq!(reply["product"], "driver-box");
        assert_eq!(reply["httpPort"], 8081);

        // the unrelated datagram got no answer
        let extra = tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(extra.is_err());
        task.abort();
    }
}
