//! Simple (non-digest) RTMP handshake.
//!
//! Server: read C0+C1, answer S0+S1+S2, read C2. Version checking is
//! lenient; several encoders send values other than 3.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{StreamError, StreamResult};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

/// Time + zero + pseudo-random fill. The handshake does not require
/// cryptographic randomness.
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    let mut seed = u64::from(timestamp) | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    packet
}

/// Echo of the peer packet with our receive timestamp in bytes 4..8.
fn generate_echo(peer: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer;
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());
    echo
}

/// Perform the server side of the handshake.
pub async fn server_handshake<S>(stream: &mut S) -> StreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0 = [0u8; 1];
    stream.read_exact(&mut c0).await?;
    if c0[0] < RTMP_VERSION {
        return Err(StreamError::Handshake(format!(
            "unsupported RTMP version {}",
            c0[0]
        )));
    }

    let mut c1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    let s1 = generate_packet();
    let s2 = generate_echo(&c1);
    stream.write_all(&[RTMP_VERSION]).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&s2).await?;
    stream.flush().await?;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;
    Ok(())
}

/// Perform the client side of the handshake. The server also publishes
/// to itself through this path when relaying.
pub async fn client_handshake<S>(stream: &mut S) -> StreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c1 = generate_packet();
    stream.write_all(&[RTMP_VERSION]).await?;
    stream.write_all(&c1).await?;
    stream.flush().await?;

    let mut s0 = [0u8; 1];
    stream.read_exact(&mut s0).await?;
    let mut s1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1).await?;
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2).await?;

    let c2 = generate_echo(&s1);
    stream.write_all(&c2).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_and_server_complete_against_each_other() {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server).await
        });
        client_handshake(&mut client).await.expect("client side");
        server_task.await.expect("join").expect("server side");
    }

    #[tokio::test]
    async fn ancient_version_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server).await
        });
        client.write_all(&[2u8]).await.expect("write");
        client.write_all(&[0u8; HANDSHAKE_SIZE]).await.expect("write");

        let result = server_task.await.expect("join");
        assert!(matches!(result, Err(StreamError::Handshake(_))));
    }

    #[test]
    fn echo_preserves_peer_payload() {
        let packet = generate_packet();
        let echo = generate_echo(&packet);
        assert_eq!(&packet[8..], &echo[8..]);
        assert_eq!(&packet[0..4], &echo[0..4]);
    }
}
