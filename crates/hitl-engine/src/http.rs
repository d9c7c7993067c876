//! Socket-side helpers for the feedback service.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the bytes read while waiting for the request line.
pub const MAX_REQUEST_HEAD: usize = 8192;

const READ_CHUNK: usize = 1024;

/// Read from `reader` until the request line is complete (a `\n` arrives),
/// the peer closes, or [`MAX_REQUEST_HEAD`] bytes have been read. The
/// request line may arrive split across several segments.
pub async fn read_request_head<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    while head.len() < MAX_REQUEST_HEAD {
        let want = READ_CHUNK.min(MAX_REQUEST_HEAD - head.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn joins_a_request_line_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"POST /api/tri").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"als/3/choice/0 HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            client
        });

        let head = read_request_head(&mut server).await.unwrap();
        assert!(head.starts_with("POST /api/trials/3/choice/0 HTTP/1.1\r\n"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn stops_at_the_size_limit() {
        let (mut client, mut server) = tokio::io::duplex(MAX_REQUEST_HEAD * 2);
        client.write_all(&vec![b'a'; MAX_REQUEST_HEAD + 500]).await.unwrap();

        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.len(), MAX_REQUEST_HEAD);
    }

    #[tokio::test]
    async fn returns_what_arrived_before_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"GET /api/study").await.unwrap();
        drop(client);

        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head, "GET /api/study");
    }
}
