//! Wire records and length-prefixed framing

use super::PubsubError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Records sent by clients to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        name: String,
        parallel_requests: usize,
    },
    Subscribe {
        channel: String,
        reservation_id: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        payload: Value,
    },
    /// `request_id` is chosen by the requester
    Request {
        request_id: u64,
        channel: String,
        payload: Value,
    },
    /// `request_id` is the one the broker forwarded
    Delivered {
        request_id: u64,
    },
    Respond {
        request_id: u64,
        result: RemoteResult,
    },
    Acknowledge {
        reservation_id: String,
        channel: String,
        message_id: i64,
    },
}

/// Records sent by the broker to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Message {
        channel: String,
        payload: Value,
        reservation: Option<ReservationDelivery>,
    },
    /// A request for this subscriber, under a broker-assigned id
    Request {
        request_id: u64,
        channel: String,
        payload: Value,
    },
    /// Outcome of routing the requester's request
    Delivery {
        request_id: u64,
        error: Option<String>,
    },
    Response {
        request_id: u64,
        result: RemoteResult,
    },
}

/// Identifies a stored message so the receiver can acknowledge it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDelivery {
    pub reservation_id: String,
    pub channel: String,
    pub message_id: i64,
}

/// Result of a request as produced by the serving subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteResult {
    Ok { value: Value },
    Error { message: String },
}

impl From<Result<Value, String>> for RemoteResult {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => RemoteResult::Ok { value },
            Err(message) => RemoteResult::Error { message },
        }
    }
}

impl RemoteResult {
    pub fn into_result(self) -> Result<Value, PubsubError> {
        match self {
            RemoteResult::Ok { value } => Ok(value),
            RemoteResult::Error { message } => Err(PubsubError::Remote(message)),
        }
    }
}

/// Write one length-prefixed JSON record
pub async fn write_frame<W, T>(writer: &mut W, record: &T) -> Result<(), PubsubError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(record)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(PubsubError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON record; `None` on a clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, PubsubError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PubsubError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sent = ClientMessage::Publish {
            channel: "changesets/1".to_string(),
            payload: json!({"complete": true}),
        };
        write_frame(&mut a, &sent).await.unwrap();
        write_frame(&mut a, &ClientMessage::Delivered { request_id: 7 })
            .await
            .unwrap();
        drop(a);

        let first: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(sent));
        let second: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(second, Some(ClientMessage::Delivered { request_id: 7 }));
        let end: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_frame_header_is_big_endian_length() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &json!(1)).await.unwrap();
        assert_eq!(buffer, vec![0, 0, 0, 1, b'1']);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(b"{}");
        let result: Result<Option<Value>, _> = read_frame(&mut data.as_slice()).await;
        assert!(matches!(result, Err(PubsubError::Io(_))));
    }

    #[test]
    fn test_remote_result_encoding() {
        let ok: RemoteResult = Ok(json!(3)).into();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "value": 3})
        );
        let err: RemoteResult = Err("boom".to_string()).into();
        assert!(matches!(err.into_result(), Err(PubsubError::Remote(m)) if m == "boom"));
    }
}
