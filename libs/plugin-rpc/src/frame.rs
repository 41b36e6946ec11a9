use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Frames larger than this are refused rather than buffered — a
/// misbehaving plugin should not be able to exhaust host memory with a
/// single declared length.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One length-delimited envelope on the RPC channel. Method dispatch is
/// request/response; `StreamData`/`StreamEnd` carry the bytes of an
/// `Object` out-of-band on a sub-channel identified by `stream_id`,
/// opened lazily by whichever side is producing the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    StreamData {
        stream_id: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    StreamEnd {
        stream_id: u64,
    },
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
}

/// A plugin error as carried on the wire: a closed set of sentinels
/// (`eof`, `not_exist`, `not_configured`, `not_implemented`,
/// `cancelled`) identified by a discriminator field rather than by
/// matching message text, plus a free-form message for everything else
/// (see `spec.md` §9, "Error sentinel transport").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<String>,
    pub message: String,
}

impl WireError {
    pub fn from_plugin_error(e: &ingest_api::PluginError) -> Self {
        let sentinel = match e.kind() {
            ingest_api::ErrorKind::Eof => Some("eof"),
            ingest_api::ErrorKind::NotExist => Some("not_exist"),
            ingest_api::ErrorKind::NotConfigured => Some("not_configured"),
            ingest_api::ErrorKind::NotImplemented => Some("not_implemented"),
            ingest_api::ErrorKind::Cancelled => Some("cancelled"),
            _ => None,
        };
        Self { sentinel: sentinel.map(str::to_string), message: e.message().to_string() }
    }

    pub fn into_plugin_error(self) -> ingest_api::PluginError {
        use ingest_api::{ErrorKind, PluginError};
        match self.sentinel.as_deref() {
            Some("eof") => PluginError::eof(),
            Some("not_exist") => PluginError::not_exist(),
            Some("not_configured") => PluginError::not_configured(),
            Some("not_implemented") => PluginError::not_implemented(),
            Some("cancelled") => PluginError::cancelled(),
            _ => PluginError::new(ErrorKind::Logic, self.message),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(TransportError::Handshake("frame too large".into()));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, TransportError> {
    let len = r.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Handshake("declared frame length too large".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = Frame::Request { id: 7, method: "Next".into(), params: serde_json::json!({}) };
        write_frame(&mut client, &frame).await.unwrap();
        let got = read_frame(&mut server).await.unwrap();
        match got {
            Frame::Request { id, method, .. } => {
                assert_eq!(id, 7);
                assert_eq!(method, "Next");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn wire_error_round_trips_sentinels() {
        let e = ingest_api::PluginError::not_exist();
        let wire = WireError::from_plugin_error(&e);
        assert_eq!(wire.sentinel.as_deref(), Some("not_exist"));
        assert!(wire.into_plugin_error().is_not_exist());
    }
}
