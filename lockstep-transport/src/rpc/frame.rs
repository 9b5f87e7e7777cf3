//! Binary framing of RPC messages.
//!
//! Every frame is `u32 length` followed by `length` bytes. A request body
//! starts with its method byte. A reply body starts with a status byte:
//! zero, then the method byte and the reply fields; or an error code
//! followed by the message text. Strings and byte arrays are `u32`-length
//! prefixed, numbers big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lockstep_core::{DeviceIdentifier, ErrorCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::{
    DeviceMessage, GetDeviceReply, GetDeviceRequest, InitReply, InitRequest, PayloadMessage,
    RpcRequest, RpcResponse, RpcStatus, RunLoopStepReply, RunLoopStepRequest, SetDeviceReply,
    SetDeviceRequest, ShutdownReply, ShutdownRequest, method,
};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const STATUS_OK: u8 = 0;
const NO_PAYLOAD: u8 = 0;

/// Errors raised while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Frame of {len} bytes exceeds limit")]
    TooLarge { len: u32 },

    #[error("{trailing} unexpected bytes after message")]
    Trailing { trailing: usize },
}

fn need(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, FrameError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, FrameError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, FrameError> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_f64s<const N: usize>(buf: &mut Bytes) -> Result<[f64; N], FrameError> {
    need(buf, N * 8)?;
    let mut values = [0.0; N];
    for value in &mut values {
        *value = buf.get_f64();
    }
    Ok(values)
}

fn put_id(buf: &mut BytesMut, id: &DeviceIdentifier) {
    put_bytes(buf, id.name.as_bytes());
    put_bytes(buf, id.device_type.as_bytes());
    put_bytes(buf, id.engine_name.as_bytes());
}

fn get_id(buf: &mut Bytes) -> Result<DeviceIdentifier, FrameError> {
    Ok(DeviceIdentifier {
        name: get_string(buf)?,
        device_type: get_string(buf)?,
        engine_name: get_string(buf)?,
    })
}

fn put_payload(buf: &mut BytesMut, payload: &PayloadMessage) {
    buf.put_u8(payload.kind());
    match payload {
        PayloadMessage::Joint {
            position,
            velocity,
            effort,
        } => {
            buf.put_f64(*position);
            buf.put_f64(*velocity);
            buf.put_f64(*effort);
        }
        PayloadMessage::Link {
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        } => {
            for value in position
                .iter()
                .chain(orientation)
                .chain(linear_velocity)
                .chain(angular_velocity)
            {
                buf.put_f64(*value);
            }
        }
        PayloadMessage::Camera {
            width,
            height,
            depth,
            image,
        } => {
            buf.put_u32(*width);
            buf.put_u32(*height);
            buf.put_u8(*depth);
            put_bytes(buf, image);
        }
        PayloadMessage::Json { text } => put_bytes(buf, text.as_bytes()),
    }
}

fn get_payload(buf: &mut Bytes) -> Result<Option<PayloadMessage>, FrameError> {
    let payload = match get_u8(buf)? {
        NO_PAYLOAD => return Ok(None),
        1 => {
            let [position, velocity, effort] = get_f64s::<3>(buf)?;
            PayloadMessage::Joint {
                position,
                velocity,
                effort,
            }
        }
        2 => PayloadMessage::Link {
            position: get_f64s(buf)?,
            orientation: get_f64s(buf)?,
            linear_velocity: get_f64s(buf)?,
            angular_velocity: get_f64s(buf)?,
        },
        3 => PayloadMessage::Camera {
            width: get_u32(buf)?,
            height: get_u32(buf)?,
            depth: get_u8(buf)?,
            image: get_bytes(buf)?,
        },
        4 => PayloadMessage::Json {
            text: get_string(buf)?,
        },
        tag => return Err(FrameError::UnknownTag { what: "payload", tag }),
    };
    Ok(Some(payload))
}

fn put_messages(buf: &mut BytesMut, messages: &[DeviceMessage]) {
    buf.put_u32(messages.len() as u32);
    for message in messages {
        put_id(buf, &message.id);
        match &message.payload {
            Some(payload) => put_payload(buf, payload),
            None => buf.put_u8(NO_PAYLOAD),
        }
    }
}

fn get_messages(buf: &mut Bytes) -> Result<Vec<DeviceMessage>, FrameError> {
    let count = get_u32(buf)?;
    (0..count)
        .map(|_| {
            Ok(DeviceMessage {
                id: get_id(buf)?,
                payload: get_payload(buf)?,
            })
        })
        .collect()
}

fn finish<T>(buf: &Bytes, value: T) -> Result<T, FrameError> {
    if buf.has_remaining() {
        return Err(FrameError::Trailing {
            trailing: buf.remaining(),
        });
    }
    Ok(value)
}

/// Encodes a request body.
pub fn encode_request(request: &RpcRequest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(request.method());
    match request {
        RpcRequest::Init(InitRequest { json }) | RpcRequest::Shutdown(ShutdownRequest { json }) => {
            put_bytes(&mut buf, json.as_bytes());
        }
        RpcRequest::RunLoopStep(RunLoopStepRequest { timestep }) => buf.put_i64(*timestep),
        RpcRequest::GetDevice(GetDeviceRequest { ids }) => {
            buf.put_u32(ids.len() as u32);
            for id in ids {
                put_id(&mut buf, id);
            }
        }
        RpcRequest::SetDevice(SetDeviceRequest { messages }) => put_messages(&mut buf, messages),
    }
    buf.freeze()
}

/// Decodes a request body.
///
/// # Errors
///
/// - `FrameError` - Body is truncated, oversized or carries unknown tags
pub fn decode_request(mut buf: Bytes) -> Result<RpcRequest, FrameError> {
    let request = match get_u8(&mut buf)? {
        method::INIT => RpcRequest::Init(InitRequest {
            json: get_string(&mut buf)?,
        }),
        method::SHUTDOWN => RpcRequest::Shutdown(ShutdownRequest {
            json: get_string(&mut buf)?,
        }),
        method::RUN_LOOP_STEP => RpcRequest::RunLoopStep(RunLoopStepRequest {
            timestep: get_i64(&mut buf)?,
        }),
        method::GET_DEVICE => {
            let count = get_u32(&mut buf)?;
            let ids = (0..count)
                .map(|_| get_id(&mut buf))
                .collect::<Result<_, _>>()?;
            RpcRequest::GetDevice(GetDeviceRequest { ids })
        }
        method::SET_DEVICE => RpcRequest::SetDevice(SetDeviceRequest {
            messages: get_messages(&mut buf)?,
        }),
        tag => return Err(FrameError::UnknownTag { what: "method", tag }),
    };
    finish(&buf, request)
}

/// Encodes a reply body.
pub fn encode_reply(reply: &Result<RpcResponse, RpcStatus>) -> Bytes {
    let mut buf = BytesMut::new();
    match reply {
        Ok(response) => {
            buf.put_u8(STATUS_OK);
            buf.put_u8(response.method());
            match response {
                RpcResponse::Init(InitReply { json }) => put_bytes(&mut buf, json.as_bytes()),
                RpcResponse::RunLoopStep(RunLoopStepReply { engine_time }) => {
                    buf.put_i64(*engine_time);
                }
                RpcResponse::GetDevice(GetDeviceReply { messages }) => {
                    put_messages(&mut buf, messages);
                }
                RpcResponse::Shutdown(ShutdownReply) | RpcResponse::SetDevice(SetDeviceReply) => {}
            }
        }
        Err(status) => {
            buf.put_u8(status.code.as_u8());
            put_bytes(&mut buf, status.message.as_bytes());
        }
    }
    buf.freeze()
}

/// Decodes a reply body.
///
/// # Errors
///
/// - `FrameError` - Body is truncated or carries unknown tags
pub fn decode_reply(mut buf: Bytes) -> Result<Result<RpcResponse, RpcStatus>, FrameError> {
    let status = get_u8(&mut buf)?;
    if status != STATUS_OK {
        let message = get_string(&mut buf)?;
        return finish(
            &buf,
            Err(RpcStatus {
                code: ErrorCode::from_u8(status),
                message,
            }),
        );
    }

    let response = match get_u8(&mut buf)? {
        method::INIT => RpcResponse::Init(InitReply {
            json: get_string(&mut buf)?,
        }),
        method::SHUTDOWN => RpcResponse::Shutdown(ShutdownReply),
        method::RUN_LOOP_STEP => RpcResponse::RunLoopStep(RunLoopStepReply {
            engine_time: get_i64(&mut buf)?,
        }),
        method::GET_DEVICE => RpcResponse::GetDevice(GetDeviceReply {
            messages: get_messages(&mut buf)?,
        }),
        method::SET_DEVICE => RpcResponse::SetDevice(SetDeviceReply),
        tag => return Err(FrameError::UnknownTag { what: "method", tag }),
    };
    finish(&buf, Ok(response))
}

/// Writes one length-prefixed frame.
///
/// # Errors
///
/// - `std::io::Error` - Write failed
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame. `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// - `std::io::Error` - Read failed, stream ended mid-frame, or frame too large
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(length);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            FrameError::TooLarge { len },
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltmeter() -> DeviceMessage {
        DeviceMessage {
            id: DeviceIdentifier::new("voltmeter", "engine_1", "nest_device"),
            payload: Some(PayloadMessage::Json {
                text: r#"{"V_m":-65.0}"#.to_string(),
            }),
        }
    }

    #[test]
    fn test_set_device_request_decodes() {
        let request = RpcRequest::SetDevice(SetDeviceRequest {
            messages: vec![
                voltmeter(),
                DeviceMessage {
                    id: DeviceIdentifier::new("eye", "robot", "camera"),
                    payload: Some(PayloadMessage::Camera {
                        width: 1,
                        height: 1,
                        depth: 3,
                        image: Bytes::from_static(&[9, 8, 7]),
                    }),
                },
            ],
        });

        assert_eq!(decode_request(encode_request(&request)).unwrap(), request);
    }

    #[test]
    fn test_absent_device_has_no_payload() {
        let reply = Ok(RpcResponse::GetDevice(GetDeviceReply {
            messages: vec![DeviceMessage {
                id: DeviceIdentifier::new("ghost", "engine_1", "camera"),
                payload: None,
            }],
        }));

        let decoded = decode_reply(encode_reply(&reply)).unwrap().unwrap();
        let RpcResponse::GetDevice(GetDeviceReply { messages }) = decoded else {
            panic!("wrong reply variant");
        };
        assert_eq!(messages[0].payload, None);
    }

    #[test]
    fn test_error_status_carries_code_and_message() {
        let reply = Err(RpcStatus {
            code: ErrorCode::OutOfOrder,
            message: "cannot run_loop_step while running".to_string(),
        });
        assert_eq!(decode_reply(encode_reply(&reply)).unwrap(), reply);
    }

    #[test]
    fn test_truncated_request_is_rejected() {
        let full = encode_request(&RpcRequest::RunLoopStep(RunLoopStepRequest {
            timestep: 10_000_000,
        }));
        let cut = full.slice(..full.len() - 3);
        assert!(matches!(
            decode_request(cut),
            Err(FrameError::Truncated { needed: 3 })
        ));
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        assert!(matches!(
            decode_request(Bytes::from_static(&[42])),
            Err(FrameError::UnknownTag { tag: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
