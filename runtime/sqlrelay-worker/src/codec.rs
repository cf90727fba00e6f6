//! Length-prefixed frames and the JSON/MessagePack wire encoding.
//!
//! Every frame is a little-endian `u32` length followed by one message.
//! MessagePack frames carry blobs as `bin` in `data`; JSON frames carry them
//! base64-encoded in `data_b64`. Decoders accept either field.

use crate::error::{ErrorKind, Failure};
use crate::protocol::{Command, Envelope, Reply, RequestId, WorkerMessage};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize};
use serde_bytes::ByteBuf;
use sqlrelay_db::{QueryOutput, Value};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireCodec {
    #[default]
    Json,
    Msgpack,
}

impl FromStr for WireCodec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::Msgpack),
            other => Err(format!("Unsupported wire codec '{other}'")),
        }
    }
}

impl fmt::Display for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Msgpack => f.write_str("msgpack"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Command as it appears on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// SQL text for `exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
}

/// Response or init message as it appears on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Result of decoding one inbound command frame.
#[derive(Debug)]
pub enum Inbound {
    Envelope(Envelope),
    /// Well-formed frame naming an unknown command type, or carrying an
    /// unusable payload. Still answered under its id.
    Rejected {
        id: Option<RequestId>,
        failure: Failure,
    },
}

#[derive(Debug)]
pub struct DecodedCommand {
    pub inbound: Inbound,
    pub wire: WireCodec,
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Frame exceeds max size",
        ));
    }
    let size = payload.len() as u32;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn decode_wire<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<(T, WireCodec), CodecError> {
    if let Ok(value) = rmp_serde::from_slice::<T>(bytes) {
        return Ok((value, WireCodec::Msgpack));
    }
    Ok((decode_as(bytes, WireCodec::Json)?, WireCodec::Json))
}

fn encode_wire<T: Serialize>(value: &T, wire: WireCodec) -> Result<Vec<u8>, CodecError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(value).map_err(|err| CodecError::Encode(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::to_vec(value).map_err(|err| CodecError::Encode(err.to_string()))
        }
    }
}

fn take_blob(
    data: Option<ByteBuf>,
    data_b64: Option<String>,
) -> Result<Option<Vec<u8>>, String> {
    if let Some(data) = data {
        return Ok(Some(data.into_vec()));
    }
    if let Some(encoded) = data_b64 {
        return BASE64
            .decode(encoded)
            .map(Some)
            .map_err(|err| format!("Invalid data base64: {err}"));
    }
    Ok(None)
}

fn split_blob(blob: Option<&[u8]>, wire: WireCodec) -> (Option<ByteBuf>, Option<String>) {
    match (blob, wire) {
        (None, _) => (None, None),
        (Some(bytes), WireCodec::Msgpack) => (Some(ByteBuf::from(bytes.to_vec())), None),
        (Some(bytes), WireCodec::Json) => (None, Some(BASE64.encode(bytes))),
    }
}

impl WireCommand {
    fn into_inbound(self) -> Inbound {
        let id = self.id;
        let command = match self.command_type.as_str() {
            "init" | "initialize" => Command::Initialize,
            "exec" | "execute" => match self.command {
                Some(sql) => Command::Execute {
                    sql,
                    params: self.params.unwrap_or_default(),
                },
                None => {
                    return Inbound::Rejected {
                        id,
                        failure: Failure::malformed("exec without SQL text"),
                    };
                }
            },
            "export" | "exportSnapshot" => Command::ExportSnapshot,
            "import" | "importSnapshot" => match take_blob(self.data, self.data_b64) {
                Ok(data) => Command::ImportSnapshot {
                    data: data.unwrap_or_default(),
                },
                Err(reason) => {
                    return Inbound::Rejected {
                        id,
                        failure: Failure::malformed(reason),
                    };
                }
            },
            other => {
                return Inbound::Rejected {
                    id,
                    failure: Failure::unknown_command(other),
                };
            }
        };
        Inbound::Envelope(Envelope { id, command })
    }

    fn from_envelope(envelope: &Envelope, wire: WireCodec) -> Self {
        let mut out = WireCommand {
            command_type: envelope.command.name().to_string(),
            id: envelope.id.clone(),
            ..WireCommand::default()
        };
        match &envelope.command {
            Command::Initialize | Command::ExportSnapshot => {}
            Command::Execute { sql, params } => {
                out.command = Some(sql.clone());
                out.params = Some(params.clone());
            }
            Command::ImportSnapshot { data } => {
                (out.data, out.data_b64) = split_blob(Some(data), wire);
            }
        }
        out
    }
}

impl WireMessage {
    fn from_message(message: &WorkerMessage, wire: WireCodec) -> Self {
        let (message_type, id) = match message {
            WorkerMessage::Response { id, .. } => ("response", id.clone()),
            WorkerMessage::Init { id, .. } => ("init", id.clone()),
        };
        let mut out = WireMessage {
            message_type: message_type.to_string(),
            id,
            success: message.is_success(),
            ..WireMessage::default()
        };
        let failure = match message {
            WorkerMessage::Response { outcome: Ok(reply), .. } => {
                match reply {
                    Reply::Rows(output) => out.result = Some(output.clone()),
                    Reply::Snapshot(bytes) => {
                        (out.data, out.data_b64) = split_blob(Some(bytes), wire);
                    }
                    Reply::Imported | Reply::Initialized => {}
                }
                None
            }
            WorkerMessage::Init { outcome: Ok(()), .. } => None,
            WorkerMessage::Response { outcome: Err(failure), .. }
            | WorkerMessage::Init { outcome: Err(failure), .. } => Some(failure),
        };
        if let Some(failure) = failure {
            out.error = Some(failure.message.clone());
            out.error_kind = Some(failure.kind);
        }
        out
    }

    fn into_message(self) -> Result<WorkerMessage, CodecError> {
        let failure = |default_kind: ErrorKind| {
            Failure::new(
                self.error_kind.unwrap_or(default_kind),
                self.error.clone().unwrap_or_default(),
            )
        };
        match self.message_type.as_str() {
            "init" => {
                let outcome = if self.success {
                    Ok(())
                } else {
                    Err(failure(ErrorKind::LoadError))
                };
                Ok(WorkerMessage::Init {
                    id: self.id,
                    outcome,
                })
            }
            "response" => {
                let outcome = if self.success {
                    let blob = take_blob(self.data, self.data_b64).map_err(CodecError::Decode)?;
                    Ok(match (self.result, blob) {
                        (Some(output), _) => Reply::Rows(output),
                        (None, Some(bytes)) => Reply::Snapshot(bytes),
                        (None, None) => Reply::Imported,
                    })
                } else {
                    Err(failure(ErrorKind::EngineError))
                };
                Ok(WorkerMessage::Response {
                    id: self.id,
                    outcome,
                })
            }
            other => Err(CodecError::Decode(format!("Unknown message type '{other}'"))),
        }
    }
}

/// Just enough of a frame to answer it: the correlation id, read leniently.
#[derive(Debug, Default, Deserialize)]
struct WireHeader {
    #[serde(default, deserialize_with = "lenient_id")]
    id: Option<RequestId>,
}

// An id that is not a usable scalar reads as absent instead of failing the
// header.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RequestId>, D::Error> {
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(RequestId::deserialize(raw).ok())
}

fn decode_as<T: for<'de> Deserialize<'de>>(bytes: &[u8], wire: WireCodec) -> Result<T, CodecError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
        }
    }
}

/// Decodes an inbound command frame, detecting its codec.
///
/// The header is read first, so a frame whose id survives but whose payload
/// does not is still answered under that id. Only frames without a readable
/// header fail outright.
pub fn decode_command(bytes: &[u8]) -> Result<DecodedCommand, CodecError> {
    let (header, wire) = decode_wire::<WireHeader>(bytes)?;
    let inbound = match decode_as::<WireCommand>(bytes, wire) {
        Ok(command) => command.into_inbound(),
        Err(err) => Inbound::Rejected {
            id: header.id,
            failure: Failure::malformed(err),
        },
    };
    Ok(DecodedCommand { inbound, wire })
}

/// Best-effort correlation id of a frame that may not decode as a whole.
pub fn peek_id(bytes: &[u8]) -> Option<RequestId> {
    decode_wire::<WireHeader>(bytes)
        .ok()
        .and_then(|(header, _)| header.id)
}

pub fn encode_command(envelope: &Envelope, wire: WireCodec) -> Result<Vec<u8>, CodecError> {
    encode_wire(&WireCommand::from_envelope(envelope, wire), wire)
}

pub fn encode_message(message: &WorkerMessage, wire: WireCodec) -> Result<Vec<u8>, CodecError> {
    encode_wire(&WireMessage::from_message(message, wire), wire)
}

pub fn decode_message(bytes: &[u8]) -> Result<(WorkerMessage, WireCodec), CodecError> {
    let (message, wire) = decode_wire::<WireMessage>(bytes)?;
    Ok((message.into_message()?, wire))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn envelope(bytes: &[u8]) -> (Envelope, WireCodec) {
        let decoded = decode_command(bytes).expect("decode");
        match decoded.inbound {
            Inbound::Envelope(envelope) => (envelope, decoded.wire),
            Inbound::Rejected { failure, .. } => panic!("rejected: {failure}"),
        }
    }

    #[test]
    fn frames_roundtrip_and_stop_at_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one").expect("write");
        write_frame(&mut buf, b"").expect("write");
        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).expect("read"), Some(b"one".to_vec()));
        assert_eq!(read_frame(&mut reader).expect("read"), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).expect("read"), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).expect_err("too big");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_exec_reads_sql_and_params() {
        let (env, wire) =
            envelope(br#"{"type":"exec","id":"abc","command":"SELECT ?","params":[1,"x",null]}"#);
        assert_eq!(wire, WireCodec::Json);
        assert_eq!(env.id, Some(RequestId::from("abc")));
        assert_eq!(
            env.command,
            Command::execute(
                "SELECT ?",
                vec![Value::Integer(1), Value::Text("x".into()), Value::Null]
            )
        );
    }

    #[test]
    fn long_command_names_are_accepted() {
        let (env, _) = envelope(br#"{"type":"exportSnapshot","id":4}"#);
        assert_eq!(env.id, Some(RequestId::Number(4)));
        assert_eq!(env.command, Command::ExportSnapshot);
        let (env, _) = envelope(br#"{"type":"initialize"}"#);
        assert_eq!(env, Envelope::uncorrelated(Command::Initialize));
    }

    #[test]
    fn msgpack_import_carries_binary_data() {
        let sent = Envelope::new(9u64, Command::ImportSnapshot { data: vec![0, 1, 2] });
        let bytes = encode_command(&sent, WireCodec::Msgpack).expect("encode");
        let (env, wire) = envelope(&bytes);
        assert_eq!(wire, WireCodec::Msgpack);
        assert_eq!(env, sent);
    }

    #[test]
    fn json_import_reads_base64() {
        let sent = Envelope::new(2u64, Command::ImportSnapshot { data: b"image".to_vec() });
        let bytes = encode_command(&sent, WireCodec::Json).expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains("data_b64"));
        assert_eq!(envelope(&bytes).0, sent);
    }

    #[test]
    fn unknown_type_is_rejected_under_its_id() {
        let decoded = decode_command(br#"{"type":"vacuum","id":"z"}"#).expect("decode");
        match decoded.inbound {
            Inbound::Rejected { id, failure } => {
                assert_eq!(id, Some(RequestId::from("z")));
                assert_eq!(failure.kind, ErrorKind::UnknownCommand);
                assert!(failure.message.contains("vacuum"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn bad_base64_is_rejected_not_dropped() {
        let decoded =
            decode_command(br#"{"type":"import","id":1,"data_b64":"%%%"}"#).expect("decode");
        assert!(matches!(
            decoded.inbound,
            Inbound::Rejected { id: Some(RequestId::Number(1)), .. }
        ));
    }

    fn rejected_id(bytes: &[u8]) -> Option<RequestId> {
        match decode_command(bytes).expect("header decodes").inbound {
            Inbound::Rejected { id, failure } => {
                assert_eq!(failure.kind, ErrorKind::UnknownCommand);
                id
            }
            Inbound::Envelope(envelope) => panic!("accepted: {envelope:?}"),
        }
    }

    #[test]
    fn bad_payload_keeps_the_frame_id() {
        assert_eq!(
            rejected_id(br#"{"type":"exec","id":17,"command":"SELECT ?","params":[{"a":1}]}"#),
            Some(RequestId::Number(17))
        );
        assert_eq!(
            rejected_id(br#"{"type":"exec","id":"s","command":42}"#),
            Some(RequestId::from("s"))
        );
        assert_eq!(
            rejected_id(br#"{"id":"no-type","command":"SELECT 1"}"#),
            Some(RequestId::from("no-type"))
        );
        assert_eq!(rejected_id(br#"{"type":"exec","id":{"nested":1}}"#), None);
    }

    #[test]
    fn bad_msgpack_payload_keeps_the_frame_id() {
        #[derive(Serialize)]
        struct Skewed {
            #[serde(rename = "type")]
            command_type: &'static str,
            id: u64,
            command: u64,
        }
        let bytes = rmp_serde::to_vec_named(&Skewed {
            command_type: "exec",
            id: 8,
            command: 1,
        })
        .expect("encode");
        let decoded = decode_command(&bytes).expect("header decodes");
        assert_eq!(decoded.wire, WireCodec::Msgpack);
        assert!(matches!(
            decoded.inbound,
            Inbound::Rejected { id: Some(RequestId::Number(8)), .. }
        ));
    }

    #[test]
    fn signed_float_and_bool_ids_echo_back() {
        for (frame, id) in [
            (&br#"{"type":"export","id":-3}"#[..], RequestId::Signed(-3)),
            (&br#"{"type":"export","id":0.5}"#[..], RequestId::from(0.5)),
            (&br#"{"type":"export","id":true}"#[..], RequestId::Bool(true)),
        ] {
            let (env, wire) = envelope(frame);
            assert_eq!(env.id.as_ref(), Some(&id));
            let reply = WorkerMessage::Response {
                id: env.id,
                outcome: Ok(Reply::Imported),
            };
            let bytes = encode_message(&reply, wire).expect("encode");
            let (decoded, _) = decode_message(&bytes).expect("decode");
            assert_eq!(decoded.id(), Some(&id));
        }
    }

    #[test]
    fn peek_id_reads_ids_from_broken_messages() {
        assert_eq!(
            peek_id(br#"{"type":"response","id":5,"success":true,"result":"rows?"}"#),
            Some(RequestId::Number(5))
        );
        assert_eq!(peek_id(b"\xc1 junk"), None);
    }

    #[test]
    fn garbage_frame_fails_to_decode() {
        assert!(decode_command(b"\xc1not a command").is_err());
    }

    #[test]
    fn messages_survive_both_codecs() {
        let messages = vec![
            WorkerMessage::Init {
                id: None,
                outcome: Ok(()),
            },
            WorkerMessage::Response {
                id: Some(RequestId::Number(3)),
                outcome: Ok(Reply::Snapshot(vec![7, 8, 9])),
            },
            WorkerMessage::Response {
                id: Some(RequestId::from("abc")),
                outcome: Err(Failure::not_initialized()),
            },
            WorkerMessage::Response {
                id: Some(RequestId::Number(5)),
                outcome: Ok(Reply::Imported),
            },
        ];
        for wire in [WireCodec::Json, WireCodec::Msgpack] {
            for message in &messages {
                let bytes = encode_message(message, wire).expect("encode");
                let (decoded, detected) = decode_message(&bytes).expect("decode");
                assert_eq!(detected, wire);
                assert_eq!(&decoded, message);
            }
        }
    }

    #[test]
    fn json_response_shape() {
        let message = WorkerMessage::Response {
            id: Some(RequestId::Number(1)),
            outcome: Err(Failure::unknown_command("nope")),
        };
        let bytes = encode_message(&message, WireCodec::Json).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], 1);
        assert_eq!(value["success"], false);
        assert_eq!(value["error_kind"], "UnknownCommand");
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!("json".parse::<WireCodec>(), Ok(WireCodec::Json));
        assert_eq!("MsgPack".parse::<WireCodec>(), Ok(WireCodec::Msgpack));
        assert!("xml".parse::<WireCodec>().is_err());
    }
}
