//! Worker wire protocol
//!
//! Newline-delimited JSON between a parent and a `pdf-dispatch worker`
//! child process:
//!
//! ```text
//!   parent ─▶ child   {"id":7,"body":{"Call":{"GetPageCount":{...}}}}
//!                     {"id":8,"body":"Ping"}
//!   child ─▶ parent   {"id":7,"outcome":{"Ok":{"GetPageCount":{"page_count":3}}}}
//!                     {"id":8,"outcome":"Pong"}
//! ```
//!
//! Ids let the parent drop replies for calls it already gave up on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Request, Response};
use crate::error::{DispatchError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub enum WireBody {
    Call(Request),
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub body: WireBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Ok(Response),
    Err(DispatchError),
    Pong,
}

impl From<Result<Response>> for Outcome {
    fn from(result: Result<Response>) -> Self {
        match result {
            Ok(response) => Self::Ok(response),
            Err(err) => Self::Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReply {
    pub id: u64,
    pub outcome: Outcome,
}

/// Encode one message as a JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| DispatchError::InvalidRequest(format!("encode failed: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| DispatchError::InvalidRequest(format!("decode failed: {e}")))
}

/// `null`-tolerant sequence decoding
///
/// Used with `#[serde(default, deserialize_with = "seq::deserialize")]` so
/// absent and `null` collections both decode to an empty `Vec`.
pub(crate) mod seq {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::responses;

    #[test]
    fn test_reply_line_shape() {
        let reply = WireReply {
            id: 7,
            outcome: Outcome::Ok(Response::GetPageCount(responses::GetPageCount {
                page_count: 3,
            })),
        };
        let line = encode_line(&reply).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            line.trim_end(),
            r#"{"id":7,"outcome":{"Ok":{"GetPageCount":{"page_count":3}}}}"#
        );
        assert_eq!(decode_line::<WireReply>(&line).unwrap(), reply);
    }

    #[test]
    fn test_ping_and_error_lines() {
        let ping: WireRequest = decode_line(r#"{"id":1,"body":"Ping"}"#).unwrap();
        assert!(matches!(ping.body, WireBody::Ping));

        let reply: WireReply =
            decode_line(r#"{"id":2,"outcome":{"Err":{"Timeout":{"secs":1,"nanos":0}}}}"#).unwrap();
        assert!(matches!(reply.outcome, Outcome::Err(DispatchError::Timeout(_))));
    }

    #[test]
    fn test_null_annotations_over_wire() {
        let reply: WireReply =
            decode_line(r#"{"id":3,"outcome":{"Ok":{"GetAnnotations":{"annotations":null}}}}"#)
                .unwrap();
        match reply.outcome {
            Outcome::Ok(Response::GetAnnotations(response)) => {
                assert!(response.annotations.is_empty())
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_garbage_line_is_error() {
        assert!(decode_line::<WireReply>("not json").is_err());
    }
}
