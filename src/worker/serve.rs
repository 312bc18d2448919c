//! Child side of the wire protocol
//!
//! Reads one request per line, executes it on the session and writes one
//! reply per line. Returns at end of input, or after replying to the call
//! that made the engine unusable.

use std::io::{BufRead, Write};

use serde::Deserialize;

use super::Session;
use crate::error::DispatchError;
use crate::protocol::wire::{self, Outcome, WireBody, WireReply, WireRequest};

/// Just the id of a request whose body did not decode
#[derive(Deserialize)]
struct RequestId {
    id: u64,
}

pub fn serve<R: BufRead, W: Write>(
    session: &mut Session,
    input: R,
    mut output: W,
) -> std::io::Result<()> {
    tracing::info!(engine = session.engine_name(), "serving worker protocol");

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = match wire::decode_line::<WireRequest>(&line) {
            Ok(WireRequest {
                id,
                body: WireBody::Ping,
            }) => WireReply {
                id,
                outcome: Outcome::Pong,
            },
            Ok(WireRequest {
                id,
                body: WireBody::Call(request),
            }) => WireReply {
                id,
                outcome: session.execute(request).into(),
            },
            Err(err) => {
                let Ok(RequestId { id }) = serde_json::from_str(&line) else {
                    tracing::error!(error = %err, "unreadable request line");
                    continue;
                };
                WireReply {
                    id,
                    outcome: Outcome::Err(err),
                }
            }
        };

        let encoded = wire::encode_line(&reply).or_else(|err| {
            wire::encode_line(&WireReply {
                id: reply.id,
                outcome: Outcome::Err(DispatchError::InvalidRequest(err.to_string())),
            })
        });
        match encoded {
            Ok(encoded) => {
                output.write_all(encoded.as_bytes())?;
                output.flush()?;
            }
            Err(err) => tracing::error!(id = reply.id, error = %err, "cannot encode reply"),
        }

        if let Some(reason) = session.fatal() {
            tracing::error!(reason = %reason, "engine unusable, worker exiting");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::engine::testing::{FakeControl, FakeEngine, Fixture};
    use crate::engine::NativeFailure;
    use crate::error::ErrorKind;
    use crate::protocol::{requests, Request, Response};

    fn session() -> (Arc<FakeControl>, Session) {
        let control = FakeControl::new();
        let engine = FakeEngine::new(Arc::clone(&control));
        (control, Session::new(Box::new(engine)))
    }

    fn call_line(id: u64, request: Request) -> String {
        wire::encode_line(&WireRequest {
            id,
            body: WireBody::Call(request),
        })
        .unwrap()
    }

    fn replies(output: Vec<u8>) -> Vec<WireReply> {
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| wire::decode_line(line).unwrap())
            .collect()
    }

    #[test]
    fn test_serves_ping_and_calls() {
        let (_, mut session) = session();
        let mut input = String::from("{\"id\":1,\"body\":\"Ping\"}\n");
        input.push_str(&call_line(
            2,
            requests::OpenDocument {
                source: Fixture::with_pages(4).source(),
                password: None,
            }
            .into(),
        ));

        let mut output = Vec::new();
        serve(&mut session, Cursor::new(input), &mut output).unwrap();

        let replies = replies(output);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].outcome, Outcome::Pong);
        assert_eq!(replies[1].id, 2);
        assert!(matches!(
            replies[1].outcome,
            Outcome::Ok(Response::OpenDocument(_))
        ));
        assert_eq!(session.document_count(), 1);
    }

    #[test]
    fn test_bad_body_answers_with_error() {
        let (_, mut session) = session();
        let input = "{\"id\":5,\"body\":{\"Call\":{\"NoSuchOperation\":{}}}}\nnot json\n";

        let mut output = Vec::new();
        serve(&mut session, Cursor::new(input), &mut output).unwrap();

        let replies = replies(output);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 5);
        match &replies[0].outcome {
            Outcome::Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidRequest),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_stops_after_fatal() {
        let (control, mut session) = session();
        let open = call_line(
            1,
            requests::OpenDocument {
                source: Fixture::with_pages(1).source(),
                password: None,
            }
            .into(),
        );
        let mut output = Vec::new();
        serve(&mut session, Cursor::new(open), &mut output).unwrap();

        control.fail_next(NativeFailure::Fatal("engine lost".into()));
        let second = call_line(
            2,
            requests::CreateDocument {}.into(),
        ) + &call_line(3, requests::CreateDocument {}.into());
        let mut output = Vec::new();
        serve(&mut session, Cursor::new(second), &mut output).unwrap();

        let replies = replies(output);
        assert_eq!(replies.len(), 1);
        match &replies[0].outcome {
            Outcome::Err(err) => assert_eq!(err.kind(), ErrorKind::WorkerUnavailable),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
