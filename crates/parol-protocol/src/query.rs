//! Request/response pairs
//!
//! The controller answers on the same socket. Replies carry no correlation
//! id, so a reply matches a query by its tag only.

use crate::telemetry::Telemetry;
use crate::{FIELD_SEP, ProtocolError};

/// Queries the supervisor issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// `PING` -> `PONG`
    Ping,
    /// `GET_STATUS` -> `STATUS|...`
    Status,
    /// `GET_LOOP_STATS` -> `LOOP_STATS|{json}`
    LoopStats,
}

impl Query {
    pub fn encode(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Status => "GET_STATUS",
            Self::LoopStats => "GET_LOOP_STATS",
        }
    }

    /// Tag of the reply answering this query.
    pub fn expected_tag(self) -> &'static str {
        match self {
            Self::Ping => "PONG",
            Self::Status => "STATUS",
            Self::LoopStats => "LOOP_STATS",
        }
    }
}

/// Controller main-loop statistics, kept as the raw JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LoopStats(pub serde_json::Map<String, serde_json::Value>);

impl LoopStats {
    /// Iterations completed by the controller loop.
    pub fn loop_count(&self) -> Option<u64> {
        self.0.get("loop_count").and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        })
    }
}

/// Decoded replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Pong,
    Status(Telemetry),
    LoopStats(LoopStats),
    /// `ACK|id|status|details`; acknowledgments of id-tagged commands.
    Ack {
        id: String,
        status: String,
        details: String,
    },
}

impl Response {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Pong => "PONG",
            Self::Status(_) => "STATUS",
            Self::LoopStats(_) => "LOOP_STATS",
            Self::Ack { .. } => "ACK",
        }
    }

    /// Whether this reply answers `query`.
    pub fn answers(&self, query: Query) -> bool {
        self.tag() == query.expected_tag()
    }

    /// Decode a raw datagram.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let (tag, rest) = text.split_once(FIELD_SEP).unwrap_or((text, ""));
        match tag {
            "PONG" => Ok(Self::Pong),
            "STATUS" => Telemetry::parse_sections(rest).map(Self::Status),
            "LOOP_STATS" => serde_json::from_str(rest)
                .map(|map| Self::LoopStats(LoopStats(map)))
                .map_err(|e| ProtocolError::InvalidField {
                    field: "LOOP_STATS",
                    reason: e.to_string(),
                }),
            "ACK" => {
                let mut parts = rest.splitn(3, FIELD_SEP);
                Ok(Self::Ack {
                    id: parts.next().unwrap_or_default().to_string(),
                    status: parts.next().unwrap_or_default().to_string(),
                    details: parts.next().unwrap_or_default().to_string(),
                })
            },
            other => Err(ProtocolError::UnknownTag {
                tag: other.to_string(),
            }),
        }
    }

    /// Decode and require the reply to answer `query`.
    pub fn decode_for(query: Query, payload: &[u8]) -> Result<Self, ProtocolError> {
        let response = Self::decode(payload)?;
        if response.answers(query) {
            Ok(response)
        } else {
            Err(ProtocolError::UnexpectedResponse {
                expected: query.expected_tag(),
                actual: response.tag().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_names() {
        assert_eq!(Query::Ping.encode(), "PING");
        assert_eq!(Query::Status.encode(), "GET_STATUS");
        assert_eq!(Query::LoopStats.expected_tag(), "LOOP_STATS");
    }

    #[test]
    fn test_decode_pong_and_status() {
        assert_eq!(Response::decode(b"PONG\n").unwrap(), Response::Pong);
        let resp = Response::decode(b"STATUS|ANGLES=1,2,3,4,5,6").unwrap();
        assert!(resp.answers(Query::Status));
        assert!(!resp.answers(Query::Ping));
    }

    #[test]
    fn test_decode_loop_stats() {
        let resp = Response::decode(br#"LOOP_STATS|{"loop_count": 1234, "hz": 99.8}"#).unwrap();
        match resp {
            Response::LoopStats(stats) => assert_eq!(stats.loop_count(), Some(1234)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Response::decode(b"LOOP_STATS|{not json").is_err());
    }

    #[test]
    fn test_decode_ack() {
        let resp = Response::decode(b"ACK|abc|COMPLETED|done|extra").unwrap();
        assert_eq!(
            resp,
            Response::Ack {
                id: "abc".into(),
                status: "COMPLETED".into(),
                details: "done|extra".into(),
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert_eq!(Response::decode(b""), Err(ProtocolError::Empty));
        assert_eq!(Response::decode(&[0xff, 0xfe]), Err(ProtocolError::NotUtf8));
        assert!(matches!(
            Response::decode(b"HELLO|x"),
            Err(ProtocolError::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_decode_for_rejects_other_replies() {
        assert!(matches!(
            Response::decode_for(Query::Status, b"PONG"),
            Err(ProtocolError::UnexpectedResponse {
                expected: "STATUS",
                ..
            })
        ));
        assert_eq!(
            Response::decode_for(Query::Ping, b"PONG").unwrap(),
            Response::Pong
        );
    }
}
