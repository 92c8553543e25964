pub mod wire;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{AppError, Result};
use crate::game::{GameEvent, OutboundIntent};
use crate::models::ChatEvent;
use wire::*;

/// Everything the watcher can receive from the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Game(GameEvent),
    Chat(ChatEvent),
    ChatHistory(Vec<ChatEvent>),
    Block {
        height: i64,
        hash: String,
        time: Option<DateTime<Utc>>,
    },
    Connected,
    Disconnected,
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

// Internal helper that decodes the `data` member of a frame.
fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| AppError::MalformedPayload(format!("{event}: {e}")))
}

fn decode_tick(data: Value) -> Result<GameEvent> {
    match data {
        // Bare elapsed from older servers.
        Value::Number(_) => Ok(GameEvent::Tick {
            elapsed: payload("tick", data)?,
            cashouts: BTreeMap::new(),
        }),
        Value::Array(mut parts) if !parts.is_empty() => {
            let cashouts = if parts.len() > 1 {
                match parts.remove(1) {
                    Value::Null => BTreeMap::new(),
                    value => payload("tick", value)?,
                }
            } else {
                BTreeMap::new()
            };
            Ok(GameEvent::Tick {
                elapsed: payload("tick", parts.remove(0))?,
                cashouts,
            })
        }
        other => Err(AppError::MalformedPayload(format!(
            "tick: expected [elapsed, cashouts], got {other}"
        ))),
    }
}

// `bets` is a flat [index, username, index, username, ...] list.
fn decode_bets(data: Value) -> Result<GameEvent> {
    let items: Vec<Value> = payload("bets", data)?;
    if items.len() % 2 != 0 {
        return Err(AppError::MalformedPayload(
            "bets: odd number of entries".to_string(),
        ));
    }
    let identities = items
        .chunks(2)
        .map(|pair| match &pair[1] {
            Value::String(name) => Ok(name.clone()),
            other => Err(AppError::MalformedPayload(format!(
                "bets: expected username, got {other}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(GameEvent::Bets { identities })
}

/// Decodes one `{"event": ..., "data": ...}` frame.
pub fn decode(line: &str) -> Result<FeedEvent> {
    let frame: Frame = serde_json::from_str(line)
        .map_err(|e| AppError::MalformedPayload(format!("frame: {e}")))?;
    let Frame { event, data } = frame;

    let decoded = match event.as_str() {
        "join" => {
            let join: JoinData = payload(&event, data)?;
            FeedEvent::Game(GameEvent::Join(Box::new(join.into_snapshot()?)))
        }
        "game_starting" => {
            let starting: GameStartingData = payload(&event, data)?;
            FeedEvent::Game(GameEvent::RoundStarting {
                round_id: starting.game_id,
                time_till_start: starting.time_till_start,
                commitment: starting.server_seed_hash,
            })
        }
        "game_started" => {
            let bets = if data.is_null() {
                BTreeMap::new()
            } else {
                payload(&event, data)?
            };
            FeedEvent::Game(GameEvent::RoundStarted { bets })
        }
        "tick" | "game_tick" => FeedEvent::Game(decode_tick(data)?),
        "game_crash" => {
            let crash: GameCrashData = payload(&event, data)?;
            FeedEvent::Game(GameEvent::RoundEnded {
                secret: crash.hash,
                outcome: crash.game_crash,
                bonuses: crash.bonuses,
                forced: crash.forced,
            })
        }
        "player_bet" => {
            let bet: PlayerBetData = payload(&event, data)?;
            FeedEvent::Game(GameEvent::Bet {
                identity: bet.username,
            })
        }
        "bets" => FeedEvent::Game(decode_bets(data)?),
        "cashed_out" => {
            let cashed: CashedOutData = payload(&event, data)?;
            FeedEvent::Game(GameEvent::CashedOut {
                identity: cashed.username,
                stopped_at: cashed.stopped_at,
            })
        }
        "msg" => {
            let msg: ChatData = payload(&event, data)?;
            FeedEvent::Chat(msg.into_event()?)
        }
        "chat_join" | "chat_history" => {
            let joined: ChatJoinData = payload(&event, data)?;
            FeedEvent::ChatHistory(
                joined
                    .history
                    .into_iter()
                    .map(ChatData::into_event)
                    .collect::<Result<_>>()?,
            )
        }
        "block" => {
            let block: BlockData = payload(&event, data)?;
            FeedEvent::Block {
                height: block.height,
                hash: block.hash,
                time: block
                    .time
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            }
        }
        "connect" => FeedEvent::Connected,
        "disconnect" => FeedEvent::Disconnected,
        other => {
            return Err(AppError::MalformedPayload(format!(
                "unknown event {other:?}"
            )))
        }
    };
    Ok(decoded)
}

pub type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Newline-delimited frames read from stdin (`-`) or a file.
pub struct EventSource<R> {
    reader: R,
    // Bytes of the current line; survives a cancelled read.
    buf: Vec<u8>,
    line_no: u64,
}

impl EventSource<BoxedReader> {
    pub async fn open(location: &str) -> Result<Self> {
        let reader: BoxedReader = if location == "-" {
            Box::new(BufReader::new(tokio::io::stdin()))
        } else {
            let file = tokio::fs::File::open(location).await?;
            Box::new(BufReader::new(file))
        };
        Ok(Self::new(reader))
    }
}

impl<R: AsyncBufRead + Unpin> EventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    /// Next decodable event; `None` once the source is exhausted. Frames that
    /// are not UTF-8 or fail to decode are logged and skipped. Only a failing
    /// read ends the stream with an error.
    pub async fn next_event(&mut self) -> Result<Option<FeedEvent>> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            let raw = std::mem::take(&mut self.buf);
            self.line_no += 1;
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Skipping non UTF-8 frame on line {}: {}", self.line_no, e);
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match decode(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => tracing::warn!("Skipping frame on line {}: {}", self.line_no, e),
            }
        }
    }
}

/// Writes outbound intents as newline-delimited frames.
pub struct IntentSink<W> {
    writer: W,
}

impl IntentSink<BoxedWriter> {
    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }
}

impl<W: AsyncWrite + Unpin> IntentSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, intent: &OutboundIntent) -> Result<()> {
        let mut line = serde_json::to_vec(intent)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::JoinPhase;
    use crate::models::ChatKind;

    #[test]
    fn decodes_tick_with_inline_cashouts() {
        let event = decode(r#"{"event":"tick","data":[1520,{"steve":150}]}"#).unwrap();
        let mut cashouts = BTreeMap::new();
        cashouts.insert("steve".to_string(), 150);
        assert_eq!(
            event,
            FeedEvent::Game(GameEvent::Tick {
                elapsed: 1520,
                cashouts
            })
        );
    }

    #[test]
    fn decodes_bare_tick_and_tick_without_cashouts() {
        assert_eq!(
            decode(r#"{"event":"game_tick","data":300}"#).unwrap(),
            FeedEvent::Game(GameEvent::Tick {
                elapsed: 300,
                cashouts: BTreeMap::new()
            })
        );
        assert_eq!(
            decode(r#"{"event":"tick","data":[300]}"#).unwrap(),
            FeedEvent::Game(GameEvent::Tick {
                elapsed: 300,
                cashouts: BTreeMap::new()
            })
        );
    }

    #[test]
    fn decodes_flat_bets_list() {
        let event = decode(r#"{"event":"bets","data":[0,"alice",1,"bob"]}"#).unwrap();
        assert_eq!(
            event,
            FeedEvent::Game(GameEvent::Bets {
                identities: vec!["alice".to_string(), "bob".to_string()]
            })
        );
        assert!(decode(r#"{"event":"bets","data":[0,"alice",1]}"#).is_err());
    }

    #[test]
    fn decodes_game_crash() {
        let event = decode(
            r#"{"event":"game_crash","data":{"game_crash":199,"hash":"abc","bonuses":{"a":5},"elapsed":4000}}"#,
        )
        .unwrap();
        match event {
            FeedEvent::Game(GameEvent::RoundEnded {
                secret,
                outcome,
                bonuses,
                forced,
            }) => {
                assert_eq!(secret, "abc");
                assert_eq!(outcome, 199);
                assert_eq!(bonuses.get("a"), Some(&5));
                assert!(!forced);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ended_join_requires_crash_point() {
        let line = r#"{"event":"join","data":{"state":"ENDED","game_id":7,"last_hash":"h","created":"2026-01-01T00:00:00Z"}}"#;
        assert!(matches!(decode(line), Err(AppError::MalformedPayload(_))));
    }

    #[test]
    fn decodes_join_snapshot() {
        let line = r#"{"event":"join","data":{
            "state":"IN_PROGRESS","game_id":7,"last_hash":"prev",
            "created":"2026-01-01T00:00:00Z","elapsed":1200,
            "player_info":{"steve":{"bet":100}},"joined":["amy"],
            "username":"steve","balance_satoshis":5000,
            "table_history":[{"game_id":6,"game_crash":150,"created":"2025-12-31T23:59:00Z","hash":"prev","player_info":{}}],
            "chat":[{"type":"say","username":"amy","message":"hi","date":"2025-12-31T23:59:30Z"}]
        }}"#;
        let FeedEvent::Game(GameEvent::Join(join)) = decode(line).unwrap() else {
            panic!("expected join");
        };
        assert_eq!(join.round_id, 7);
        assert_eq!(join.phase, JoinPhase::InProgress);
        assert_eq!(join.players.len(), 2);
        assert_eq!(join.players["steve"].bet, Some(100));
        assert_eq!(join.players["amy"].bet, None);
        assert_eq!(join.balance, Some(5000));
        assert_eq!(join.history.len(), 1);
        assert_eq!(
            join.history[0].started - join.history[0].created,
            chrono::Duration::seconds(5)
        );
        assert_eq!(join.chat.len(), 1);
    }

    #[test]
    fn say_defaults_to_english_channel() {
        let event = decode(
            r#"{"event":"msg","data":{"type":"say","username":"amy","message":"hi","date":"2026-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let FeedEvent::Chat(chat) = event else {
            panic!("expected chat");
        };
        assert_eq!(
            chat.kind,
            ChatKind::Say {
                message: "hi".to_string(),
                channel: "english".to_string(),
                bot: false
            }
        );
    }

    #[test]
    fn rejects_unknown_events_and_bad_json() {
        assert!(decode(r#"{"event":"nope","data":{}}"#).is_err());
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"event":"cashed_out","data":{"username":"a"}}"#).is_err());
    }

    #[test]
    fn decodes_connection_markers() {
        assert_eq!(decode(r#"{"event":"connect"}"#).unwrap(), FeedEvent::Connected);
        assert_eq!(
            decode(r#"{"event":"disconnect","data":null}"#).unwrap(),
            FeedEvent::Disconnected
        );
    }

    #[tokio::test]
    async fn event_source_skips_malformed_lines() {
        let input = "\n{\"event\":\"bogus\"}\n{\"event\":\"game_tick\",\"data\":10}\n";
        let mut source = EventSource::new(BufReader::new(input.as_bytes()));
        let first = source.next_event().await.unwrap();
        assert!(matches!(first, Some(FeedEvent::Game(GameEvent::Tick { elapsed: 10, .. }))));
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_source_skips_invalid_utf8_lines() {
        let mut input = b"{\"event\":\"msg\",\"data\":{\"message\":\"".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\"}}\n{\"event\":\"game_tick\",\"data\":10}");
        let mut source = EventSource::new(BufReader::new(input.as_slice()));
        let first = source.next_event().await.unwrap();
        assert!(matches!(first, Some(FeedEvent::Game(GameEvent::Tick { elapsed: 10, .. }))));
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn intent_sink_writes_json_lines() {
        let mut sink = IntentSink::new(Vec::new());
        sink.send(&OutboundIntent::PlaceBet {
            amount: 100,
            auto_cashout: Some(200),
        })
        .await
        .unwrap();
        sink.send(&OutboundIntent::CashOut).await.unwrap();
        let written = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"event":"place_bet","data":{"amount":100,"auto_cashout":200}}"#
        );
        assert_eq!(lines[1], r#"{"event":"cash_out"}"#);
    }
}
