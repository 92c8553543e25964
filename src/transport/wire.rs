use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::constants::ROUND_START_DELAY_MS;
use crate::error::{AppError, Result};
use crate::game::{JoinPhase, JoinSnapshot};
use crate::models::{ChatEvent, ChatKind, RoundRecord, Wager};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayData {
    pub bet: Option<i64>,
    pub stopped_at: Option<i64>,
    pub bonus: Option<i64>,
}

fn into_players(player_info: BTreeMap<String, PlayData>) -> BTreeMap<String, Wager> {
    player_info
        .into_iter()
        .map(|(username, play)| {
            let wager = Wager {
                identity: username.clone(),
                bet: play.bet,
                stopped_at: play.stopped_at,
                bonus: play.bonus,
                joined_at: None,
            };
            (username, wager)
        })
        .collect()
}

/// Finished round as listed in `table_history` and served by
/// `{web}/game/{id}.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRoundData {
    pub game_id: i64,
    pub game_crash: i64,
    pub created: DateTime<Utc>,
    #[serde(alias = "server_seed")]
    pub hash: String,
    #[serde(default)]
    pub player_info: BTreeMap<String, PlayData>,
    #[serde(default)]
    pub forced: bool,
}

impl HistoryRoundData {
    pub fn into_record(self) -> RoundRecord {
        RoundRecord {
            id: self.game_id,
            crash_point: self.game_crash,
            secret: self.hash,
            created: self.created,
            // The web history has no start time; rounds start after the fixed delay.
            started: self.created + Duration::milliseconds(ROUND_START_DELAY_MS),
            forced: self.forced,
            players: into_players(self.player_info),
            verified: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinData {
    pub state: String,
    pub game_id: i64,
    pub last_hash: Option<String>,
    #[serde(default)]
    pub player_info: BTreeMap<String, PlayData>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub elapsed: i64,
    #[serde(default)]
    pub joined: Vec<String>,
    #[serde(default)]
    pub table_history: Vec<HistoryRoundData>,
    pub username: Option<String>,
    pub balance_satoshis: Option<i64>,
    pub game_crash: Option<i64>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub chat: Vec<ChatData>,
}

impl JoinData {
    pub fn into_snapshot(self) -> Result<JoinSnapshot> {
        let phase = match self.state.as_str() {
            "STARTING" => JoinPhase::Starting,
            "IN_PROGRESS" => JoinPhase::InProgress,
            "ENDED" => {
                let crash_point = self.game_crash.ok_or_else(|| {
                    AppError::MalformedPayload("ended join without game_crash".to_string())
                })?;
                if self.last_hash.is_none() {
                    return Err(AppError::MalformedPayload(
                        "ended join without last_hash".to_string(),
                    ));
                }
                JoinPhase::Ended {
                    crash_point,
                    forced: self.forced,
                }
            }
            other => {
                return Err(AppError::MalformedPayload(format!(
                    "unknown round state {other:?}"
                )))
            }
        };

        let mut players = into_players(self.player_info);
        for username in self.joined {
            players
                .entry(username.clone())
                .or_insert_with(|| Wager::new(username));
        }

        Ok(JoinSnapshot {
            round_id: self.game_id,
            phase,
            last_hash: self.last_hash,
            players,
            created: self.created,
            elapsed: self.elapsed,
            username: self.username,
            balance: self.balance_satoshis,
            history: self
                .table_history
                .into_iter()
                .map(HistoryRoundData::into_record)
                .collect(),
            chat: self
                .chat
                .into_iter()
                .map(ChatData::into_event)
                .collect::<Result<_>>()?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameStartingData {
    pub game_id: i64,
    #[serde(default)]
    pub time_till_start: i64,
    #[serde(alias = "hash")]
    pub server_seed_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameCrashData {
    #[serde(default)]
    pub forced: bool,
    pub game_crash: i64,
    #[serde(default)]
    pub bonuses: BTreeMap<String, i64>,
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerBetData {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CashedOutData {
    pub username: String,
    pub stopped_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub username: String,
    pub message: Option<String>,
    pub channel_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub moderator: Option<String>,
    pub timespec: Option<String>,
    #[serde(default)]
    pub shadow: bool,
    #[serde(alias = "time")]
    pub date: DateTime<Utc>,
}

// Internal helper that turns a missing field into a payload error.
fn required(value: Option<String>, field: &str, kind: &str) -> Result<String> {
    value.ok_or_else(|| AppError::MalformedPayload(format!("{kind} message without {field}")))
}

impl ChatData {
    pub fn into_event(self) -> Result<ChatEvent> {
        let kind = match self.kind.as_str() {
            "say" => ChatKind::Say {
                message: required(self.message, "message", "say")?,
                channel: self.channel_name.unwrap_or_else(|| "english".to_string()),
                bot: self.bot,
            },
            "mute" => ChatKind::Mute {
                moderator: required(self.moderator, "moderator", "mute")?,
                timespec: required(self.timespec, "timespec", "mute")?,
                shadow: self.shadow,
            },
            "unmute" => ChatKind::Unmute {
                moderator: required(self.moderator, "moderator", "unmute")?,
                shadow: self.shadow,
            },
            "info" => ChatKind::Info {
                message: self.message.unwrap_or_default(),
            },
            "error" => ChatKind::Error {
                message: self.message.unwrap_or_default(),
            },
            other => {
                return Err(AppError::MalformedPayload(format!(
                    "unknown chat message type {other:?}"
                )))
            }
        };
        Ok(ChatEvent {
            username: self.username,
            created: self.date,
            kind,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatJoinData {
    #[serde(default)]
    pub history: Vec<ChatData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockData {
    pub height: i64,
    pub hash: String,
    /// Unix seconds.
    pub time: Option<i64>,
}
