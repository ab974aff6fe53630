//! # Redis
//!
//! Production store.
//!
//! ## Keys
//! - `voter:{id}` hash: id, token_hash, created_at, last_active_at, source_ip, vote_count
//! - `voter_tokens` hash: token hash to voter id
//! - `rate:{ip}` hash: count, window_start (unix millis), expires after two windows
//! - `votes:{question}` hash: voter id to vote id, the uniqueness constraint
//! - `vote:{id}` string: vote JSON
//! - `xp:{voter}` list: ledger entry JSON, append-only
//! - `xp_awards:{voter}` hash: `{action}:{question}` to `{xp}:{vote_number}`, makes awards idempotent
//! - `streak:{voter}` hash: current, longest, last_day (days since the common era)
//! - `job_done:{vote}` string: processed marker, expires after a week
//! - `question:{id}` string: question JSON
//! - `stats` / `stats_updated` hashes: counter values and last update millis
//!
//! ## Atomicity
//! Anything that has to be all-or-nothing is a Lua script. Redis runs a script
//! to completion before serving any other command, so two app instances racing
//! on the same voter or IP are serialized here.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use uuid::Uuid;

use crate::{
    database::Store,
    error::StoreError,
    models::{
        AggregateStat, Question, RateLimitWindow, Streak, VoteResponse, VoterIdentity,
        XpAward, XpLedgerEntry,
    },
    rate_limit::RatePolicy,
    stats::StatUpdate,
    xp::{TOP_TIER_XP, XP_SCHEDULE},
};

const VOTER_TOKENS: &str = "voter_tokens";
const STATS: &str = "stats";
const STATS_UPDATED: &str = "stats_updated";
const JOB_MARKER_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// KEYS: rate. ARGV: now_ms, window_ms, budget, ip.
// Returns {ok, count, window_start}.
const CONSUME_RATE: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
local start = tonumber(redis.call('HGET', KEYS[1], 'window_start') or ARGV[1])

if now > start + window then
    count = 0
    start = now
end

if count >= tonumber(ARGV[3]) then
    return {0, count, start}
end

redis.call('HSET', KEYS[1], 'count', count + 1, 'window_start', start, 'ip', ARGV[4])
redis.call('PEXPIRE', KEYS[1], window * 2)
return {1, count + 1, start}
"#;

// KEYS: rate, votes:{question}, vote:{id}.
// ARGV: now_ms, window_ms, budget, ip, voter_id, vote_id, vote_json.
// Returns {status, count, window_start}, status -1 duplicate, 0 exhausted, 1 stored.
const COMMIT_VOTE: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[5]) == 1 then
    return {-1, 0, 0}
end

local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
local start = tonumber(redis.call('HGET', KEYS[1], 'window_start') or ARGV[1])

if now > start + window then
    count = 0
    start = now
end

if count >= tonumber(ARGV[3]) then
    return {0, count, start}
end

redis.call('HSET', KEYS[1], 'count', count + 1, 'window_start', start, 'ip', ARGV[4])
redis.call('PEXPIRE', KEYS[1], window * 2)
redis.call('HSET', KEYS[2], ARGV[5], ARGV[6])
redis.call('SET', KEYS[3], ARGV[7])
return {1, count + 1, start}
"#;

// KEYS: voter:{id}, xp:{id}, xp_awards:{id}.
// ARGV: award_field, entry_id, voter_id, action, question_id, created_at,
//       top_tier_xp, then (upper_bound, xp) pairs.
// Returns {found, xp, total, vote_number, newly_recorded}.
const RECORD_XP: &str = r#"
local function ledger_total()
    local total = 0
    for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
        total = total + cjson.decode(raw)['xp_amount']
    end
    return total
end

local existing = redis.call('HGET', KEYS[3], ARGV[1])
if existing then
    local sep = string.find(existing, ':', 1, true)
    local xp = tonumber(string.sub(existing, 1, sep - 1))
    local vote_number = tonumber(string.sub(existing, sep + 1))
    return {1, xp, ledger_total(), vote_number, 0}
end

if redis.call('EXISTS', KEYS[1]) == 0 then
    return {0, 0, 0, 0, 0}
end

local vote_number = redis.call('HINCRBY', KEYS[1], 'vote_count', 1)
local xp = tonumber(ARGV[7])
for i = 8, #ARGV, 2 do
    if vote_number <= tonumber(ARGV[i]) then
        xp = tonumber(ARGV[i + 1])
        break
    end
end

redis.call('RPUSH', KEYS[2], cjson.encode({
    id = ARGV[2],
    voter_identity_id = ARGV[3],
    action_type = ARGV[4],
    xp_amount = xp,
    source_question_id = ARGV[5],
    created_at = ARGV[6],
}))
redis.call('HSET', KEYS[3], ARGV[1], xp .. ':' .. vote_number)

return {1, xp, ledger_total(), vote_number, 1}
"#;

// KEYS: streak. ARGV: day.
// Same or earlier days leave the streak as it is.
// Returns {current, longest, last_day}.
const RECORD_ACTIVITY: &str = r#"
local day = tonumber(ARGV[1])
local stored = redis.call('HMGET', KEYS[1], 'current', 'longest', 'last_day')
local last = tonumber(stored[3])

if last and day <= last then
    return {tonumber(stored[1]), tonumber(stored[2]), last}
end

local current = 1
local longest = 1
if last then
    if day == last + 1 then
        current = tonumber(stored[1]) + 1
    end
    longest = math.max(tonumber(stored[2]), current)
end

redis.call('HSET', KEYS[1], 'current', current, 'longest', longest, 'last_day', day)
return {current, longest, day}
"#;

// KEYS: stats, stats_updated. ARGV: now_ms, then (key, mode, amount, delta) quads.
// Returns the resulting values in order.
const APPLY_STATS: &str = r#"
local values = {}
for i = 2, #ARGV, 4 do
    local key = ARGV[i]
    if ARGV[i + 1] == 'set' then
        redis.call('HSET', KEYS[1], key, ARGV[i + 2])
    end
    local value = redis.call('HINCRBY', KEYS[1], key, ARGV[i + 3])
    redis.call('HSET', KEYS[2], key, ARGV[1])
    table.insert(values, value)
end
return values
"#;

fn voter_key(voter_id: Uuid) -> String {
    format!("voter:{voter_id}")
}

fn rate_key(source_ip: &str) -> String {
    format!("rate:{source_ip}")
}

fn votes_key(question_id: &str) -> String {
    format!("votes:{question_id}")
}

fn vote_key(vote_id: Uuid) -> String {
    format!("vote:{vote_id}")
}

fn xp_key(voter_id: Uuid) -> String {
    format!("xp:{voter_id}")
}

fn xp_awards_key(voter_id: Uuid) -> String {
    format!("xp_awards:{voter_id}")
}

fn streak_key(voter_id: Uuid) -> String {
    format!("streak:{voter_id}")
}

fn job_key(vote_id: Uuid) -> String {
    format!("job_done:{vote_id}")
}

fn question_key(question_id: &str) -> String {
    format!("question:{question_id}")
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {millis}")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("missing field {name}")))
}

fn parse_voter(fields: &HashMap<String, String>) -> Result<VoterIdentity, StoreError> {
    let id = Uuid::parse_str(field(fields, "id")?)
        .map_err(|e| StoreError::Corrupt(format!("bad voter id: {e}")))?;
    let vote_count = field(fields, "vote_count")?
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("bad vote count: {e}")))?;

    Ok(VoterIdentity {
        id,
        token_hash: field(fields, "token_hash")?.to_string(),
        created_at: parse_time(field(fields, "created_at")?)?,
        last_active_at: parse_time(field(fields, "last_active_at")?)?,
        source_ip: field(fields, "source_ip")?.to_string(),
        vote_count,
    })
}

fn window_from_reply(
    source_ip: &str,
    count: i64,
    window_start: i64,
) -> Result<RateLimitWindow, StoreError> {
    Ok(RateLimitWindow {
        source_ip: source_ip.to_string(),
        request_count: count.max(0) as u32,
        window_start: from_millis(window_start)?,
    })
}

fn streak_from_reply(
    voter_id: Uuid,
    current: i64,
    longest: i64,
    last_day: i32,
) -> Result<Streak, StoreError> {
    let last_active_day = NaiveDate::from_num_days_from_ce_opt(last_day)
        .ok_or_else(|| StoreError::Corrupt(format!("bad streak day {last_day}")))?;

    Ok(Streak {
        voter_identity_id: voter_id,
        current_streak: current.max(0) as u32,
        longest_streak: longest.max(0) as u32,
        last_active_day,
    })
}

pub struct RedisStore {
    connection: ConnectionManager,
    consume_rate: Script,
    commit_vote: Script,
    record_xp: Script,
    record_activity: Script,
    apply_stats: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            consume_rate: Script::new(CONSUME_RATE),
            commit_vote: Script::new(COMMIT_VOTE),
            record_xp: Script::new(RECORD_XP),
            record_activity: Script::new(RECORD_ACTIVITY),
            apply_stats: Script::new(APPLY_STATS),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn fetch_question(&self, question_id: &str) -> Result<Option<Question>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(question_key(question_id)).await?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn upsert_question(&self, question: &Question) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(question)?;

        let _: () = conn.set(question_key(&question.id), raw).await?;
        Ok(())
    }

    async fn find_voter_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<VoterIdentity>, StoreError> {
        let mut conn = self.connection.clone();
        let voter_id: Option<String> = conn.hget(VOTER_TOKENS, token_hash).await?;

        let Some(voter_id) = voter_id else {
            return Ok(None);
        };
        let voter_id = Uuid::parse_str(&voter_id)
            .map_err(|e| StoreError::Corrupt(format!("bad voter id in token index: {e}")))?;

        self.fetch_voter(voter_id).await
    }

    async fn fetch_voter(&self, voter_id: Uuid) -> Result<Option<VoterIdentity>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(voter_key(voter_id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        parse_voter(&fields).map(Some)
    }

    async fn insert_voter(&self, voter: &VoterIdentity) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let fields = [
            ("id", voter.id.to_string()),
            ("token_hash", voter.token_hash.clone()),
            ("created_at", voter.created_at.to_rfc3339()),
            ("last_active_at", voter.last_active_at.to_rfc3339()),
            ("source_ip", voter.source_ip.clone()),
            ("vote_count", voter.vote_count.to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(voter_key(voter.id), &fields)
            .ignore()
            .hset(VOTER_TOKENS, &voter.token_hash, voter.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn touch_voter(
        &self,
        voter_id: Uuid,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let fields = [
            ("last_active_at", now.to_rfc3339()),
            ("source_ip", source_ip.to_string()),
        ];

        let _: () = conn.hset_multiple(voter_key(voter_id), &fields).await?;
        Ok(())
    }

    async fn rate_window(&self, source_ip: &str) -> Result<Option<RateLimitWindow>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(rate_key(source_ip)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let count = field(&fields, "count")?
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad rate count: {e}")))?;
        let start = field(&fields, "window_start")?
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad window start: {e}")))?;

        window_from_reply(source_ip, count, start).map(Some)
    }

    async fn consume_rate(
        &self,
        source_ip: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.consume_rate.prepare_invoke();
        invocation
            .key(rate_key(source_ip))
            .arg(now.timestamp_millis())
            .arg(policy.window.num_milliseconds())
            .arg(policy.budget)
            .arg(source_ip);

        let (ok, count, start): (i64, i64, i64) = invocation.invoke_async(&mut conn).await?;
        let window = window_from_reply(source_ip, count, start)?;

        if ok == 0 {
            return Err(StoreError::BudgetExhausted {
                reset_at: policy.reset_at(&window),
            });
        }

        Ok(window)
    }

    async fn has_vote(&self, voter_id: Uuid, question_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn
            .hexists(votes_key(question_id), voter_id.to_string())
            .await?;

        Ok(exists)
    }

    async fn commit_vote(
        &self,
        vote: &VoteResponse,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(vote)?;

        let mut invocation = self.commit_vote.prepare_invoke();
        invocation
            .key(rate_key(&vote.source_ip))
            .key(votes_key(&vote.question_id))
            .key(vote_key(vote.id))
            .arg(now.timestamp_millis())
            .arg(policy.window.num_milliseconds())
            .arg(policy.budget)
            .arg(&vote.source_ip)
            .arg(vote.voter_identity_id.to_string())
            .arg(vote.id.to_string())
            .arg(raw);

        let (status, count, start): (i64, i64, i64) = invocation.invoke_async(&mut conn).await?;

        match status {
            -1 => Err(StoreError::Duplicate),
            0 => {
                let window = window_from_reply(&vote.source_ip, count, start)?;
                Err(StoreError::BudgetExhausted {
                    reset_at: policy.reset_at(&window),
                })
            }
            _ => window_from_reply(&vote.source_ip, count, start),
        }
    }

    async fn record_xp(
        &self,
        voter_id: Uuid,
        question_id: &str,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> Result<XpAward, StoreError> {
        let mut conn = self.connection.clone();

        let mut invocation = self.record_xp.prepare_invoke();
        invocation
            .key(voter_key(voter_id))
            .key(xp_key(voter_id))
            .key(xp_awards_key(voter_id))
            .arg(format!("{action_type}:{question_id}"))
            .arg(Uuid::new_v4().to_string())
            .arg(voter_id.to_string())
            .arg(action_type)
            .arg(question_id)
            .arg(now.to_rfc3339())
            .arg(TOP_TIER_XP);
        for (upper, xp) in XP_SCHEDULE {
            invocation.arg(upper).arg(xp);
        }

        let (found, xp_awarded, total_xp, vote_number, newly): (i64, i64, i64, i64, i64) =
            invocation.invoke_async(&mut conn).await?;

        if found == 0 {
            return Err(StoreError::Corrupt(format!("unknown voter {voter_id}")));
        }

        Ok(XpAward {
            xp_awarded,
            total_xp,
            vote_number: vote_number.max(0) as u64,
            newly_recorded: newly == 1,
        })
    }

    async fn xp_entries(&self, voter_id: Uuid) -> Result<Vec<XpLedgerEntry>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.lrange(xp_key(voter_id), 0, -1).await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    async fn record_activity(
        &self,
        voter_id: Uuid,
        day: NaiveDate,
    ) -> Result<Streak, StoreError> {
        let mut conn = self.connection.clone();

        let mut invocation = self.record_activity.prepare_invoke();
        invocation
            .key(streak_key(voter_id))
            .arg(day.num_days_from_ce());

        let (current, longest, last_day): (i64, i64, i32) =
            invocation.invoke_async(&mut conn).await?;

        streak_from_reply(voter_id, current, longest, last_day)
    }

    async fn mark_job_processed(&self, vote_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();

        let marked: Option<String> = redis::cmd("SET")
            .arg(job_key(vote_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(JOB_MARKER_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        Ok(marked.is_some())
    }

    async fn load_stat(&self, key: &str) -> Result<Option<AggregateStat>, StoreError> {
        let mut conn = self.connection.clone();

        let (value, updated): (Option<i64>, Option<i64>) = redis::pipe()
            .hget(STATS, key)
            .hget(STATS_UPDATED, key)
            .query_async(&mut conn)
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };

        Ok(Some(AggregateStat {
            key: key.to_string(),
            value,
            last_updated: from_millis(updated.unwrap_or(0))?,
        }))
    }

    async fn apply_stats(
        &self,
        batch: &[(String, StatUpdate)],
        now: DateTime<Utc>,
    ) -> Result<Vec<AggregateStat>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();

        let mut invocation = self.apply_stats.prepare_invoke();
        invocation
            .key(STATS)
            .key(STATS_UPDATED)
            .arg(now.timestamp_millis());
        for (key, update) in batch {
            let (mode, amount) = match update.set {
                Some(value) => ("set", value),
                None => ("incr", 0),
            };
            invocation.arg(key).arg(mode).arg(amount).arg(update.delta);
        }

        let values: Vec<i64> = invocation.invoke_async(&mut conn).await?;

        if values.len() != batch.len() {
            return Err(StoreError::Corrupt(format!(
                "stats script returned {} values for {} keys",
                values.len(),
                batch.len()
            )));
        }

        Ok(batch
            .iter()
            .zip(values)
            .map(|((key, _), value)| AggregateStat {
                key: key.clone(),
                value,
                last_updated: now,
            })
            .collect())
    }
}
