//! The SQLite store and its contract implementations.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use relay_chat::{
    BalanceStatus, ChatStore, ChatStoreError, Conversation, NewChatMessage, StoredMessage,
    UserBalance,
};
use relay_core::{current_unix_timestamp_ms, ids::random_id};
use relay_provider::MessageRole;
use relay_usage::{UsageRecord, UsageStore, UsageStoreError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::schema::SCHEMA;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// A registered account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub created_at_unix_ms: u64,
}

/// An issued API token.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub token: String,
    pub model_whitelist: Option<Vec<String>>,
}

/// What a bearer token resolves to on the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenIdentity {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub username: String,
    pub model_whitelist: Option<Vec<String>>,
}

/// SQLite-backed store; one connection serialised behind a mutex.
pub struct Store {
    connection: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        Self::initialise(connection, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;
        Self::initialise(connection, None)
    }

    fn initialise(connection: Connection, path: Option<&Path>) -> Result<Self, StoreError> {
        connection.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        connection.execute_batch(SCHEMA)?;
        if let Some(path) = path {
            info!(path = %path.display(), "store opened");
        }
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
    ) -> Result<User, StoreError> {
        let now = current_unix_timestamp_ms();
        let connection = self.connection.lock().expect("store lock poisoned");
        connection.execute(
            "INSERT INTO users (username, email, created_at_unix_ms) VALUES (?1, ?2, ?3)",
            params![username, email, now as i64],
        )?;
        Ok(User {
            id: connection.last_insert_rowid(),
            username: username.to_string(),
            email: email.map(str::to_string),
            created_at_unix_ms: now,
        })
    }

    /// Issues a bearer token in the `rk-` namespace.
    pub fn create_token(
        &self,
        user_id: i64,
        name: &str,
        model_whitelist: Option<&[String]>,
    ) -> Result<ApiToken, StoreError> {
        let token = format!("rk-{}", random_id(40));
        let whitelist_json = model_whitelist
            .map(|models| serde_json::to_string(models).unwrap_or_else(|_| "[]".to_string()));
        let connection = self.connection.lock().expect("store lock poisoned");
        connection.execute(
            "INSERT INTO api_tokens (user_id, name, token, model_whitelist, created_at_unix_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                name,
                token,
                whitelist_json,
                current_unix_timestamp_ms() as i64
            ],
        )?;
        Ok(ApiToken {
            id: connection.last_insert_rowid(),
            user_id,
            name: name.to_string(),
            token,
            model_whitelist: model_whitelist.map(<[String]>::to_vec),
        })
    }

    /// Resolves a bearer token to its owning identity.
    pub fn lookup_token(&self, token: &str) -> Result<Option<TokenIdentity>, StoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        let row = connection
            .query_row(
                "SELECT t.id, t.name, t.model_whitelist, u.id, u.username
                 FROM api_tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.token = ?1",
                params![token],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((token_id, token_name, whitelist_json, user_id, username)) = row else {
            return Ok(None);
        };
        let model_whitelist = match whitelist_json {
            Some(raw) => Some(
                serde_json::from_str::<Vec<String>>(&raw)
                    .map_err(|error| StoreError::Corrupt(format!("model whitelist: {error}")))?,
            ),
            None => None,
        };
        Ok(Some(TokenIdentity {
            token_id,
            token_name,
            user_id,
            username,
            model_whitelist,
        }))
    }

    pub fn create_conversation(
        &self,
        owner_id: i64,
        model: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let now = current_unix_timestamp_ms();
        let connection = self.connection.lock().expect("store lock poisoned");
        connection.execute(
            "INSERT INTO conversations (owner_id, model, system_prompt, created_at_unix_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner_id, model, system_prompt, now as i64],
        )?;
        Ok(Conversation {
            id: connection.last_insert_rowid(),
            owner_id,
            model: model.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            created_at_unix_ms: now,
        })
    }

    /// Admin/billing plane: overwrite a user's balance row.
    pub fn set_balance(
        &self,
        user_id: i64,
        balance: f64,
        status: BalanceStatus,
    ) -> Result<(), StoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        connection.execute(
            "INSERT INTO balances (user_id, balance, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance,
                                                status = excluded.status",
            params![user_id, balance, balance_status_str(status)],
        )?;
        Ok(())
    }

    /// Row count over the usage history; status plane and tests.
    pub fn usage_record_count(&self) -> Result<usize, StoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Aggregate rows as `(user, model, date, total_tokens, request_count)`.
    pub fn usage_aggregate_rows(
        &self,
    ) -> Result<Vec<(i64, String, String, u64, u64)>, StoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        let mut statement = connection.prepare(
            "SELECT user_id, model, usage_date, total_tokens, request_count
             FROM usage_aggregates ORDER BY user_id, model, usage_date",
        )?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? as u64,
                    row.get::<_, i64>(4)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn balance_status_str(status: BalanceStatus) -> &'static str {
    match status {
        BalanceStatus::Active => "active",
        BalanceStatus::Exhausted => "exhausted",
    }
}

fn parse_balance_status(raw: &str) -> BalanceStatus {
    match raw {
        "exhausted" => BalanceStatus::Exhausted,
        _ => BalanceStatus::Active,
    }
}

fn chat_err(error: impl std::fmt::Display) -> ChatStoreError {
    ChatStoreError::Backend(error.to_string())
}

impl ChatStore for Store {
    fn ensure_user_balance(&self, user_id: i64) -> Result<UserBalance, ChatStoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        connection
            .execute(
                "INSERT OR IGNORE INTO balances (user_id, balance, status)
                 VALUES (?1, 0, 'active')",
                params![user_id],
            )
            .map_err(chat_err)?;
        let (balance, status) = connection
            .query_row(
                "SELECT balance, status FROM balances WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(chat_err)?;
        Ok(UserBalance {
            balance,
            status: parse_balance_status(&status),
        })
    }

    fn get_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Option<Conversation>, ChatStoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        connection
            .query_row(
                "SELECT id, owner_id, model, system_prompt, created_at_unix_ms
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        model: row.get(2)?,
                        system_prompt: row.get(3)?,
                        created_at_unix_ms: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()
            .map_err(chat_err)
    }

    fn list_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<StoredMessage>, ChatStoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        let mut statement = connection
            .prepare(
                "SELECT id, conversation_id, role, content, prompt_tokens, completion_tokens,
                        cost, created_at_unix_ms
                 FROM chat_messages WHERE conversation_id = ?1 ORDER BY id",
            )
            .map_err(chat_err)?;
        let rows = statement
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(chat_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(chat_err)?;

        rows.into_iter()
            .map(
                |(id, conversation_id, role, content, prompt, completion, cost, created)| {
                    let role = MessageRole::from_str(&role)
                        .map_err(|error| ChatStoreError::Backend(error.to_string()))?;
                    Ok(StoredMessage {
                        id,
                        conversation_id,
                        role,
                        content,
                        prompt_tokens: prompt as u64,
                        completion_tokens: completion as u64,
                        cost,
                        created_at_unix_ms: created as u64,
                    })
                },
            )
            .collect()
    }

    fn insert_chat_message(
        &self,
        message: NewChatMessage,
    ) -> Result<StoredMessage, ChatStoreError> {
        let now = current_unix_timestamp_ms();
        let connection = self.connection.lock().expect("store lock poisoned");
        connection
            .execute(
                "INSERT INTO chat_messages
                     (conversation_id, role, content, prompt_tokens, completion_tokens,
                      cost, created_at_unix_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.conversation_id,
                    message.role.as_str(),
                    message.content,
                    message.prompt_tokens as i64,
                    message.completion_tokens as i64,
                    message.cost,
                    now as i64
                ],
            )
            .map_err(chat_err)?;
        Ok(StoredMessage {
            id: connection.last_insert_rowid(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            prompt_tokens: message.prompt_tokens,
            completion_tokens: message.completion_tokens,
            cost: message.cost,
            created_at_unix_ms: now,
        })
    }
}

fn usage_err(error: impl std::fmt::Display) -> UsageStoreError {
    UsageStoreError(error.to_string())
}

impl UsageStore for Store {
    fn insert_usage_records(&self, records: &[UsageRecord]) -> Result<(), UsageStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.lock().expect("store lock poisoned");
        let transaction = connection.transaction().map_err(usage_err)?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO usage_records
                         (user_id, username, token_id, token_name, model, prompt_tokens,
                          completion_tokens, total_tokens, cursor_session, status_code,
                          error_message, request_time_unix_ms, response_time_unix_ms,
                          duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(usage_err)?;
            for record in records {
                statement
                    .execute(params![
                        record.user_id,
                        record.username,
                        record.token_id,
                        record.token_name,
                        record.model,
                        record.prompt_tokens as i64,
                        record.completion_tokens as i64,
                        record.total_tokens as i64,
                        record.cursor_session,
                        record.status_code,
                        record.error_message,
                        record.request_time_unix_ms as i64,
                        record.response_time_unix_ms as i64,
                        record.duration_ms as i64,
                    ])
                    .map_err(usage_err)?;
            }
        }
        transaction.commit().map_err(usage_err)
    }

    fn preserve_usage_aggregates(&self, cutoff_unix_ms: u64) -> Result<(), UsageStoreError> {
        let mut connection = self.connection.lock().expect("store lock poisoned");
        let transaction = connection.transaction().map_err(usage_err)?;
        // Fold unpreserved out-of-retention rows into the aggregate table,
        // then mark them so a re-run never double-counts.
        transaction
            .execute(
                "INSERT INTO usage_aggregates
                     (user_id, model, usage_date, prompt_tokens, completion_tokens,
                      total_tokens, request_count)
                 SELECT user_id, model,
                        date(request_time_unix_ms / 1000, 'unixepoch'),
                        SUM(prompt_tokens), SUM(completion_tokens), SUM(total_tokens),
                        COUNT(*)
                 FROM usage_records
                 WHERE request_time_unix_ms < ?1 AND preserved = 0
                 GROUP BY user_id, model, date(request_time_unix_ms / 1000, 'unixepoch')
                 ON CONFLICT(user_id, model, usage_date) DO UPDATE SET
                     prompt_tokens = usage_aggregates.prompt_tokens + excluded.prompt_tokens,
                     completion_tokens =
                         usage_aggregates.completion_tokens + excluded.completion_tokens,
                     total_tokens = usage_aggregates.total_tokens + excluded.total_tokens,
                     request_count = usage_aggregates.request_count + excluded.request_count",
                params![cutoff_unix_ms as i64],
            )
            .map_err(usage_err)?;
        transaction
            .execute(
                "UPDATE usage_records SET preserved = 1
                 WHERE request_time_unix_ms < ?1 AND preserved = 0",
                params![cutoff_unix_ms as i64],
            )
            .map_err(usage_err)?;
        transaction.commit().map_err(usage_err)
    }

    fn delete_old_usage_records(
        &self,
        cutoff_unix_ms: u64,
        batch_size: usize,
    ) -> Result<usize, UsageStoreError> {
        let connection = self.connection.lock().expect("store lock poisoned");
        let deleted = connection
            .execute(
                "DELETE FROM usage_records WHERE id IN (
                     SELECT id FROM usage_records
                     WHERE request_time_unix_ms < ?1 ORDER BY id LIMIT ?2)",
                params![cutoff_unix_ms as i64, batch_size as i64],
            )
            .map_err(usage_err)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().expect("open store")
    }

    fn usage_record(user_id: i64, timestamp: u64, tokens: u64) -> UsageRecord {
        UsageRecord {
            user_id,
            username: format!("user-{user_id}"),
            token_id: 1,
            token_name: "default".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
            cursor_session: None,
            status_code: 200,
            error_message: None,
            request_time_unix_ms: timestamp,
            response_time_unix_ms: timestamp + 5,
            duration_ms: 5,
        }
    }

    #[test]
    fn functional_token_issue_and_lookup_round_trip() {
        let subject = store();
        let user = subject.create_user("alice", Some("a@x.io")).expect("user");
        let issued = subject
            .create_token(user.id, "laptop", Some(&["gpt-4o".to_string()]))
            .expect("token");
        assert!(issued.token.starts_with("rk-"));

        let identity = subject
            .lookup_token(&issued.token)
            .expect("lookup")
            .expect("present");
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.token_name, "laptop");
        assert_eq!(
            identity.model_whitelist,
            Some(vec!["gpt-4o".to_string()])
        );

        assert!(subject.lookup_token("rk-unknown").expect("lookup").is_none());
    }

    #[test]
    fn functional_balance_auto_creates_at_zero_and_updates() {
        let subject = store();
        let user = subject.create_user("bob", None).expect("user");

        let balance = subject.ensure_user_balance(user.id).expect("balance");
        assert_eq!(balance.balance, 0.0);
        assert_eq!(balance.status, BalanceStatus::Active);

        subject
            .set_balance(user.id, 2.5, BalanceStatus::Active)
            .expect("set");
        let balance = subject.ensure_user_balance(user.id).expect("balance");
        assert_eq!(balance.balance, 2.5);

        subject
            .set_balance(user.id, 0.0, BalanceStatus::Exhausted)
            .expect("set");
        let balance = subject.ensure_user_balance(user.id).expect("balance");
        assert_eq!(balance.status, BalanceStatus::Exhausted);
    }

    #[test]
    fn functional_conversation_turns_persist_in_order() {
        let subject = store();
        let user = subject.create_user("carol", None).expect("user");
        let conversation = subject
            .create_conversation(user.id, "gpt-4o", Some("be brief"))
            .expect("conversation");

        subject
            .insert_chat_message(NewChatMessage {
                conversation_id: conversation.id,
                role: MessageRole::User,
                content: "ping".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost: 0.0,
            })
            .expect("user turn");
        subject
            .insert_chat_message(NewChatMessage {
                conversation_id: conversation.id,
                role: MessageRole::Assistant,
                content: "pong".to_string(),
                prompt_tokens: 5,
                completion_tokens: 4,
                cost: 5.25e-5,
            })
            .expect("assistant turn");

        let turns = subject
            .list_conversation_messages(conversation.id)
            .expect("list");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, MessageRole::User);
        assert_eq!(turns[1].role, MessageRole::Assistant);
        assert_eq!(turns[1].content, "pong");
        assert!((turns[1].cost - 5.25e-5).abs() < 1e-12);

        let loaded = subject
            .get_conversation(conversation.id)
            .expect("get")
            .expect("present");
        assert_eq!(loaded.system_prompt.as_deref(), Some("be brief"));
        assert!(subject.get_conversation(9_999).expect("get").is_none());
    }

    #[test]
    fn functional_usage_bulk_insert_preserve_delete_cycle() {
        let subject = store();
        let old = 1_000_000_u64;
        let cutoff = 2_000_000_u64;
        let records: Vec<UsageRecord> = (0..5)
            .map(|i| usage_record(1, old + i, 10))
            .chain(std::iter::once(usage_record(1, cutoff + 1, 10)))
            .collect();
        subject.insert_usage_records(&records).expect("insert");
        assert_eq!(subject.usage_record_count().expect("count"), 6);

        subject.preserve_usage_aggregates(cutoff).expect("preserve");
        let aggregates = subject.usage_aggregate_rows().expect("rows");
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].3, 50, "five old records of ten tokens");
        assert_eq!(aggregates[0].4, 5);

        // Bounded deletes: batch of 2 needs three passes for five rows.
        let mut total = 0;
        loop {
            let deleted = subject.delete_old_usage_records(cutoff, 2).expect("delete");
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        assert_eq!(total, 5);
        assert_eq!(subject.usage_record_count().expect("count"), 1);
    }

    #[test]
    fn regression_preserve_is_idempotent_on_rerun() {
        let subject = store();
        subject
            .insert_usage_records(&[usage_record(1, 1_000, 8)])
            .expect("insert");

        subject.preserve_usage_aggregates(5_000).expect("first");
        let first = subject.usage_aggregate_rows().expect("rows");
        subject.preserve_usage_aggregates(5_000).expect("second");
        let second = subject.usage_aggregate_rows().expect("rows");
        assert_eq!(first, second, "re-run adds nothing");
    }
}
