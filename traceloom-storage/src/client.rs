// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! ClickHouse client wrapper with a transient-error retry budget.

use std::future::Future;
use std::time::Duration;

use clickhouse::Client;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct StoreClient {
    inner: Client,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(url: &str, database: &str) -> Self {
        Self {
            inner: Client::default().with_url(url).with_database(database),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.inner = self.inner.with_user(user).with_password(password);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Raw handle for one-off statements (DDL, inserts).
    pub fn raw(&self) -> &Client {
        &self.inner
    }

    /// Run `op` with exponential backoff on transient failures. Non-transient
    /// errors surface immediately; an exhausted budget becomes
    /// [`StoreError::Unavailable`] with a fresh correlation id.
    pub async fn with_retries<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, clickhouse::error::Error>>,
    {
        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match op(self.inner.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(StoreError::Database(err)),
                Err(err) if attempt >= self.retry.max_attempts => {
                    let correlation_id = Uuid::now_v7();
                    warn!(
                        %correlation_id,
                        operation = op_name,
                        attempts = attempt,
                        error = %err,
                        "analytics store retries exhausted"
                    );
                    return Err(StoreError::Unavailable {
                        correlation_id,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        operation = op_name,
                        attempt,
                        error = %err,
                        "transient analytics store error, retrying"
                    );
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}

fn is_transient(err: &clickhouse::error::Error) -> bool {
    matches!(
        err,
        clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
    )
}
