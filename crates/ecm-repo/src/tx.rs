use std::time::{Duration, Instant};

use tracing::debug;

use ecm_types::TransactionId;

use crate::error::{RepoError, RepoResult};

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    TimedOut,
    Committed,
    RolledBack,
}

/// A unit of work with a deadline.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    started: Instant,
    timeout: Duration,
    /// Set by [`prepare`](Transaction::prepare); the deadline no longer applies.
    prepared: bool,
    ended: Option<TransactionStatus>,
}

impl Transaction {
    fn begin(timeout: Duration) -> Self {
        let tx = Self {
            id: TransactionId::new(),
            started: Instant::now(),
            timeout,
            prepared: false,
            ended: None,
        };
        debug!(tx = %tx.id, ?timeout, "transaction started");
        tx
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> TransactionStatus {
        match self.ended {
            Some(status) => status,
            None if !self.prepared && self.started.elapsed() > self.timeout => TransactionStatus::TimedOut,
            None => TransactionStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    /// Fail unless the transaction can still be used.
    pub fn check(&self) -> RepoResult<()> {
        match self.status() {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::TimedOut => Err(RepoError::TransactionTimeout {
                id: self.id,
                timeout: self.timeout,
            }),
            TransactionStatus::Committed | TransactionStatus::RolledBack => {
                Err(RepoError::TransactionInactive(self.id))
            }
        }
    }

    /// Last deadline check before commit. Once prepared the transaction can
    /// still be committed or rolled back, but no longer times out.
    pub fn prepare(&mut self) -> RepoResult<()> {
        if let Err(e) = self.check() {
            self.rollback();
            return Err(e);
        }
        self.prepared = true;
        Ok(())
    }

    pub fn commit(&mut self) -> RepoResult<()> {
        if let Err(e) = self.check() {
            if self.ended.is_none() {
                self.ended = Some(TransactionStatus::RolledBack);
            }
            return Err(e);
        }
        self.ended = Some(TransactionStatus::Committed);
        debug!(tx = %self.id, elapsed = ?self.started.elapsed(), "transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) {
        if self.ended.is_none() {
            self.ended = Some(TransactionStatus::RolledBack);
            debug!(tx = %self.id, "transaction rolled back");
        }
    }
}

/// Hands out transactions with a default timeout.
#[derive(Clone, Debug)]
pub struct TransactionManager {
    default_timeout: Duration,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_TIMEOUT)
    }
}

impl TransactionManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn begin(&self) -> Transaction {
        Transaction::begin(self.default_timeout)
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> Transaction {
        Transaction::begin(timeout)
    }
}
