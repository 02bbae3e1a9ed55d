//! Batch loader → per-request checker adaptor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::{AuthError, AuthUserChecker, AuthUserLoader, AuthUserRecord};
use crate::context::AuthUserInfo;

/// Holds the most recently loaded auth table and checks users against it.
pub struct LoadingAuthUserChecker<L> {
    loader: L,
    records: ArcSwap<HashMap<String, AuthUserRecord>>,
}

impl<L: AuthUserLoader> LoadingAuthUserChecker<L> {
    /// Load the table once. Fails if the initial load fails.
    pub async fn load(loader: L) -> Result<Self, AuthError> {
        let records = index(loader.load_auth_users().await?);
        Ok(Self {
            loader,
            records: ArcSwap::from_pointee(records),
        })
    }

    /// Replace the table with a fresh load. The old table stays on failure.
    pub async fn reload(&self) -> Result<usize, AuthError> {
        let records = index(self.loader.load_auth_users().await?);
        let size = records.len();
        self.records.store(Arc::new(records));
        Ok(size)
    }

    /// Number of users in the current table.
    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload every `every` until shutdown is signalled.
    pub fn spawn_reload(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        L: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.reload().await {
                        Ok(size) => tracing::debug!(auth_table_size = size, "Auth table reloaded"),
                        Err(e) => tracing::warn!(error = %e, "Auth table reload failed, keeping previous table"),
                    },
                    _ = shutdown.recv() => {
                        tracing::debug!("Auth table reloader stopped");
                        return;
                    }
                }
            }
        })
    }
}

impl<L: AuthUserLoader> AuthUserChecker for LoadingAuthUserChecker<L> {
    fn check_auth_user(&self, user: &mut AuthUserInfo) -> Result<(), AuthError> {
        if user.username.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let records = self.records.load();
        let record = records
            .get(&user.username)
            .ok_or_else(|| AuthError::UnknownUser(user.username.clone()))?;

        if record.password != user.password {
            return Err(AuthError::WrongPassword(user.username.clone()));
        }

        user.attrs
            .extend(record.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

fn index(records: Vec<AuthUserRecord>) -> HashMap<String, AuthUserRecord> {
    records
        .into_iter()
        .map(|record| (record.username.clone(), record))
        .collect()
}
