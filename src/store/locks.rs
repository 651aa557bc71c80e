//! Mailbox lock manager: at most one sync per account across workers.
//!
//! A lock row is created lazily and reused forever. Held means
//! `locked_until` is in the future; a crashed worker's lease simply
//! expires. Acquisition is a single conditional upsert so two callers can
//! never both observe "free" and both write "acquired".

use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::MailboxLock;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row as _;

impl Store {
    /// Try to take the lease for an account. Fails with
    /// [`Error::AlreadyLocked`] while another owner's lease is unexpired.
    pub async fn acquire_lock(
        &self,
        account_id: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<MailboxLock> {
        let locked_until = now + lease;

        // Insert-or-CAS in one statement: a fresh row always wins; an
        // existing row is only overwritten once its lease has expired.
        let acquired = sqlx::query(
            r#"
            INSERT INTO mailbox_locks (email_account_id, lock_owner, locked_until)
            VALUES (?, ?, ?)
            ON CONFLICT (email_account_id) DO UPDATE
            SET lock_owner = excluded.lock_owner,
                locked_until = excluded.locked_until
            WHERE mailbox_locks.locked_until <= ?
            "#,
        )
        .bind(account_id)
        .bind(owner)
        .bind(locked_until)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        if acquired == 0 {
            let holder = self.get_lock(account_id).await?;
            return Err(match holder {
                Some(lock) => Error::AlreadyLocked {
                    owner: lock.lock_owner,
                    locked_until: lock.locked_until,
                },
                // Row vanished between the two statements; treat as contended.
                None => Error::AlreadyLocked {
                    owner: "unknown".to_string(),
                    locked_until: now,
                },
            });
        }

        Ok(MailboxLock {
            email_account_id: account_id.to_string(),
            lock_owner: owner.to_string(),
            locked_until,
        })
    }

    /// Expire the lease immediately. Idempotent; the row is never deleted.
    pub async fn release_lock(&self, account_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE mailbox_locks SET locked_until = ? WHERE email_account_id = ?")
            .bind(now)
            .bind(account_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn get_lock(&self, account_id: &str) -> Result<Option<MailboxLock>> {
        let row = sqlx::query(
            "SELECT email_account_id, lock_owner, locked_until FROM mailbox_locks WHERE email_account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| MailboxLock {
            email_account_id: row.get("email_account_id"),
            lock_owner: row.get("lock_owner"),
            locked_until: row.get("locked_until"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::store::testutil::{test_account, test_store};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn acquire_is_mutually_exclusive() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();
        let lease = Duration::minutes(5);

        store.acquire_lock(&account.id, "host-a:1", lease, now).await.unwrap();

        let contended = store.acquire_lock(&account.id, "host-b:2", lease, now).await;
        match contended {
            Err(Error::AlreadyLocked { owner, .. }) => assert_eq!(owner, "host-a:1"),
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_is_implicitly_free() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let lease = Duration::minutes(5);
        let earlier = Utc::now() - Duration::minutes(10);

        store.acquire_lock(&account.id, "host-a:1", lease, earlier).await.unwrap();

        // The old lease expired five minutes ago; a new owner may take it
        // without any release having happened.
        let lock = store
            .acquire_lock(&account.id, "host-b:2", lease, Utc::now())
            .await
            .unwrap();
        assert_eq!(lock.lock_owner, "host-b:2");
    }

    #[tokio::test]
    async fn release_makes_lock_immediately_available() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();
        let lease = Duration::minutes(5);

        store.acquire_lock(&account.id, "host-a:1", lease, now).await.unwrap();
        store.release_lock(&account.id, now).await.unwrap();

        store.acquire_lock(&account.id, "host-b:2", lease, now).await.unwrap();

        let lock = store.get_lock(&account.id).await.unwrap().unwrap();
        assert_eq!(lock.lock_owner, "host-b:2");
        assert!(lock.is_held(now));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_never_deletes() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();

        store
            .acquire_lock(&account.id, "host-a:1", Duration::minutes(5), now)
            .await
            .unwrap();
        store.release_lock(&account.id, now).await.unwrap();
        store.release_lock(&account.id, now).await.unwrap();

        let lock = store.get_lock(&account.id).await.unwrap();
        assert!(lock.is_some(), "lock row is reused, not deleted");
        assert!(!lock.unwrap().is_held(now));
    }

    #[tokio::test]
    async fn releasing_unknown_account_is_a_no_op() {
        let store = test_store().await;
        store.release_lock("missing", Utc::now()).await.unwrap();
    }
}
