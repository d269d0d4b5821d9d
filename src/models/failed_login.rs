use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, types::ipnet::IpNet};

use crate::models::Error;

/// Lockout window named in the scenario: 5 failures within 15 minutes blocks
/// further attempts regardless of whether the 6th attempt has the right password.
pub const LOCKOUT_THRESHOLD: i64 = 5;
pub const LOCKOUT_WINDOW: Duration = Duration::minutes(15);

#[derive(Clone)]
pub struct FailedLoginRepository {
    pool: PgPool,
}

impl FailedLoginRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, email: &str, ip: IpNet) -> Result<(), Error> {
        sqlx::query("insert into failed_login_attempts (email, ip) values (lower($1), $2)")
            .bind(email)
            .bind(ip)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn count_recent(&self, email: &str, now: DateTime<Utc>) -> Result<i64, Error> {
        let (count,): (i64,) = sqlx::query_as(
            "select count(*) from failed_login_attempts
             where lower(email) = lower($1) and attempted_at > $2",
        )
        .bind(email)
        .bind(now - LOCKOUT_WINDOW)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn is_locked_out(&self, email: &str, now: DateTime<Utc>) -> Result<bool, Error> {
        Ok(self.count_recent(email, now).await? >= LOCKOUT_THRESHOLD)
    }

    /// Best-effort retention sweep; attempts must be kept at least
    /// `LOCKOUT_WINDOW` so this should only ever be called with an older cutoff.
    pub async fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("delete from failed_login_attempts where attempted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[sqlx::test]
    async fn lockout_after_five_failures(pool: PgPool) {
        let repo = FailedLoginRepository::new(pool);
        let ip: IpNet = "127.0.0.1".parse().unwrap();
        let now = Utc::now();

        for _ in 0..4 {
            repo.record("victim@x", ip).await.unwrap();
        }
        assert!(!repo.is_locked_out("victim@x", now).await.unwrap());

        repo.record("victim@x", ip).await.unwrap();
        assert!(repo.is_locked_out("victim@x", now).await.unwrap());
    }
}
