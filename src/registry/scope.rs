//! Scoped session use: open, run caller work, always close

use super::DatabaseRegistry;
use crate::database::params::ConnectionParameters;
use crate::database::session::Session;
use crate::error::{Error, ErrorChain};
use futures::future::BoxFuture;

impl DatabaseRegistry {
    /// Run `work` on a fresh session for `database_id`, then close it
    ///
    /// If the session cannot be opened, `work` is not called. A work error
    /// is returned as-is; a close error is only returned when `work`
    /// succeeded, otherwise it is logged.
    ///
    /// ```rust,ignore
    /// let total: i64 = registry
    ///     .with_session("reports", |session| {
    ///         Box::pin(async move {
    ///             let row = session.fetch_optional("SELECT COUNT(*) AS n FROM runs", vec![]).await?;
    ///             Ok::<_, Error>(row.and_then(|r| r["n"].as_i64()).unwrap_or(0))
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_session<T, E, F>(&self, database_id: &str, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, E>>,
        E: From<Error>,
    {
        self.with_session_using(database_id, None, work).await
    }

    /// As [`with_session`](Self::with_session), creating the pool from
    /// `parameters` when the identifier is not cached yet
    pub async fn with_session_using<T, E, F>(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, E>>,
        E: From<Error>,
    {
        let mut session = self.get_session(database_id, parameters).await?;

        let outcome = work(&mut session).await;
        let closed = session.close().await;

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_error)) => Err(E::from(close_error)),
            (Err(work_error), Ok(())) => Err(work_error),
            (Err(work_error), Err(close_error)) => {
                log::warn!(
                    "Failed to close session on '{}' after failed work: {}",
                    database_id,
                    ErrorChain::new(&close_error).format_for_log()
                );
                Err(work_error)
            }
        }
    }
}
