//! Several tenant databases behind one registry
//!
//! Run with `RUST_LOG=debug cargo run --example multi_database` to watch
//! pools being created, reused and evicted.

use async_trait::async_trait;
use rustf_multidb::database::{SessionInfo, SessionInterceptor, StatementEvent};
use rustf_multidb::prelude::*;
use rustf_multidb::MappingInitializer;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts statements per process and logs the named ones
struct StatementCounter {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionInterceptor for StatementCounter {
    fn name(&self) -> &'static str {
        "statement_counter"
    }

    async fn before_statement(&self, statement: &StatementEvent<'_>) -> Result<()> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        if let Some(name) = statement.statement_name {
            log::debug!("[{}] {}", statement.session.database_id, name);
        }
        Ok(())
    }

    async fn on_close(&self, session: &SessionInfo) {
        log::debug!("Session {} on '{}' closed", session.session_id, session.database_id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let data_dir = std::env::temp_dir().join("rustf-multidb-demo");
    std::fs::create_dir_all(&data_dir)?;

    let mapper_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/mapper");
    let mappings = Arc::new(MappingInitializer::new([mapper_dir]));
    let seen = Arc::new(AtomicUsize::new(0));

    let config = RegistryConfig::new()
        .with_refresh_period(1)
        .with_idle_timeout(2);

    let pool_dir = data_dir.clone();
    let factory_mappings = Arc::clone(&mappings);
    let factory_seen = Arc::clone(&seen);

    let builder = DatabaseRegistry::builder(config)
        // every tenant gets its own sqlite file
        .on_pool_init(move |id, pool, _ctx| {
            let path = pool_dir.join(format!("{}.db", id));
            pool.set_url(format!("sqlite://{}?mode=rwc", path.display()))
                .set_max_active_connections(2)
                .set_login_timeout(5);
            Ok(())
        })
        // all tenants share one parsed copy of the mapper files
        .on_factory_init(move |_id, factory, _ctx| {
            factory
                .set_mappings(factory_mappings.mappings()?)
                .add_interceptor(StatementCounter {
                    seen: Arc::clone(&factory_seen),
                });
            Ok(())
        });

    let registry = DBS::init(builder).await?;

    for (tenant, jobs) in [
        ("acme", vec![("import", 1830i64), ("export", 420), ("reindex", 9600)]),
        ("globex", vec![("import", 210i64), ("backup", 5400)]),
    ] {
        let slowest = registry
            .with_session(tenant, |session| {
                Box::pin(async move {
                    session.execute_named("create_runs", vec![]).await?;
                    for (job, duration) in jobs {
                        session
                            .execute_named("record_run", vec![job.into(), duration.into()])
                            .await?;
                    }
                    session.fetch_named("slowest_runs", vec![1i64.into()]).await
                })
            })
            .await?;

        println!("{}: slowest run {}", tenant, slowest[0]);
    }

    let stats = registry.stats().await;
    println!(
        "{} database(s) cached: {:?}",
        stats.total_databases, stats.database_names
    );

    // wait long enough for the reaper to evict both tenants
    tokio::time::sleep(Duration::from_secs(4)).await;
    println!("After idling: {:?}", registry.list_databases().await);

    // the next request recreates the pool from the hook
    let total = DBS::with_session("acme", |session| {
        Box::pin(async move {
            let row = session.fetch_optional_named("count_runs", vec![]).await?;
            Ok::<_, Error>(row.and_then(|r| r["total"].as_i64()).unwrap_or(0))
        })
    })
    .await?;
    println!("acme has {} recorded run(s) across restarts of its pool", total);
    println!("{} statement(s) intercepted", seen.load(Ordering::Relaxed));

    DBS::shutdown().await?;
    Ok(())
}
