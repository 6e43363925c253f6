use rustf_multidb::prelude::*;
use rustf_multidb::SqlxConnector;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sqlite_url(dir: &Path, name: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.join(name).display())
}

fn registry_for(dir: &Path) -> Arc<DatabaseRegistry> {
    let config = RegistryConfig::new()
        .with_database(
            "ledger",
            ConnectionParameters::new(sqlite_url(dir, "ledger.db")).with_max_active_connections(2),
        )
        .with_database(
            "staging",
            ConnectionParameters::new(sqlite_url(dir, "staging.db"))
                .with_auto_commit(false)
                .with_max_active_connections(1),
        );

    DatabaseRegistry::builder(config)
        .connector(SqlxConnector::new())
        .build()
        .unwrap()
}

async fn create_entries_table(registry: &DatabaseRegistry, database_id: &str) {
    registry
        .with_session(database_id, |session| {
            Box::pin(async move {
                session
                    .execute(
                        "CREATE TABLE IF NOT EXISTS entries (id INTEGER PRIMARY KEY, label TEXT NOT NULL, amount INTEGER)",
                        vec![],
                    )
                    .await?;
                session.commit().await
            })
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_crud_through_with_session() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let registry = registry_for(dir.path());
    create_entries_table(&registry, "ledger").await;

    let inserted = registry
        .with_session("ledger", |session| {
            Box::pin(async move {
                let mut total = 0;
                for (label, amount) in [("rent", 1200i64), ("coffee", 4), ("books", 60)] {
                    let done = session
                        .execute(
                            "INSERT INTO entries (label, amount) VALUES (?, ?)",
                            vec![label.into(), amount.into()],
                        )
                        .await?;
                    total += done.rows_affected;
                }
                Ok::<_, Error>(total)
            })
        })
        .await
        .unwrap();
    assert_eq!(inserted, 3);

    let rows = registry
        .with_session("ledger", |session| {
            Box::pin(async move {
                session
                    .execute("UPDATE entries SET amount = ? WHERE label = ?", vec![5i64.into(), "coffee".into()])
                    .await?;
                session
                    .execute("DELETE FROM entries WHERE label = ?", vec!["books".into()])
                    .await?;
                session
                    .fetch_all("SELECT label, amount FROM entries ORDER BY label", vec![])
                    .await
            })
        })
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["label"], "coffee");
    assert_eq!(rows[0]["amount"], 5);
    assert_eq!(rows[1]["label"], "rent");
    assert_eq!(rows[1]["amount"], 1200);

    assert!(registry.has_factory("ledger").await);
    registry.shutdown().await;
    assert!(!registry.has_pool("ledger").await);
}

#[tokio::test]
async fn test_uncommitted_work_is_rolled_back_on_close() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let registry = registry_for(dir.path());
    create_entries_table(&registry, "staging").await;

    let mut session = registry.get_session("staging", None).await.unwrap();
    assert!(!session.auto_commit());
    session
        .execute("INSERT INTO entries (label) VALUES (?)", vec!["draft".into()])
        .await
        .unwrap();
    session.close().await.unwrap();

    let mut session = registry.get_session("staging", None).await.unwrap();
    session
        .execute("INSERT INTO entries (label) VALUES (?)", vec!["final".into()])
        .await
        .unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let labels = registry
        .with_session("staging", |session| {
            Box::pin(async move { session.fetch_all("SELECT label FROM entries", vec![]).await })
        })
        .await
        .unwrap();

    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0]["label"], "final");
    registry.shutdown().await;
}

#[tokio::test]
async fn test_named_statements_from_mapper_files() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mapper_dir = dir.path().join("mapper");
    fs::create_dir_all(&mapper_dir).unwrap();
    fs::write(
        mapper_dir.join("accounts.sql"),
        r#"
-- name: create_accounts
CREATE TABLE IF NOT EXISTS accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL);

-- name: open_account
INSERT INTO accounts (owner, balance) VALUES (?, ?);

-- name: find_account
-- Looks an account up by owner
SELECT owner, balance FROM accounts WHERE owner = ?;
"#,
    )
    .unwrap();

    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[mdbs]
refresh_period = 5
idle_timeout = 600
mapper_locations = ["mapper"]

[mdbs.databases.accounts]
url = "{}"
max_active_connections = 2
"#,
            sqlite_url(dir.path(), "accounts.db")
        ),
    )
    .unwrap();

    let config = RegistryConfig::from_file(&config_path).unwrap();
    assert_eq!(config.refresh_period, 5);
    assert_eq!(config.mapper_locations, vec![mapper_dir.clone()]);

    let registry = DatabaseRegistry::builder(config).build().unwrap();

    let found = registry
        .with_session("accounts", |session| {
            Box::pin(async move {
                session.execute_named("create_accounts", vec![]).await?;
                session
                    .execute_named("open_account", vec!["ada".into(), 150i64.into()])
                    .await?;
                session
                    .fetch_optional_named("find_account", vec!["ada".into()])
                    .await
            })
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(found["owner"], "ada");
    assert_eq!(found["balance"], 150);

    let missing: Result<()> = registry
        .with_session("accounts", |session| {
            Box::pin(async move {
                session.execute_named("close_account", vec![]).await?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(missing, Err(Error::StatementNotFound(_))));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_pool_hook_builds_tenant_databases() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let base = dir.path().to_path_buf();

    let registry = DatabaseRegistry::builder(RegistryConfig::new())
        .on_pool_init(move |id, pool, _ctx| {
            pool.set_url(sqlite_url(&base, &format!("{}.db", id)))
                .set_max_active_connections(1);
            Ok(())
        })
        .on_factory_init(|id, factory, _ctx| {
            factory.add_statement("whoami", format!("SELECT '{}' AS tenant", id));
            Ok(())
        })
        .build()
        .unwrap();

    for tenant in ["north", "south"] {
        let row = registry
            .with_session(tenant, |session| {
                Box::pin(async move { session.fetch_optional_named("whoami", vec![]).await })
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["tenant"], tenant);
    }

    assert_eq!(registry.list_databases().await, vec!["north", "south"]);
    assert!(dir.path().join("north.db").exists());

    assert!(registry.close("north").await);
    assert_eq!(registry.list_databases().await, vec!["south"]);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_database_fails_on_open() {
    init_logging();
    let dir = TempDir::new().unwrap();
    // mode=ro on a missing file cannot be opened
    let params = ConnectionParameters::new(format!(
        "sqlite://{}?mode=ro",
        dir.path().join("missing.db").display()
    ))
    .with_login_timeout(2);

    let registry = DatabaseRegistry::builder(RegistryConfig::new())
        .connector(SqlxConnector::new())
        .build()
        .unwrap();

    let result = registry
        .with_session_using("missing", Some(&params), |session| {
            Box::pin(async move { session.fetch_all("SELECT 1", vec![]).await })
        })
        .await;

    assert!(result.is_err());
    // the pool itself is lazy, so the entry stays cached
    assert!(registry.has_pool("missing").await);
    registry.shutdown().await;
}
