use rusqlite::Connection;
use tracing::{debug, info};

/// Migrations embedded at compile time. Filenames sorted
/// lexicographically define the order; the slice must stay sorted.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_core_entities.sql",
        include_str!("../../migrations/0001_core_entities.sql"),
    ),
    (
        "0002_sync_state.sql",
        include_str!("../../migrations/0002_sync_state.sql"),
    ),
    (
        "0003_ai_processing.sql",
        include_str!("../../migrations/0003_ai_processing.sql"),
    ),
    (
        "0004_marketing_extracts.sql",
        include_str!("../../migrations/0004_marketing_extracts.sql"),
    ),
];

/// Apply all pending migrations in one transaction, tracked in
/// `_migrations(name)`. Safe to run from multiple processes; the
/// unique name column makes a lost race a no-op.
pub fn run_pending(conn: &mut Connection) -> anyhow::Result<usize> {
    debug_assert!(MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0));

    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let tx = conn.transaction()?;
    let mut applied = 0usize;
    for (name, sql) in MIGRATIONS {
        let done: bool = tx
            .prepare("SELECT 1 FROM _migrations WHERE name = ?1")?
            .exists([name])?;
        if done {
            debug!("migration {} already applied", name);
            continue;
        }
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
        info!("applied migration {}", name);
        applied += 1;
    }
    tx.commit()?;
    Ok(applied)
}
