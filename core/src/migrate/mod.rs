//! Schema lifecycle for the durable event log.
//!
//! Migrations are compiled into the binary as `NNNNNN_<label>.up.sql` /
//! `.down.sql` pairs and tracked in a single-row bookkeeping table carrying
//! the applied version and a dirty flag. A migration that dies partway
//! leaves the row dirty; nothing advances until an operator repairs the
//! schema by hand and calls [`MigrationManager::force`].

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{info, warn};

/// Compiled-in migration files, filename + contents.
static RAW_MIGRATIONS: &[(&str, &str)] = &[
    (
        "000001_create_events.up.sql",
        include_str!("../../migrations/000001_create_events.up.sql"),
    ),
    (
        "000001_create_events.down.sql",
        include_str!("../../migrations/000001_create_events.down.sql"),
    ),
    (
        "000002_create_system_info.up.sql",
        include_str!("../../migrations/000002_create_system_info.up.sql"),
    ),
    (
        "000002_create_system_info.down.sql",
        include_str!("../../migrations/000002_create_system_info.down.sql"),
    ),
];

static FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{6})_([A-Za-z0-9_]+)\.(up|down)\.sql$").expect("migration filename pattern")
});

#[derive(Debug, Clone)]
struct Migration {
    version: i64,
    label: String,
    up: &'static str,
    down: &'static str,
}

#[derive(Default)]
struct MigrationSet {
    by_version: BTreeMap<i64, Migration>,
}

impl MigrationSet {
    /// Parse a file list into versioned up/down pairs. Filenames that do not
    /// match the grammar, and versions missing one side of the pair, are
    /// skipped with a warning rather than aborting the process; a unit test
    /// keeps the embedded set clean so the skip only ever fires on
    /// accidental extras.
    fn from_files(files: &[(&'static str, &'static str)]) -> Self {
        struct Partial {
            label: String,
            up: Option<&'static str>,
            down: Option<&'static str>,
        }

        let mut partials: BTreeMap<i64, Partial> = BTreeMap::new();
        for &(name, contents) in files {
            let Some(captures) = FILENAME.captures(name) else {
                warn!(file = name, "skipping migration file with malformed name");
                continue;
            };
            let version: i64 = match captures[1].parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(file = name, "skipping migration file with malformed name");
                    continue;
                }
            };
            let label = captures[2].to_string();
            let partial = partials.entry(version).or_insert_with(|| Partial {
                label: label.clone(),
                up: None,
                down: None,
            });
            if partial.label != label {
                warn!(
                    file = name,
                    version, "skipping migration file whose label disagrees with its version"
                );
                continue;
            }
            match &captures[3] {
                "up" => partial.up = Some(contents),
                _ => partial.down = Some(contents),
            }
        }

        let mut by_version = BTreeMap::new();
        for (version, partial) in partials {
            match (partial.up, partial.down) {
                (Some(up), Some(down)) => {
                    by_version.insert(
                        version,
                        Migration {
                            version,
                            label: partial.label,
                            up,
                            down,
                        },
                    );
                }
                _ => {
                    warn!(version, label = %partial.label, "skipping half-paired migration");
                }
            }
        }
        MigrationSet { by_version }
    }
}

/// The embedded set, parsed once per process.
static EMBEDDED: Lazy<MigrationSet> = Lazy::new(|| MigrationSet::from_files(RAW_MIGRATIONS));

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A previous migration died partway. Repair the schema by hand, then
    /// [`MigrationManager::force`] the version to clear the flag.
    #[error("database is dirty at version {version}; force a version after manual repair")]
    Dirty { version: i64 },
    #[error("invalid target version {0}")]
    InvalidVersion(i64),
    /// The bookkeeping row names a version the embedded set does not carry
    /// (typically after forcing past the end of the set).
    #[error("no embedded migration with version {0}")]
    Missing(i64),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Direction of a single migration run.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Schema-version controller over the embedded migration set.
///
/// Owns its own connection handle, separate from the application pool; the
/// manager is the only writer of the bookkeeping table.
pub struct MigrationManager {
    pool: PgPool,
}

impl MigrationManager {
    /// Connect with either a `postgres://` or `postgresql://` URL; the two
    /// schemes are equivalent and normalized before handing off.
    pub async fn connect(database_url: &str) -> Result<Self, MigrateError> {
        let url = normalize_url(database_url);
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version BIGINT NOT NULL, dirty BOOLEAN NOT NULL)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Current `(version, dirty)`; `(0, false)` before any migration.
    pub async fn version(&self) -> Result<(i64, bool), MigrateError> {
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT version, dirty FROM schema_migrations LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.unwrap_or((0, false)))
    }

    /// Apply every migration above the current version. Nothing pending is
    /// success; the return value is the number applied.
    pub async fn up(&self) -> Result<usize, MigrateError> {
        let current = self.clean_version().await?;
        if current != 0 && !EMBEDDED.by_version.contains_key(&current) {
            return Err(MigrateError::Missing(current));
        }
        let mut applied = 0;
        for migration in EMBEDDED.by_version.values() {
            if migration.version > current {
                self.run(migration, Direction::Up).await?;
                applied += 1;
            }
        }
        if applied == 0 {
            info!(version = current, "schema already current, no change");
        }
        Ok(applied)
    }

    /// Roll back every applied migration, leaving version 0. Destructive.
    pub async fn down(&self) -> Result<usize, MigrateError> {
        let current = self.clean_version().await?;
        if current != 0 && !EMBEDDED.by_version.contains_key(&current) {
            return Err(MigrateError::Missing(current));
        }
        let mut rolled_back = 0;
        for migration in EMBEDDED.by_version.values().rev() {
            if migration.version <= current {
                self.run(migration, Direction::Down).await?;
                rolled_back += 1;
            }
        }
        if rolled_back == 0 {
            info!("no applied migrations, no change");
        }
        Ok(rolled_back)
    }

    /// Positive `n` applies up to `n` pending migrations; negative rolls
    /// back up to `|n|`; zero is a no-op. Returns the number run.
    pub async fn steps(&self, n: i64) -> Result<usize, MigrateError> {
        if n == 0 {
            return Ok(0);
        }
        let current = self.clean_version().await?;
        if current != 0 && !EMBEDDED.by_version.contains_key(&current) {
            return Err(MigrateError::Missing(current));
        }
        let mut run = 0;
        if n > 0 {
            for migration in EMBEDDED.by_version.values() {
                if migration.version > current && (run as i64) < n {
                    self.run(migration, Direction::Up).await?;
                    run += 1;
                }
            }
        } else {
            for migration in EMBEDDED.by_version.values().rev() {
                if migration.version <= current && (run as i64) < -n {
                    self.run(migration, Direction::Down).await?;
                    run += 1;
                }
            }
        }
        if run == 0 {
            info!(steps = n, "no migrations in range, no change");
        }
        Ok(run)
    }

    /// Set the bookkeeping row to `(version, clean)` without running any
    /// migration. The recovery hatch for a dirty database; the version may
    /// exceed the embedded set, in which case a later `up` fails on the
    /// missing migration.
    pub async fn force(&self, version: i64) -> Result<(), MigrateError> {
        if version < 0 {
            return Err(MigrateError::InvalidVersion(version));
        }
        self.set_version(version, false).await
    }

    /// Versions strictly greater than the current one, ascending.
    pub async fn pending_migrations(&self) -> Result<Vec<i64>, MigrateError> {
        let (current, _) = self.version().await?;
        Ok(EMBEDDED
            .by_version
            .keys()
            .copied()
            .filter(|version| *version > current)
            .collect())
    }

    /// Versions at or below the current one, ascending.
    pub async fn applied_migrations(&self) -> Result<Vec<i64>, MigrateError> {
        let (current, _) = self.version().await?;
        Ok(EMBEDDED
            .by_version
            .keys()
            .copied()
            .filter(|version| *version <= current)
            .collect())
    }

    /// Release the database handle.
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn clean_version(&self) -> Result<i64, MigrateError> {
        let (version, dirty) = self.version().await?;
        if dirty {
            return Err(MigrateError::Dirty { version });
        }
        Ok(version)
    }

    async fn run(&self, migration: &Migration, direction: Direction) -> Result<(), MigrateError> {
        let (sql, target) = match direction {
            Direction::Up => (migration.up, migration.version),
            Direction::Down => (migration.down, migration.version - 1),
        };
        info!(
            version = migration.version,
            label = %migration.label,
            direction = if direction == Direction::Up { "up" } else { "down" },
            "running migration"
        );

        // Mark dirty at the version in flight; a crash between here and the
        // clean write below is exactly what the dirty flag reports.
        self.set_version(migration.version, true).await?;

        let mut conn = self.pool.acquire().await.map_err(MigrateError::Backend)?;
        // Plain-string execution rides the simple query protocol, so
        // multi-statement migration files work.
        (&mut *conn)
            .execute(sql)
            .await
            .map_err(MigrateError::Backend)?;
        drop(conn);

        self.set_version(target, false).await
    }

    async fn set_version(&self, version: i64, dirty: bool) -> Result<(), MigrateError> {
        // Single-row table, replaced wholesale.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM schema_migrations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)")
            .bind(version)
            .bind(dirty)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn normalize_url(url: &str) -> String {
    match url.strip_prefix("postgresql://") {
        Some(rest) => format!("postgres://{}", rest),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_set_is_clean() {
        // Every compiled-in filename must match the grammar; the runtime
        // skip path exists only for accidental extras.
        for &(name, _) in RAW_MIGRATIONS {
            assert!(
                FILENAME.is_match(name),
                "embedded migration {:?} has a malformed name",
                name
            );
        }

        // Versions form a contiguous ascending run starting at 1, each with
        // both directions present.
        let versions: Vec<i64> = EMBEDDED.by_version.keys().copied().collect();
        let expected: Vec<i64> = (1..=versions.len() as i64).collect();
        assert_eq!(versions, expected);
        for migration in EMBEDDED.by_version.values() {
            assert!(!migration.up.is_empty());
            assert!(!migration.down.is_empty());
        }
    }

    #[test]
    fn malformed_filenames_are_skipped() {
        let set = MigrationSet::from_files(&[
            ("000001_ok.up.sql", "SELECT 1;"),
            ("000001_ok.down.sql", "SELECT 1;"),
            ("1_too_short.up.sql", "SELECT 1;"),
            ("000002_no-dashes-allowed.up.sql", "SELECT 1;"),
            ("README.md", "not sql"),
            // Up without a down: dropped as half-paired.
            ("000003_lonely.up.sql", "SELECT 1;"),
        ]);
        assert_eq!(set.by_version.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn mismatched_label_is_skipped() {
        let set = MigrationSet::from_files(&[
            ("000001_one.up.sql", "SELECT 1;"),
            ("000001_other.down.sql", "SELECT 1;"),
        ]);
        assert!(set.by_version.is_empty());
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_url("postgresql://u:p@host/db"),
            "postgres://u:p@host/db"
        );
        assert_eq!(
            normalize_url("postgres://u:p@host/db"),
            "postgres://u:p@host/db"
        );
    }
}
