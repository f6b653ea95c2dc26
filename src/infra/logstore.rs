//! Durable store for build/run attempts and application metadata,
//! backed by redb. Values are JSON-serialized into `&[u8]` columns.
//!
//! The append path does its read-modify-write inside a single redb write
//! transaction; redb serializes writers, so two attempts logging against the
//! same application can never overwrite each other's lines.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::domain::error::QuayError;
use crate::domain::model::{AppPatch, Application, BuildAttempt, BuildStatus, LogKind, NewApp};
use crate::domain::port::{AppField, ApplicationRepository, BuildLogs};

/// Attempts are keyed `"{app_id}:{build_id}"` so one prefix scan yields an
/// application's full history.
const ATTEMPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attempts");
const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

fn store_err(e: impl std::fmt::Display) -> QuayError {
    QuayError::Store(e.to_string())
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the persistent store at the given path.
    pub fn open(path: &Path) -> Result<Self, QuayError> {
        let db = Database::create(path).map_err(store_err)?;
        let store = Store { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("store opened at {}", path.display());
        Ok(store)
    }

    /// Ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, QuayError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(store_err)?;
        let store = Store { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Opening a table in a write transaction creates it if absent.
    fn ensure_tables(&self) -> Result<(), QuayError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        txn.open_table(ATTEMPTS).map_err(store_err)?;
        txn.open_table(APPS).map_err(store_err)?;
        txn.commit().map_err(store_err)?;
        Ok(())
    }
}

impl BuildLogs for Store {
    fn append(
        &self,
        app_id: &str,
        build_id: &str,
        line: &str,
        status: BuildStatus,
        kind: LogKind,
    ) -> Result<(), QuayError> {
        let key = format!("{app_id}:{build_id}");
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(ATTEMPTS).map_err(store_err)?;
            let existing = table
                .get(key.as_str())
                .map_err(store_err)?
                .map(|guard| serde_json::from_slice::<BuildAttempt>(guard.value()))
                .transpose()
                .map_err(store_err)?;
            // created_at is set on first write and never changes afterwards.
            let mut attempt = existing.unwrap_or_else(|| BuildAttempt::new(build_id, kind));
            attempt.logs.push(line.to_string());
            attempt.status = status;
            attempt.kind = kind;
            attempt.updated_at = Utc::now();
            let value = serde_json::to_vec(&attempt).map_err(store_err)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        Ok(())
    }

    fn attempts(&self, app_id: &str) -> Result<BTreeMap<String, BuildAttempt>, QuayError> {
        let prefix = format!("{app_id}:");
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(ATTEMPTS).map_err(store_err)?;
        let mut attempts = BTreeMap::new();
        for entry in table.iter().map_err(store_err)? {
            let (key, value) = entry.map_err(store_err)?;
            if let Some(build_id) = key.value().strip_prefix(&prefix) {
                let attempt: BuildAttempt =
                    serde_json::from_slice(value.value()).map_err(store_err)?;
                attempts.insert(build_id.to_string(), attempt);
            }
        }
        Ok(attempts)
    }

    fn get_attempt(
        &self,
        app_id: &str,
        build_id: &str,
    ) -> Result<Option<BuildAttempt>, QuayError> {
        let key = format!("{app_id}:{build_id}");
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(ATTEMPTS).map_err(store_err)?;
        match table.get(key.as_str()).map_err(store_err)? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn list_recent(&self, app_id: &str, n: usize) -> Result<Vec<BuildAttempt>, QuayError> {
        let mut attempts: Vec<BuildAttempt> = self.attempts(app_id)?.into_values().collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        attempts.truncate(n);
        Ok(attempts)
    }
}

impl ApplicationRepository for Store {
    fn register(&self, new: NewApp) -> Result<Application, QuayError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let app;
        {
            let mut table = txn.open_table(APPS).map_err(store_err)?;
            let mut next_numeric_id = 0u16;
            for entry in table.iter().map_err(store_err)? {
                let (_, value) = entry.map_err(store_err)?;
                let existing: Application =
                    serde_json::from_slice(value.value()).map_err(store_err)?;
                if !existing.deleted && existing.name == new.name {
                    return Err(QuayError::DuplicateName(new.name));
                }
                next_numeric_id = next_numeric_id.max(existing.numeric_id + 1);
            }
            let now = Utc::now();
            app = Application {
                app_id: Uuid::new_v4().to_string(),
                numeric_id: next_numeric_id,
                name: new.name,
                description: new.description,
                user_id: new.user_id,
                deleted: false,
                repo: new.repo,
                created_at: now,
                updated_at: now,
            };
            let value = serde_json::to_vec(&app).map_err(store_err)?;
            table
                .insert(app.app_id.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        debug!("registered application {} ({})", app.name, app.app_id);
        Ok(app)
    }

    fn get(&self, app_id: &str) -> Result<Option<Application>, QuayError> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(APPS).map_err(store_err)?;
        match table.get(app_id).map_err(store_err)? {
            Some(guard) => {
                let app: Application = serde_json::from_slice(guard.value()).map_err(store_err)?;
                Ok((!app.deleted).then_some(app))
            }
            None => Ok(None),
        }
    }

    fn get_by(&self, field: AppField, value: &str) -> Result<Option<Application>, QuayError> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(APPS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (_, raw) = entry.map_err(store_err)?;
            let app: Application = serde_json::from_slice(raw.value()).map_err(store_err)?;
            if app.deleted {
                continue;
            }
            let matched = match field {
                AppField::Name => app.name == value,
                AppField::UserId => app.user_id == value,
            };
            if matched {
                return Ok(Some(app));
            }
        }
        Ok(None)
    }

    fn update(&self, app_id: &str, patch: AppPatch) -> Result<Application, QuayError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let app;
        {
            let mut table = txn.open_table(APPS).map_err(store_err)?;
            let existing = table
                .get(app_id)
                .map_err(store_err)?
                .map(|guard| serde_json::from_slice::<Application>(guard.value()))
                .transpose()
                .map_err(store_err)?;
            let mut updated = match existing {
                Some(app) if !app.deleted => app,
                _ => return Err(QuayError::NotFound(app_id.to_string())),
            };
            if let Some(description) = patch.description {
                updated.description = description;
            }
            if let Some(repo) = patch.repo {
                updated.repo = repo;
            }
            updated.updated_at = Utc::now();
            let value = serde_json::to_vec(&updated).map_err(store_err)?;
            table
                .insert(app_id, value.as_slice())
                .map_err(store_err)?;
            app = updated;
        }
        txn.commit().map_err(store_err)?;
        Ok(app)
    }

    fn soft_delete(&self, app_id: &str) -> Result<(), QuayError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(APPS).map_err(store_err)?;
            let existing = table
                .get(app_id)
                .map_err(store_err)?
                .map(|guard| serde_json::from_slice::<Application>(guard.value()))
                .transpose()
                .map_err(store_err)?;
            let mut app = match existing {
                Some(app) => app,
                None => return Err(QuayError::NotFound(app_id.to_string())),
            };
            app.deleted = true;
            app.updated_at = Utc::now();
            let value = serde_json::to_vec(&app).map_err(store_err)?;
            table
                .insert(app_id, value.as_slice())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Repo;

    fn new_app(name: &str) -> NewApp {
        NewApp {
            user_id: "u1".into(),
            name: name.to_string(),
            description: "an app".into(),
            repo: Repo {
                git_url: "https://example.com/repo".into(),
                private: false,
            },
        }
    }

    // ── Build logs ─────────────────────────────────────────────────

    #[test]
    fn append_creates_the_attempt_on_first_write() {
        let store = Store::open_in_memory().unwrap();
        store
            .append("a1", "b1", "Cloning", BuildStatus::Building, LogKind::Build)
            .unwrap();

        let attempt = store.get_attempt("a1", "b1").unwrap().unwrap();
        assert_eq!(attempt.logs, vec!["Cloning"]);
        assert_eq!(attempt.status, BuildStatus::Building);
        assert_eq!(attempt.kind, LogKind::Build);
    }

    #[test]
    fn created_at_is_immutable_across_appends() {
        let store = Store::open_in_memory().unwrap();
        store
            .append("a1", "b1", "one", BuildStatus::Building, LogKind::Build)
            .unwrap();
        let first = store.get_attempt("a1", "b1").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .append("a1", "b1", "two", BuildStatus::Success, LogKind::Build)
            .unwrap();
        let second = store.get_attempt("a1", "b1").unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.logs, vec!["one", "two"]);
        assert_eq!(second.status, BuildStatus::Success);
    }

    #[test]
    fn concurrent_appenders_lose_no_lines() {
        let store = Store::open_in_memory().unwrap();
        let writers = 4;
        let lines_each = 50;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..lines_each {
                        store
                            .append(
                                "a1",
                                "b1",
                                &format!("w{w}-{i}"),
                                BuildStatus::Building,
                                LogKind::Build,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let attempt = store.get_attempt("a1", "b1").unwrap().unwrap();
        assert_eq!(attempt.logs.len(), writers * lines_each);
    }

    #[test]
    fn attempts_are_isolated_per_application() {
        let store = Store::open_in_memory().unwrap();
        store
            .append("a1", "b1", "one", BuildStatus::Building, LogKind::Build)
            .unwrap();
        store
            .append("a2", "b1", "other", BuildStatus::Building, LogKind::Build)
            .unwrap();

        let attempts = store.attempts("a1").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts["b1"].logs, vec!["one"]);
    }

    #[test]
    fn list_recent_orders_by_creation_descending() {
        let store = Store::open_in_memory().unwrap();
        for id in ["b1", "b2", "b3"] {
            store
                .append("a1", id, "line", BuildStatus::Building, LogKind::Build)
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let recent = store.list_recent("a1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].build_id, "b3");
        assert_eq!(recent[1].build_id, "b2");
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quay.redb");

        {
            let store = Store::open(&path).unwrap();
            store
                .append("a1", "b1", "persisted", BuildStatus::Success, LogKind::Build)
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let attempt = store.get_attempt("a1", "b1").unwrap().unwrap();
        assert_eq!(attempt.logs, vec!["persisted"]);
    }

    // ── Application registry ───────────────────────────────────────

    #[test]
    fn register_and_get() {
        let store = Store::open_in_memory().unwrap();
        let app = store.register(new_app("demo")).unwrap();

        let fetched = store.get(&app.app_id).unwrap().unwrap();
        assert_eq!(fetched, app);
        assert_eq!(store.get_by(AppField::Name, "demo").unwrap(), Some(app));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.register(new_app("demo")).unwrap();
        assert!(matches!(
            store.register(new_app("demo")),
            Err(QuayError::DuplicateName(_))
        ));
    }

    #[test]
    fn numeric_ids_are_unique_and_increasing() {
        let store = Store::open_in_memory().unwrap();
        let a = store.register(new_app("appa")).unwrap();
        let b = store.register(new_app("appb")).unwrap();
        let c = store.register(new_app("appc")).unwrap();
        assert_eq!(a.numeric_id, 0);
        assert_eq!(b.numeric_id, 1);
        assert_eq!(c.numeric_id, 2);
    }

    #[test]
    fn soft_delete_hides_but_keeps_the_numeric_id_reserved() {
        let store = Store::open_in_memory().unwrap();
        let a = store.register(new_app("appa")).unwrap();
        store.soft_delete(&a.app_id).unwrap();

        assert!(store.get(&a.app_id).unwrap().is_none());
        assert!(store.get_by(AppField::Name, "appa").unwrap().is_none());

        // The slot stays reserved so ports are never reassigned.
        let b = store.register(new_app("appb")).unwrap();
        assert_eq!(b.numeric_id, a.numeric_id + 1);

        // The name is free again after deletion.
        let again = store.register(new_app("appa")).unwrap();
        assert!(again.numeric_id > b.numeric_id);
    }

    #[test]
    fn update_patches_description_and_repo() {
        let store = Store::open_in_memory().unwrap();
        let app = store.register(new_app("demo")).unwrap();

        let updated = store
            .update(
                &app.app_id,
                AppPatch {
                    description: Some("new words".into()),
                    repo: None,
                },
            )
            .unwrap();
        assert_eq!(updated.description, "new words");
        assert_eq!(updated.repo, app.repo);

        assert!(matches!(
            store.update("missing", AppPatch::default()),
            Err(QuayError::NotFound(_))
        ));
    }

    #[test]
    fn get_by_user_id_skips_deleted() {
        let store = Store::open_in_memory().unwrap();
        let app = store.register(new_app("demo")).unwrap();
        assert!(store.get_by(AppField::UserId, "u1").unwrap().is_some());
        store.soft_delete(&app.app_id).unwrap();
        assert!(store.get_by(AppField::UserId, "u1").unwrap().is_none());
    }
}
