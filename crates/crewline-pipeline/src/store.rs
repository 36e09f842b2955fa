use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crewline_core::error::{CrewlineError, Result};
use crewline_core::execution::PipelineExecution;
use crewline_core::types::PipelineConfiguration;

use crate::graph::{refresh_configuration, validate_pipeline_graph};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pipelines (
        id TEXT PRIMARY KEY,
        team_id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_valid INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pipelines_team ON pipelines(team_id, updated_at DESC);

    CREATE TABLE IF NOT EXISTS team_pipelines (
        team_id TEXT PRIMARY KEY,
        pipeline_id TEXT NOT NULL,
        activated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        mission_id TEXT PRIMARY KEY,
        pipeline_id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_pipeline ON executions(pipeline_id);";

fn db_err(e: impl std::fmt::Display) -> CrewlineError {
    CrewlineError::Database(e.to_string())
}

/// SQLite-backed store for pipeline configurations, team activations and
/// mission executions. Documents are kept as JSON bodies.
pub struct SqlitePipelineStore {
    conn: Mutex<Connection>,
}

impl SqlitePipelineStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CrewlineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Pipeline store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Insert or replace a configuration owned by `team_id`.
    ///
    /// Refused when the id belongs to another team, and when the body is
    /// invalid while the configuration is some team's active pipeline.
    pub fn save_configuration(&self, team_id: &str, config: &PipelineConfiguration) -> Result<()> {
        let body = serde_json::to_string(config)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT team_id FROM pipelines WHERE id = ?1",
                params![config.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(owner) = owner.filter(|o| o != team_id) {
            return Err(CrewlineError::PipelineOwnedElsewhere {
                id: config.id.clone(),
                team_id: owner,
            });
        }

        let active_for: Option<String> = tx
            .query_row(
                "SELECT team_id FROM team_pipelines WHERE pipeline_id = ?1 LIMIT 1",
                params![config.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(active_team) = active_for {
            let report = validate_pipeline_graph(&config.stages);
            if !report.is_valid {
                warn!(
                    team_id = %active_team,
                    pipeline_id = %config.id,
                    errors = report.errors.len(),
                    "Refusing invalid body for active pipeline"
                );
                return Err(CrewlineError::PipelineInvalid {
                    id: config.id.clone(),
                    errors: report.errors.len(),
                });
            }
        }

        upsert_configuration(&tx, team_id, config, &body)?;
        tx.commit().map_err(db_err)?;

        debug!(team_id, pipeline_id = %config.id, is_valid = config.is_valid, "Pipeline saved");
        Ok(())
    }

    pub fn load_configuration(&self, pipeline_id: &str) -> Result<Option<PipelineConfiguration>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM pipelines WHERE id = ?1",
                params![pipeline_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        body.map(|b| serde_json::from_str(&b).map_err(CrewlineError::from))
            .transpose()
    }

    /// A configuration, only when it is owned by `team_id`.
    pub fn load_team_configuration(
        &self,
        team_id: &str,
        pipeline_id: &str,
    ) -> Result<Option<PipelineConfiguration>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM pipelines WHERE id = ?1 AND team_id = ?2",
                params![pipeline_id, team_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        body.map(|b| serde_json::from_str(&b).map_err(CrewlineError::from))
            .transpose()
    }

    /// Configurations of a team, most recently updated first.
    pub fn list_configurations(&self, team_id: &str) -> Result<Vec<PipelineConfiguration>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM pipelines WHERE team_id = ?1 ORDER BY updated_at DESC, id")
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![team_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(CrewlineError::from))
            .collect()
    }

    /// Make `pipeline_id` the active pipeline of `team_id`.
    ///
    /// Only the owning team may activate a configuration; for any other team
    /// it does not exist. The stored configuration is re-validated first; an
    /// invalid one is refused and the previous activation stays in place.
    pub fn activate(&self, team_id: &str, pipeline_id: &str) -> Result<PipelineConfiguration> {
        let mut config = self
            .load_team_configuration(team_id, pipeline_id)?
            .ok_or_else(|| CrewlineError::PipelineNotFound(pipeline_id.to_string()))?;

        let report = refresh_configuration(&mut config);
        if !report.is_valid {
            return Err(CrewlineError::PipelineInvalid {
                id: pipeline_id.to_string(),
                errors: report.errors.len(),
            });
        }
        let body = serde_json::to_string(&config)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        upsert_configuration(&tx, team_id, &config, &body)?;
        tx.execute(
            "INSERT INTO team_pipelines (team_id, pipeline_id, activated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(team_id) DO UPDATE SET
                pipeline_id = excluded.pipeline_id,
                activated_at = excluded.activated_at",
            params![team_id, pipeline_id, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(team_id, pipeline_id, "Pipeline activated");
        Ok(config)
    }

    /// The configuration currently active for a team.
    ///
    /// A stored body that no longer validates is not handed out.
    pub fn active_pipeline(&self, team_id: &str) -> Result<Option<PipelineConfiguration>> {
        let pipeline_id: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT pipeline_id FROM team_pipelines WHERE team_id = ?1",
                params![team_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
        };

        let Some(id) = pipeline_id else {
            return Ok(None);
        };
        match self.load_configuration(&id)? {
            Some(config) if validate_pipeline_graph(&config.stages).is_valid => Ok(Some(config)),
            Some(_) => {
                warn!(team_id, pipeline_id = %id, "Active pipeline is invalid, ignoring");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Delete a configuration no mission execution refers to.
    /// Returns whether a row was removed.
    pub fn delete_configuration(&self, pipeline_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let in_use: Option<String> = conn
            .query_row(
                "SELECT mission_id FROM executions WHERE pipeline_id = ?1 LIMIT 1",
                params![pipeline_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(mission_id) = in_use {
            return Err(CrewlineError::PipelineInUse {
                id: pipeline_id.to_string(),
                mission_id,
            });
        }

        conn.execute(
            "DELETE FROM team_pipelines WHERE pipeline_id = ?1",
            params![pipeline_id],
        )
        .map_err(db_err)?;
        let deleted = conn
            .execute("DELETE FROM pipelines WHERE id = ?1", params![pipeline_id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Insert or replace the execution record of a mission.
    pub fn save_execution(&self, execution: &PipelineExecution) -> Result<()> {
        let body = serde_json::to_string(execution)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions (mission_id, pipeline_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(mission_id) DO UPDATE SET
                pipeline_id = excluded.pipeline_id,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                execution.mission_id,
                execution.pipeline_id,
                body,
                execution.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load_execution(&self, mission_id: &str) -> Result<Option<PipelineExecution>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM executions WHERE mission_id = ?1",
                params![mission_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        body.map(|b| serde_json::from_str(&b).map_err(CrewlineError::from))
            .transpose()
    }
}

/// Upsert a pipeline row. The owning team of an existing row is kept.
fn upsert_configuration(
    conn: &Connection,
    team_id: &str,
    config: &PipelineConfiguration,
    body: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pipelines (id, team_id, name, is_valid, body, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            is_valid = excluded.is_valid,
            body = excluded.body,
            updated_at = excluded.updated_at",
        params![
            config.id,
            team_id,
            config.name,
            config.is_valid,
            body,
            config.updated_at.to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewline_core::execution::PipelineStageExecution;
    use crewline_test_utils::{configuration, cyclic_pipeline, fan_out_pipeline};

    #[test]
    fn test_save_and_load_configuration() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let config = configuration("delivery", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();

        let loaded = store.load_configuration(&config.id).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert!(store.load_configuration("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let mut config = configuration("v1", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();
        config.name = "v2".into();
        store.save_configuration("team-a", &config).unwrap();

        let all = store.list_configurations("team-a").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "v2");
        assert!(store.list_configurations("team-b").unwrap().is_empty());
    }

    #[test]
    fn test_activate_valid_pipeline() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let config = configuration("delivery", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();

        let active = store.activate("team-a", &config.id).unwrap();
        assert!(active.is_valid);
        assert_eq!(active.entry_stage_ids, vec!["s1"]);

        let current = store.active_pipeline("team-a").unwrap().unwrap();
        assert_eq!(current.id, config.id);
        assert!(store.active_pipeline("team-b").unwrap().is_none());
    }

    #[test]
    fn test_activate_refuses_invalid_pipeline() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let good = configuration("good", fan_out_pipeline());
        let bad = configuration("bad", cyclic_pipeline());
        store.save_configuration("team-a", &good).unwrap();
        store.save_configuration("team-a", &bad).unwrap();
        store.activate("team-a", &good.id).unwrap();

        let err = store.activate("team-a", &bad.id).unwrap_err();
        assert!(matches!(err, CrewlineError::PipelineInvalid { errors: 1, .. }));
        assert_eq!(store.active_pipeline("team-a").unwrap().unwrap().id, good.id);
    }

    #[test]
    fn test_active_pipeline_cannot_be_replaced_by_invalid_body() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let mut config = configuration("delivery", fan_out_pipeline());
        refresh_configuration(&mut config);
        store.save_configuration("team-a", &config).unwrap();
        store.activate("team-a", &config.id).unwrap();

        let mut broken = config.clone();
        broken.stages = cyclic_pipeline();
        refresh_configuration(&mut broken);
        let err = store.save_configuration("team-a", &broken).unwrap_err();
        assert!(matches!(err, CrewlineError::PipelineInvalid { .. }));

        let active = store.active_pipeline("team-a").unwrap().unwrap();
        assert_eq!(active.id, config.id);
        assert!(active.is_valid);
        assert_eq!(active.stages, fan_out_pipeline());

        // A valid edit of the active pipeline goes through
        let mut edited = config.clone();
        edited.name = "delivery v2".into();
        store.save_configuration("team-a", &edited).unwrap();
        assert_eq!(store.active_pipeline("team-a").unwrap().unwrap().name, "delivery v2");
    }

    #[test]
    fn test_inactive_pipeline_may_be_saved_invalid() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let mut draft = configuration("draft", cyclic_pipeline());
        refresh_configuration(&mut draft);
        store.save_configuration("team-a", &draft).unwrap();
        assert!(!store.load_configuration(&draft.id).unwrap().unwrap().is_valid);
    }

    #[test]
    fn test_other_team_cannot_activate_or_take_over() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let config = configuration("delivery", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();

        let err = store.activate("team-b", &config.id).unwrap_err();
        assert!(matches!(err, CrewlineError::PipelineNotFound(_)));
        assert!(store.active_pipeline("team-b").unwrap().is_none());

        let err = store.save_configuration("team-b", &config).unwrap_err();
        assert!(matches!(
            err,
            CrewlineError::PipelineOwnedElsewhere { ref team_id, .. } if team_id == "team-a"
        ));
        assert_eq!(store.list_configurations("team-a").unwrap().len(), 1);
        assert!(store.list_configurations("team-b").unwrap().is_empty());
        assert!(store
            .load_team_configuration("team-b", &config.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_activate_unknown_pipeline() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let err = store.activate("team-a", "nope").unwrap_err();
        assert!(matches!(err, CrewlineError::PipelineNotFound(_)));
    }

    #[test]
    fn test_delete_refused_while_referenced() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let config = configuration("delivery", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();
        let execution = PipelineExecution::new(
            "mission-1",
            config.id.clone(),
            vec![PipelineStageExecution::pending("s1")],
        );
        store.save_execution(&execution).unwrap();

        let err = store.delete_configuration(&config.id).unwrap_err();
        assert!(matches!(err, CrewlineError::PipelineInUse { .. }));
        assert!(store.load_configuration(&config.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_clears_activation() {
        let store = SqlitePipelineStore::in_memory().unwrap();
        let config = configuration("delivery", fan_out_pipeline());
        store.save_configuration("team-a", &config).unwrap();
        store.activate("team-a", &config.id).unwrap();

        assert!(store.delete_configuration(&config.id).unwrap());
        assert!(store.active_pipeline("team-a").unwrap().is_none());
        assert!(!store.delete_configuration(&config.id).unwrap());
    }

    #[test]
    fn test_execution_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crewline.db");

        let mut execution = PipelineExecution::new(
            "mission-9",
            "pipeline-1",
            vec![PipelineStageExecution::pending("s1")],
        );
        execution.processed_event_ids.insert("evt-1".into());
        {
            let store = SqlitePipelineStore::open(&path).unwrap();
            store.save_execution(&execution).unwrap();
        }

        let store = SqlitePipelineStore::open(&path).unwrap();
        let loaded = store.load_execution("mission-9").unwrap().unwrap();
        assert_eq!(loaded, execution);
        assert!(store.load_execution("mission-0").unwrap().is_none());
    }
}
