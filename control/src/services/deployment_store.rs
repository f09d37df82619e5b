use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

use crate::db::is_unique_violation;
use crate::error::{DeployError, DeployResult};
use crate::services::json_column;
use crate::types::{
    Deployment, DeploymentFilter, DeploymentSpec, DeploymentStats, DeploymentStatus,
    MetricsSnapshot, RepositoryRef, WorkloadInfo,
};

const DEPLOYMENT_COLUMNS: &str = "id, user_id, node_id, name, namespace, context_path, status, \
     status_reason, repository, configuration, workload, metrics, created_at, updated_at, \
     deployed_at, last_health_check_at";

/// Fields needed to insert a new deployment record.
pub struct NewDeployment<'a> {
    pub id: &'a str,
    pub user_id: Option<&'a str>,
    pub node_id: &'a str,
    pub name: &'a str,
    pub namespace: &'a str,
    pub context_path: &'a str,
    pub repository: &'a RepositoryRef,
    pub configuration: &'a DeploymentSpec,
}

fn row_to_deployment(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(6)?;
    let status = status.parse::<DeploymentStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Deployment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        node_id: row.get(2)?,
        name: row.get(3)?,
        namespace: row.get(4)?,
        context_path: row.get(5)?,
        status,
        status_reason: row.get(7)?,
        repository: json_column(row, 8)?,
        configuration: json_column(row, 9)?,
        workload: json_column(row, 10)?,
        metrics: json_column(row, 11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        deployed_at: row.get(14)?,
        last_health_check_at: row.get(15)?,
    })
}

/// Describe which live deployment already claims this name or context path, if any.
pub fn find_live_conflict(
    conn: &Connection,
    namespace: &str,
    name: &str,
    context_path: &str,
    exclude_id: Option<&str>,
) -> anyhow::Result<Option<String>> {
    let hit: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, name, context_path FROM deployments
             WHERE namespace = ?1 AND status != 'stopped'
               AND (name = ?2 OR context_path = ?3)
               AND (?4 IS NULL OR id != ?4)
             LIMIT 1",
            rusqlite::params![namespace, name, context_path, exclude_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("Failed to check for conflicting deployments")?;

    Ok(hit.map(|(id, existing_name, existing_path)| {
        if existing_path == context_path {
            format!(
                "context path {} is already used in namespace {} by deployment {}",
                context_path, namespace, id
            )
        } else {
            format!(
                "name {} is already used in namespace {} by deployment {}",
                existing_name, namespace, id
            )
        }
    }))
}

/// Insert a deployment in `pending`.
pub fn insert_deployment(conn: &Connection, new: &NewDeployment<'_>, now: i64) -> DeployResult<()> {
    let repository = serde_json::to_string(new.repository).context("Failed to encode repository")?;
    let configuration =
        serde_json::to_string(new.configuration).context("Failed to encode configuration")?;

    let inserted = conn.execute(
        "INSERT INTO deployments (id, user_id, node_id, name, namespace, context_path, status,
             repository, configuration, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?9)",
        rusqlite::params![
            new.id,
            new.user_id,
            new.node_id,
            new.name,
            new.namespace,
            new.context_path,
            repository,
            configuration,
            now
        ],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(DeployError::Conflict(format!(
            "name {} or context path {} is already used in namespace {}",
            new.name, new.context_path, new.namespace
        ))),
        Err(e) => Err(anyhow::Error::new(e)
            .context("Failed to insert deployment")
            .into()),
    }
}

pub fn get_deployment(conn: &Connection, id: &str) -> DeployResult<Deployment> {
    conn.query_row(
        &format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS),
        rusqlite::params![id],
        row_to_deployment,
    )
    .optional()
    .context("Failed to get deployment")?
    .ok_or_else(|| DeployError::not_found("Deployment", id))
}

/// Newest non-stopped deployment with this workload name, falling back to any.
pub fn find_by_workload(
    conn: &Connection,
    namespace: &str,
    name: &str,
) -> anyhow::Result<Option<Deployment>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM deployments WHERE namespace = ?1 AND name = ?2
             ORDER BY (status = 'stopped'), created_at DESC LIMIT 1",
            DEPLOYMENT_COLUMNS
        ),
        rusqlite::params![namespace, name],
        row_to_deployment,
    )
    .optional()
    .context("Failed to find deployment by workload")
}

pub fn list_deployments(
    conn: &Connection,
    filter: &DeploymentFilter,
) -> anyhow::Result<Vec<Deployment>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM deployments
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR node_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC",
            DEPLOYMENT_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let status = filter.status.map(|s| s.as_str());
    let deployments = stmt
        .query_map(
            rusqlite::params![filter.user_id, filter.node_id, status],
            row_to_deployment,
        )
        .context("Failed to query deployments")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect deployments")?;

    Ok(deployments)
}

/// Deployments the collector watches.
pub fn list_observed(conn: &Connection) -> anyhow::Result<Vec<Deployment>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM deployments WHERE status IN ('deploying', 'running')
             ORDER BY created_at",
            DEPLOYMENT_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let deployments = stmt
        .query_map([], row_to_deployment)
        .context("Failed to query deployments")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect deployments")?;
    Ok(deployments)
}

/// Conditional status change. Returns false when the row was not in any of `from`.
pub fn transition(
    conn: &Connection,
    id: &str,
    from: &[DeploymentStatus],
    to: DeploymentStatus,
    reason: Option<&str>,
    now: i64,
) -> anyhow::Result<bool> {
    let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
    let from_json = serde_json::to_string(&from).context("Failed to encode statuses")?;

    let rows = conn
        .execute(
            "UPDATE deployments
             SET status = ?1, status_reason = ?2, updated_at = ?3,
                 deployed_at = CASE WHEN ?1 = 'running' THEN ?3 ELSE deployed_at END
             WHERE id = ?4 AND status IN (SELECT value FROM json_each(?5))",
            rusqlite::params![to.as_str(), reason, now, id, from_json],
        )
        .with_context(|| format!("Failed to move deployment {} to {}", id, to))?;
    Ok(rows > 0)
}

pub fn save_configuration(
    conn: &Connection,
    id: &str,
    configuration: &DeploymentSpec,
    now: i64,
) -> anyhow::Result<()> {
    let encoded = serde_json::to_string(configuration).context("Failed to encode configuration")?;
    conn.execute(
        "UPDATE deployments SET configuration = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![encoded, now, id],
    )
    .context("Failed to save deployment configuration")?;
    Ok(())
}

pub fn save_workload(
    conn: &Connection,
    id: &str,
    workload: &WorkloadInfo,
    now: i64,
) -> anyhow::Result<()> {
    let encoded = serde_json::to_string(workload).context("Failed to encode workload")?;
    conn.execute(
        "UPDATE deployments SET workload = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![encoded, now, id],
    )
    .context("Failed to save workload info")?;
    Ok(())
}

/// Collector-owned write: the observed metrics snapshot only.
pub fn record_metrics(
    conn: &Connection,
    id: &str,
    metrics: &MetricsSnapshot,
    now: i64,
) -> anyhow::Result<()> {
    let encoded = serde_json::to_string(metrics).context("Failed to encode metrics")?;
    conn.execute(
        "UPDATE deployments SET metrics = ?1, last_health_check_at = ?2 WHERE id = ?3",
        rusqlite::params![encoded, now, id],
    )
    .context("Failed to record deployment metrics")?;
    Ok(())
}

pub fn purge_deployment(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM deployments WHERE id = ?1",
        rusqlite::params![id],
    )
    .context("Failed to delete deployment")?;
    Ok(())
}

pub fn deployment_stats(conn: &Connection, node_id: Option<&str>) -> anyhow::Result<DeploymentStats> {
    let mut stmt = conn
        .prepare(
            "SELECT status, COUNT(*) FROM deployments
             WHERE (?1 IS NULL OR node_id = ?1) GROUP BY status",
        )
        .context("Failed to prepare statement")?;

    let mut stats = DeploymentStats {
        total: 0,
        by_status: BTreeMap::from(
            [
                DeploymentStatus::Pending,
                DeploymentStatus::Deploying,
                DeploymentStatus::Running,
                DeploymentStatus::Failed,
                DeploymentStatus::Stopped,
            ]
            .map(|s| (s.as_str().to_string(), 0)),
        ),
    };

    let rows = stmt
        .query_map(rusqlite::params![node_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })
        .context("Failed to query deployment stats")?;
    for row in rows {
        let (status, count) = row.context("Failed to read deployment stats")?;
        stats.total += count;
        stats.by_status.insert(status, count);
    }
    Ok(stats)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::services::config_builder::ConfigBuilder;
    use crate::types::{CreateDeploymentRequest, RepositoryCoordinates};

    pub(crate) fn sample_spec() -> DeploymentSpec {
        let req = CreateDeploymentRequest {
            name: Some("demo".to_string()),
            github_repo: RepositoryCoordinates {
                owner: "acme".to_string(),
                name: "demo".to_string(),
                branch: "main".to_string(),
            },
            ..Default::default()
        };
        ConfigBuilder::default().build(&req).unwrap().spec
    }

    fn insert(conn: &Connection, id: &str, name: &str, path: &str) -> DeployResult<()> {
        let repo = RepositoryRef::default();
        let spec = sample_spec();
        insert_deployment(
            conn,
            &NewDeployment {
                id,
                user_id: Some("user-1"),
                node_id: "node-1",
                name,
                namespace: "apps",
                context_path: path,
                repository: &repo,
                configuration: &spec,
            },
            100,
        )
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert(&conn, "d1", "demo", "/demo").unwrap();

        let d = get_deployment(&conn, "d1").unwrap();
        assert_eq!(d.status, DeploymentStatus::Pending);
        assert_eq!(d.configuration.replicas, 2);
        assert!(d.metrics.is_empty());
        assert!(matches!(
            get_deployment(&conn, "nope"),
            Err(DeployError::NotFound(_))
        ));
    }

    #[test]
    fn test_context_path_unique_among_live_deployments() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert(&conn, "d1", "demo", "/demo").unwrap();

        assert!(matches!(
            insert(&conn, "d2", "other", "/demo"),
            Err(DeployError::Conflict(_))
        ));
        assert!(find_live_conflict(&conn, "apps", "other", "/demo", None)
            .unwrap()
            .is_some());

        transition(
            &conn,
            "d1",
            &[DeploymentStatus::Pending],
            DeploymentStatus::Stopped,
            None,
            101,
        )
        .unwrap();
        insert(&conn, "d2", "other", "/demo").unwrap();
    }

    #[test]
    fn test_conditional_transition() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert(&conn, "d1", "demo", "/demo").unwrap();

        assert!(!transition(
            &conn,
            "d1",
            &[DeploymentStatus::Deploying],
            DeploymentStatus::Running,
            None,
            101
        )
        .unwrap());
        assert!(transition(
            &conn,
            "d1",
            &[DeploymentStatus::Pending],
            DeploymentStatus::Deploying,
            None,
            102
        )
        .unwrap());
        assert!(transition(
            &conn,
            "d1",
            &[DeploymentStatus::Deploying],
            DeploymentStatus::Running,
            None,
            103
        )
        .unwrap());

        let d = get_deployment(&conn, "d1").unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
        assert_eq!(d.deployed_at, Some(103));
    }

    #[test]
    fn test_stats_by_node() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert(&conn, "d1", "one", "/one").unwrap();
        insert(&conn, "d2", "two", "/two").unwrap();

        let stats = deployment_stats(&conn, Some("node-1")).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["pending"], 2);
        assert_eq!(stats.by_status["running"], 0);
        assert_eq!(deployment_stats(&conn, Some("node-2")).unwrap().total, 0);
    }
}
