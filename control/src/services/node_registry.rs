use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::error::{DeployError, DeployResult, FieldViolation};
use crate::services::json_column;
use crate::types::{
    Node, NodeCapacity, NodeFilter, NodeLocation, NodeMetadata, NodeObservation, NodeStats, NodeStatus,
    RegisterNodeRequest, RegisterNodeResponse, ResourceReport, UpdateNodeRequest,
};

const NODE_COLUMNS: &str = "id, name, mac_address, public_ip, private_ip, status, cpu_cores, memory_bytes, \
     pods_capacity, cpu_percent, memory_percent, pods_running, cluster_info, metadata, observed, \
     registered_at, updated_at, last_seen_at, location, disk_bytes, disk_used_bytes, disk_percent";

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    let status: String = row.get(5)?;
    let status = status.parse::<NodeStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        mac_address: row.get(2)?,
        public_ip: row.get(3)?,
        private_ip: row.get(4)?,
        status,
        capacity: NodeCapacity {
            cpu_cores: row.get(6)?,
            memory_bytes: row.get::<_, i64>(7)? as u64,
            pods_capacity: row.get(8)?,
            disk_bytes: row.get::<_, i64>(19)? as u64,
        },
        resources: ResourceReport {
            cpu_percent: row.get(9)?,
            memory_percent: row.get(10)?,
            pods_running: row.get(11)?,
            disk_used_bytes: row.get::<_, Option<i64>>(20)?.map(|b| b as u64),
            disk_percent: row.get(21)?,
        },
        cluster_info: json_column(row, 12)?,
        metadata: json_column(row, 13)?,
        observed: json_column(row, 14)?,
        location: match row.get::<_, Option<String>>(18)? {
            Some(_) => Some(json_column(row, 18)?),
            None => None,
        },
        registered_at: row.get(15)?,
        updated_at: row.get(16)?,
        last_seen_at: row.get(17)?,
    })
}

fn encode_location(location: Option<&NodeLocation>) -> anyhow::Result<Option<String>> {
    location
        .map(|l| serde_json::to_string(l).context("Failed to encode location"))
        .transpose()
}

fn check_location(location: Option<&NodeLocation>, violations: &mut Vec<FieldViolation>) {
    if let Some(location) = location {
        if !location.coordinates_valid() {
            violations.push(FieldViolation::new(
                "location",
                "latitude must be within [-90, 90] and longitude within [-180, 180]",
            ));
        }
    }
}

/// Centre and radius of a `near=lat,lon&radiusKm=` search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

impl RadiusQuery {
    pub fn from_filter(filter: &NodeFilter) -> DeployResult<Option<RadiusQuery>> {
        let near = match (&filter.near, filter.radius_km) {
            (None, None) => return Ok(None),
            (Some(near), Some(_)) => near,
            (Some(_), None) => {
                return Err(DeployError::validation("radiusKm", "is required with near"))
            }
            (None, Some(_)) => {
                return Err(DeployError::validation("near", "is required with radiusKm"))
            }
        };
        let radius_km = filter.radius_km.unwrap_or_default();
        let coords = near
            .split_once(',')
            .and_then(|(lat, lon)| Some((lat.trim().parse::<f64>().ok()?, lon.trim().parse::<f64>().ok()?)));
        let (latitude, longitude) = match coords {
            Some((lat, lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {
                (lat, lon)
            }
            _ => {
                return Err(DeployError::validation(
                    "near",
                    "must be `latitude,longitude` within valid ranges",
                ))
            }
        };
        if !(radius_km.is_finite() && radius_km > 0.0) {
            return Err(DeployError::validation("radiusKm", "must be positive"));
        }
        Ok(Some(RadiusQuery {
            latitude,
            longitude,
            radius_km,
        }))
    }

    /// Nodes without a recorded location never match.
    pub fn contains(&self, node: &Node) -> bool {
        node.location
            .as_ref()
            .is_some_and(|l| l.distance_km(self.latitude, self.longitude) <= self.radius_km)
    }
}

/// Lowercase, colon-separated form of a MAC address, or `None` if malformed.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let parts: Vec<&str> = mac.trim().split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6
        || !parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_lowercase())
}

fn validate_descriptor(req: &RegisterNodeRequest) -> Result<String, DeployError> {
    let mut violations = Vec::new();

    if req.name.trim().is_empty() {
        violations.push(FieldViolation::new("name", "is required"));
    }
    let mac = normalize_mac(&req.mac_address);
    if mac.is_none() {
        violations.push(FieldViolation::new(
            "macAddress",
            "must be six hex octets separated by ':' or '-'",
        ));
    }
    if req.public_ip.parse::<IpAddr>().is_err() {
        violations.push(FieldViolation::new("publicIp", "must be an IP address"));
    }
    if let Some(private) = &req.private_ip {
        if private.parse::<IpAddr>().is_err() {
            violations.push(FieldViolation::new("privateIp", "must be an IP address"));
        }
    }
    if req.capacity.cpu_cores == 0 {
        violations.push(FieldViolation::new("capacity.cpuCores", "must be positive"));
    }
    if req.capacity.memory_bytes == 0 {
        violations.push(FieldViolation::new("capacity.memoryBytes", "must be positive"));
    }
    if req.capacity.pods_capacity == 0 {
        violations.push(FieldViolation::new("capacity.podsCapacity", "must be positive"));
    }
    check_location(req.location.as_ref(), &mut violations);

    match mac {
        Some(mac) if violations.is_empty() => Ok(mac),
        _ => Err(DeployError::Validation(violations)),
    }
}

/// Register a node, or refresh the registration of the same hardware.
///
/// The same MAC with the same name is a re-registration and keeps the node id.
/// A MAC or name held by a different node is rejected.
pub fn register_node(
    conn: &Connection,
    req: &RegisterNodeRequest,
    now: i64,
) -> DeployResult<RegisterNodeResponse> {
    let mac = validate_descriptor(req)?;
    let name = req.name.trim().to_string();

    // A lost insert race leaves the winner's row visible to the second try
    if let Some(resp) = try_register(conn, req, &mac, &name, now)? {
        return Ok(resp);
    }
    try_register(conn, req, &mac, &name, now)?.ok_or_else(|| {
        DeployError::validation(
            "macAddress",
            "name or MAC address already registered to a different node",
        )
    })
}

fn try_register(
    conn: &Connection,
    req: &RegisterNodeRequest,
    mac: &str,
    name: &str,
    now: i64,
) -> DeployResult<Option<RegisterNodeResponse>> {
    let by_mac: Option<(String, String, NodeMetadata)> = conn
        .query_row(
            "SELECT id, name, metadata FROM nodes WHERE mac_address = ?1",
            rusqlite::params![mac],
            |row| Ok((row.get(0)?, row.get(1)?, json_column(row, 2)?)),
        )
        .optional()
        .context("Failed to look up node by MAC address")?;
    let by_name: Option<String> = conn
        .query_row(
            "SELECT id FROM nodes WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up node by name")?;

    let cluster_info =
        serde_json::to_string(&req.cluster_info).context("Failed to encode cluster info")?;
    let location = encode_location(req.location.as_ref())?;

    match (by_mac, by_name) {
        (Some((id, existing_name, existing)), _) if existing_name == name => {
            // Operator-assigned tags outlive an agent that reports none
            let mut refreshed = req.metadata.clone();
            if refreshed.tags.is_empty() {
                refreshed.tags = existing.tags;
            }
            let metadata =
                serde_json::to_string(&refreshed).context("Failed to encode metadata")?;
            conn.execute(
                "UPDATE nodes SET public_ip = ?1, private_ip = ?2, status = 'online',
                     cpu_cores = ?3, memory_bytes = ?4, pods_capacity = ?5,
                     cluster_info = ?6, metadata = ?7, updated_at = ?8, last_seen_at = ?8,
                     disk_bytes = ?9, location = COALESCE(?10, location)
                 WHERE id = ?11",
                rusqlite::params![
                    req.public_ip,
                    req.private_ip,
                    req.capacity.cpu_cores,
                    req.capacity.memory_bytes as i64,
                    req.capacity.pods_capacity,
                    cluster_info,
                    metadata,
                    now,
                    req.capacity.disk_bytes as i64,
                    location,
                    id
                ],
            )
            .context("Failed to refresh node registration")?;

            Ok(Some(RegisterNodeResponse {
                node_id: id,
                status: NodeStatus::Online,
                created: false,
            }))
        }
        (Some(_), _) => Err(DeployError::validation(
            "macAddress",
            "already registered to a different node",
        )),
        (None, Some(_)) => Err(DeployError::validation(
            "name",
            "already registered to a different node",
        )),
        (None, None) => {
            let metadata =
                serde_json::to_string(&req.metadata).context("Failed to encode metadata")?;
            let node_id = Uuid::new_v4().to_string();
            let inserted = conn.execute(
                "INSERT INTO nodes (id, name, mac_address, public_ip, private_ip, status,
                     cpu_cores, memory_bytes, pods_capacity, cluster_info, metadata,
                     registered_at, updated_at, last_seen_at, disk_bytes, location)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'online', ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11, ?12, ?13)",
                rusqlite::params![
                    node_id,
                    name,
                    mac,
                    req.public_ip,
                    req.private_ip,
                    req.capacity.cpu_cores,
                    req.capacity.memory_bytes as i64,
                    req.capacity.pods_capacity,
                    cluster_info,
                    metadata,
                    now,
                    req.capacity.disk_bytes as i64,
                    location
                ],
            );
            match inserted {
                Ok(_) => Ok(Some(RegisterNodeResponse {
                    node_id,
                    status: NodeStatus::Online,
                    created: true,
                })),
                Err(e) if is_unique_violation(&e) => Ok(None),
                Err(e) => Err(anyhow::Error::new(e).context("Failed to insert node").into()),
            }
        }
    }
}

/// Record a heartbeat. An `offline` node comes back `online`; administrative
/// statuses are left alone.
pub fn heartbeat(
    conn: &Connection,
    node_id: &str,
    report: &ResourceReport,
    now: i64,
) -> DeployResult<NodeStatus> {
    let rows_updated = conn
        .execute(
            "UPDATE nodes SET last_seen_at = ?1,
                 cpu_percent = COALESCE(?2, cpu_percent),
                 memory_percent = COALESCE(?3, memory_percent),
                 pods_running = COALESCE(?4, pods_running),
                 disk_used_bytes = COALESCE(?5, disk_used_bytes),
                 disk_percent = COALESCE(?6, disk_percent),
                 status = CASE WHEN status = 'offline' THEN 'online' ELSE status END
             WHERE id = ?7",
            rusqlite::params![
                now,
                report.cpu_percent,
                report.memory_percent,
                report.pods_running,
                report.disk_used_bytes.map(|b| b as i64),
                report.disk_percent,
                node_id
            ],
        )
        .context("Failed to update heartbeat")?;

    if rows_updated == 0 {
        return Err(DeployError::not_found("Node", node_id));
    }

    let status: String = conn
        .query_row(
            "SELECT status FROM nodes WHERE id = ?1",
            rusqlite::params![node_id],
            |row| row.get(0),
        )
        .context("Failed to read node status")?;
    status
        .parse()
        .map_err(|e: String| DeployError::Internal(anyhow::anyhow!(e)))
}

/// Flip every `online` node whose last report is older than the window to `offline`.
pub fn mark_stale_nodes(conn: &Connection, now: i64, window_secs: i64) -> anyhow::Result<usize> {
    let threshold = now - window_secs;
    let rows = conn
        .execute(
            "UPDATE nodes SET status = 'offline', updated_at = ?1
             WHERE status = 'online' AND last_seen_at < ?2",
            rusqlite::params![now, threshold],
        )
        .context("Failed to mark stale nodes")?;
    Ok(rows)
}

pub fn list_nodes(
    conn: &Connection,
    filter: &NodeFilter,
    now: i64,
    window_secs: i64,
) -> DeployResult<Vec<Node>> {
    let radius = RadiusQuery::from_filter(filter)?;
    mark_stale_nodes(conn, now, window_secs)?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM nodes WHERE (?1 IS NULL OR status = ?1) ORDER BY registered_at",
            NODE_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let status = filter.status.map(|s| s.as_str());
    let nodes = stmt
        .query_map(rusqlite::params![status], row_to_node)
        .context("Failed to query nodes")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect nodes")?;

    Ok(match radius {
        Some(radius) => nodes.into_iter().filter(|n| radius.contains(n)).collect(),
        None => nodes,
    })
}

pub fn get_node(conn: &Connection, node_id: &str, now: i64, window_secs: i64) -> DeployResult<Node> {
    mark_stale_nodes(conn, now, window_secs)?;

    conn.query_row(
        &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
        rusqlite::params![node_id],
        row_to_node,
    )
    .optional()
    .context("Failed to get node")?
    .ok_or_else(|| DeployError::not_found("Node", node_id))
}

/// Administrative status override.
pub fn set_status(
    conn: &Connection,
    node_id: &str,
    status: NodeStatus,
    now: i64,
) -> DeployResult<()> {
    let rows_updated = conn
        .execute(
            "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), now, node_id],
        )
        .context("Failed to set node status")?;

    if rows_updated == 0 {
        return Err(DeployError::not_found("Node", node_id));
    }
    Ok(())
}

pub fn update_node(
    conn: &Connection,
    node_id: &str,
    patch: &UpdateNodeRequest,
    now: i64,
    window_secs: i64,
) -> DeployResult<Node> {
    let mut node = get_node(conn, node_id, now, window_secs)?;
    let mut violations = Vec::new();

    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            violations.push(FieldViolation::new("name", "must not be empty"));
        }
        node.name = name.trim().to_string();
    }
    if let Some(ip) = &patch.public_ip {
        if ip.parse::<IpAddr>().is_err() {
            violations.push(FieldViolation::new("publicIp", "must be an IP address"));
        }
        node.public_ip = ip.clone();
    }
    if let Some(ip) = &patch.private_ip {
        if ip.parse::<IpAddr>().is_err() {
            violations.push(FieldViolation::new("privateIp", "must be an IP address"));
        }
        node.private_ip = Some(ip.clone());
    }
    if let Some(capacity) = &patch.capacity {
        if capacity.cpu_cores == 0 || capacity.memory_bytes == 0 || capacity.pods_capacity == 0 {
            violations.push(FieldViolation::new("capacity", "all values must be positive"));
        }
        node.capacity = capacity.clone();
    }
    if let Some(info) = &patch.cluster_info {
        node.cluster_info = info.clone();
    }
    if let Some(location) = &patch.location {
        check_location(Some(location), &mut violations);
        node.location = Some(location.clone());
    }
    if let Some(tags) = &patch.tags {
        node.metadata.tags = tags.clone();
    }
    if !violations.is_empty() {
        return Err(DeployError::Validation(violations));
    }

    let cluster_info =
        serde_json::to_string(&node.cluster_info).context("Failed to encode cluster info")?;
    let metadata = serde_json::to_string(&node.metadata).context("Failed to encode metadata")?;
    let location = encode_location(node.location.as_ref())?;
    let updated = conn.execute(
        "UPDATE nodes SET name = ?1, public_ip = ?2, private_ip = ?3, cpu_cores = ?4,
             memory_bytes = ?5, pods_capacity = ?6, cluster_info = ?7, updated_at = ?8,
             disk_bytes = ?9, metadata = ?10, location = ?11
         WHERE id = ?12",
        rusqlite::params![
            node.name,
            node.public_ip,
            node.private_ip,
            node.capacity.cpu_cores,
            node.capacity.memory_bytes as i64,
            node.capacity.pods_capacity,
            cluster_info,
            now,
            node.capacity.disk_bytes as i64,
            metadata,
            location,
            node_id
        ],
    );
    match updated {
        Ok(_) => {
            node.updated_at = now;
            Ok(node)
        }
        Err(e) if is_unique_violation(&e) => Err(DeployError::validation(
            "name",
            "already registered to a different node",
        )),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to update node").into()),
    }
}

/// Explicit administrative removal. Refused while live deployments are bound to the node.
pub fn remove_node(conn: &Connection, node_id: &str) -> DeployResult<()> {
    let live: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM deployments WHERE node_id = ?1 AND status != 'stopped'",
            rusqlite::params![node_id],
            |row| row.get(0),
        )
        .context("Failed to count node deployments")?;
    if live > 0 {
        return Err(DeployError::Conflict(format!(
            "node {} still hosts {} active deployment(s)",
            node_id, live
        )));
    }

    let rows_deleted = conn
        .execute("DELETE FROM nodes WHERE id = ?1", rusqlite::params![node_id])
        .context("Failed to delete node")?;
    if rows_deleted == 0 {
        return Err(DeployError::not_found("Node", node_id));
    }
    Ok(())
}

pub fn node_stats(conn: &Connection, now: i64, window_secs: i64) -> DeployResult<NodeStats> {
    let nodes = list_nodes(conn, &NodeFilter::default(), now, window_secs)?;

    let mut stats = NodeStats {
        by_status: BTreeMap::from(
            [
                NodeStatus::Online,
                NodeStatus::Offline,
                NodeStatus::Maintenance,
                NodeStatus::Error,
            ]
            .map(|s| (s.as_str().to_string(), 0)),
        ),
        ..Default::default()
    };
    for node in &nodes {
        stats.total += 1;
        *stats
            .by_status
            .entry(node.status.as_str().to_string())
            .or_default() += 1;
        stats.total_cpu_cores += node.capacity.cpu_cores as u64;
        stats.total_memory_bytes += node.capacity.memory_bytes;
        stats.total_pods_capacity += node.capacity.pods_capacity as u64;
        stats.total_disk_bytes += node.capacity.disk_bytes;
    }
    Ok(stats)
}

/// Store the collector's observation. Touches no registry-owned column.
pub fn record_observation(
    conn: &Connection,
    node_id: &str,
    observation: &NodeObservation,
) -> anyhow::Result<()> {
    let observed = serde_json::to_string(observation).context("Failed to encode observation")?;
    conn.execute(
        "UPDATE nodes SET observed = ?1 WHERE id = ?2",
        rusqlite::params![observed, node_id],
    )
    .context("Failed to record node observation")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    const WINDOW: i64 = 30;

    fn descriptor(name: &str, mac: &str) -> RegisterNodeRequest {
        RegisterNodeRequest {
            name: name.to_string(),
            mac_address: mac.to_string(),
            public_ip: "203.0.113.10".to_string(),
            private_ip: Some("10.0.0.10".to_string()),
            capacity: NodeCapacity {
                cpu_cores: 4,
                memory_bytes: 8 << 30,
                pods_capacity: 110,
                disk_bytes: 100 << 30,
            },
            cluster_info: Default::default(),
            metadata: Default::default(),
            location: None,
        }
    }

    fn located(name: &str, mac: &str, latitude: f64, longitude: f64, city: &str) -> RegisterNodeRequest {
        RegisterNodeRequest {
            location: Some(NodeLocation {
                latitude,
                longitude,
                city: Some(city.to_string()),
                ..Default::default()
            }),
            ..descriptor(name, mac)
        }
    }

    #[test]
    fn test_register_and_reregister() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let first = register_node(&conn, &descriptor("node-a", "AA:BB:CC:DD:EE:01"), 100).unwrap();
        assert!(first.created);

        let again = register_node(&conn, &descriptor("node-a", "aa-bb-cc-dd-ee-01"), 200).unwrap();
        assert!(!again.created);
        assert_eq!(again.node_id, first.node_id);

        let node = get_node(&conn, &first.node_id, 200, WINDOW).unwrap();
        assert_eq!(node.mac_address, "aa:bb:cc:dd:ee:01");
        assert_eq!(node.last_seen_at, 200);
    }

    #[test]
    fn test_collisions_with_other_nodes_rejected() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100).unwrap();

        let mac_clash = register_node(&conn, &descriptor("node-b", "aa:bb:cc:dd:ee:01"), 100);
        assert!(matches!(mac_clash, Err(DeployError::Validation(_))));

        let name_clash = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:02"), 100);
        assert!(matches!(name_clash, Err(DeployError::Validation(_))));
    }

    #[test]
    fn test_invalid_descriptor_lists_all_fields() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let mut req = descriptor("", "nope");
        req.public_ip = "not-an-ip".to_string();

        match register_node(&conn, &req, 100) {
            Err(DeployError::Validation(v)) => assert_eq!(v.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let res = heartbeat(&conn, "missing", &ResourceReport::default(), 100);
        assert!(matches!(res, Err(DeployError::NotFound(_))));
    }

    #[test]
    fn test_liveness_observed_on_next_read() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100)
            .unwrap()
            .node_id;

        assert_eq!(get_node(&conn, &id, 120, WINDOW).unwrap().status, NodeStatus::Online);
        assert_eq!(get_node(&conn, &id, 131, WINDOW).unwrap().status, NodeStatus::Offline);

        let report = ResourceReport {
            cpu_percent: Some(12.5),
            ..Default::default()
        };
        assert_eq!(heartbeat(&conn, &id, &report, 140).unwrap(), NodeStatus::Online);
        let node = get_node(&conn, &id, 141, WINDOW).unwrap();
        assert_eq!(node.resources.cpu_percent, Some(12.5));
    }

    #[test]
    fn test_administrative_status_survives_sweep_and_heartbeat() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100)
            .unwrap()
            .node_id;

        set_status(&conn, &id, NodeStatus::Maintenance, 101).unwrap();
        assert_eq!(mark_stale_nodes(&conn, 1_000, WINDOW).unwrap(), 0);
        assert_eq!(
            heartbeat(&conn, &id, &ResourceReport::default(), 1_001).unwrap(),
            NodeStatus::Maintenance
        );
        assert_eq!(
            get_node(&conn, &id, 5_000, WINDOW).unwrap().status,
            NodeStatus::Maintenance
        );
    }

    #[test]
    fn test_stats_and_filter() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100).unwrap();
        let b = register_node(&conn, &descriptor("node-b", "aa:bb:cc:dd:ee:02"), 100)
            .unwrap()
            .node_id;
        set_status(&conn, &b, NodeStatus::Error, 100).unwrap();

        let stats = node_stats(&conn, 110, WINDOW).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["online"], 1);
        assert_eq!(stats.by_status["error"], 1);
        assert_eq!(stats.total_cpu_cores, 8);
        assert_eq!(stats.total_disk_bytes, 200 << 30);

        let filter = NodeFilter {
            status: Some(NodeStatus::Error),
            ..Default::default()
        };
        let errored = list_nodes(&conn, &filter, 110, WINDOW).unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].id, b);
    }

    #[test]
    fn test_remove_node() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100)
            .unwrap()
            .node_id;

        remove_node(&conn, &id).unwrap();
        assert!(matches!(
            get_node(&conn, &id, 100, WINDOW),
            Err(DeployError::NotFound(_))
        ));
        assert!(matches!(remove_node(&conn, &id), Err(DeployError::NotFound(_))));
    }

    #[test]
    fn test_radius_filter_uses_great_circle_distance() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let paris = register_node(&conn, &located("paris", "aa:bb:cc:dd:ee:01", 48.8566, 2.3522, "Paris"), 100)
            .unwrap()
            .node_id;
        // Versailles, about 17 km from central Paris
        let versailles = register_node(
            &conn,
            &located("versailles", "aa:bb:cc:dd:ee:02", 48.8049, 2.1204, "Versailles"),
            101,
        )
        .unwrap()
        .node_id;
        register_node(&conn, &located("london", "aa:bb:cc:dd:ee:03", 51.5074, -0.1278, "London"), 102)
            .unwrap();
        register_node(&conn, &descriptor("nowhere", "aa:bb:cc:dd:ee:04"), 103).unwrap();

        let near_paris = |radius_km: f64| NodeFilter {
            near: Some("48.8566, 2.3522".to_string()),
            radius_km: Some(radius_km),
            ..Default::default()
        };

        let within_5: Vec<String> = list_nodes(&conn, &near_paris(5.0), 110, WINDOW)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(within_5, vec![paris.clone()]);

        let within_50: Vec<String> = list_nodes(&conn, &near_paris(50.0), 110, WINDOW)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(within_50, vec![paris, versailles]);

        // London is roughly 344 km away
        assert_eq!(list_nodes(&conn, &near_paris(340.0), 110, WINDOW).unwrap().len(), 2);
        assert_eq!(list_nodes(&conn, &near_paris(350.0), 110, WINDOW).unwrap().len(), 3);
    }

    #[test]
    fn test_radius_filter_rejects_malformed_query() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        for filter in [
            NodeFilter { near: Some("48.8,2.3".to_string()), ..Default::default() },
            NodeFilter { radius_km: Some(10.0), ..Default::default() },
            NodeFilter { near: Some("paris".to_string()), radius_km: Some(10.0), ..Default::default() },
            NodeFilter { near: Some("91,0".to_string()), radius_km: Some(10.0), ..Default::default() },
            NodeFilter { near: Some("0,0".to_string()), radius_km: Some(-1.0), ..Default::default() },
        ] {
            let res = list_nodes(&conn, &filter, 100, WINDOW);
            assert!(matches!(res, Err(DeployError::Validation(_))), "{:?}", filter);
        }
    }

    #[test]
    fn test_location_and_tags_update() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100)
            .unwrap()
            .node_id;

        let bad = UpdateNodeRequest {
            location: Some(NodeLocation {
                latitude: 120.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            update_node(&conn, &id, &bad, 101, WINDOW),
            Err(DeployError::Validation(_))
        ));

        let patch = UpdateNodeRequest {
            location: Some(NodeLocation {
                latitude: 35.6762,
                longitude: 139.6503,
                city: Some("Tokyo".to_string()),
                country: Some("JP".to_string()),
                region: Some("Kanto".to_string()),
                timezone: Some("Asia/Tokyo".to_string()),
            }),
            tags: Some(vec!["gpu".to_string(), "edge".to_string()]),
            ..Default::default()
        };
        update_node(&conn, &id, &patch, 102, WINDOW).unwrap();

        // Agent re-registration reports no tags and no location
        register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 103).unwrap();
        let node = get_node(&conn, &id, 104, WINDOW).unwrap();
        assert_eq!(node.metadata.tags, vec!["gpu", "edge"]);
        let location = node.location.unwrap();
        assert_eq!(location.city.as_deref(), Some("Tokyo"));
        assert_eq!(location.timezone.as_deref(), Some("Asia/Tokyo"));
    }

    #[test]
    fn test_heartbeat_records_disk_usage() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = register_node(&conn, &descriptor("node-a", "aa:bb:cc:dd:ee:01"), 100)
            .unwrap()
            .node_id;

        let report = ResourceReport {
            disk_used_bytes: Some(25 << 30),
            disk_percent: Some(25.0),
            ..Default::default()
        };
        heartbeat(&conn, &id, &report, 101).unwrap();
        heartbeat(&conn, &id, &ResourceReport::default(), 102).unwrap();

        let node = get_node(&conn, &id, 102, WINDOW).unwrap();
        assert_eq!(node.capacity.disk_bytes, 100 << 30);
        assert_eq!(node.resources.disk_used_bytes, Some(25 << 30));
        assert_eq!(node.resources.disk_percent, Some(25.0));
    }
}
