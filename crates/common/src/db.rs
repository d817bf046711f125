//! SQLite store for control-plane state
//!
//! Tables:
//! - exit_nodes: WireGuard hosts and their management endpoints
//! - sites: fixed locations behind exit nodes
//! - clients: roaming endpoints and their registered keys
//! - client_sites: client/site membership
//! - resources, targets: routable services per site

use crate::types::{Client, ExitNode, Resource, Site, SiteKind, Target};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Fields for a new site; ids are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewSite {
    pub org_id: String,
    pub name: String,
    pub kind: SiteKind,
    pub exit_node_id: Option<i64>,
    pub endpoint: Option<String>,
    pub subnet: Option<String>,
    pub public_key: Option<String>,
    pub address: String,
}

/// Fields for a new client.
#[derive(Debug, Clone, Default)]
pub struct NewClient {
    pub org_id: String,
    pub name: String,
    pub subnet: String,
    pub exit_node_id: Option<i64>,
}

/// Partial update for a target; absent fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct TargetUpdate {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub method: Option<String>,
    pub enabled: Option<bool>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            -- Exit nodes
            CREATE TABLE IF NOT EXISTS exit_nodes (
                exit_node_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                mgmt_url TEXT NOT NULL
            );

            -- Sites
            CREATE TABLE IF NOT EXISTS sites (
                site_id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'wireguard',
                exit_node_id INTEGER REFERENCES exit_nodes(exit_node_id),
                endpoint TEXT,
                subnet TEXT,
                public_key TEXT,
                last_hole_punch INTEGER,
                address TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sites_org ON sites(org_id);

            -- Clients
            CREATE TABLE IF NOT EXISTS clients (
                client_id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                pub_key TEXT,
                subnet TEXT NOT NULL,
                endpoint TEXT,
                last_hole_punch INTEGER,
                exit_node_id INTEGER REFERENCES exit_nodes(exit_node_id)
            );
            CREATE INDEX IF NOT EXISTS idx_clients_org ON clients(org_id);

            -- Client/site membership
            CREATE TABLE IF NOT EXISTS client_sites (
                client_id INTEGER NOT NULL REFERENCES clients(client_id) ON DELETE CASCADE,
                site_id INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
                PRIMARY KEY (client_id, site_id)
            );

            -- Resources
            CREATE TABLE IF NOT EXISTS resources (
                resource_id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
                name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_resources_site ON resources(site_id);

            -- Targets
            CREATE TABLE IF NOT EXISTS targets (
                target_id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id INTEGER NOT NULL REFERENCES resources(resource_id) ON DELETE CASCADE,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                method TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_targets_resource ON targets(resource_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Exit node operations
    // ========================================================================

    pub fn create_exit_node(&self, name: &str, public_key: &str, mgmt_url: &str) -> Result<ExitNode> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exit_nodes (name, public_key, mgmt_url) VALUES (?1, ?2, ?3)",
            params![name, public_key, mgmt_url],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created exit node {} ({})", id, name);
        Ok(ExitNode {
            exit_node_id: id,
            name: name.to_string(),
            public_key: public_key.to_string(),
            mgmt_url: mgmt_url.to_string(),
        })
    }

    pub fn exit_node(&self, exit_node_id: i64) -> Result<Option<ExitNode>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                "SELECT exit_node_id, name, public_key, mgmt_url FROM exit_nodes WHERE exit_node_id = ?1",
                params![exit_node_id],
                |row| {
                    Ok(ExitNode {
                        exit_node_id: row.get(0)?,
                        name: row.get(1)?,
                        public_key: row.get(2)?,
                        mgmt_url: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(node)
    }

    // ========================================================================
    // Site operations
    // ========================================================================

    pub fn create_site(&self, site: NewSite) -> Result<Site> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sites (org_id, name, kind, exit_node_id, endpoint, subnet, public_key, address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                site.org_id,
                site.name,
                site.kind.to_string(),
                site.exit_node_id,
                site.endpoint,
                site.subnet,
                site.public_key,
                site.address,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created site {} ({})", id, site.name);
        Ok(Site {
            site_id: id,
            org_id: site.org_id,
            name: site.name,
            kind: site.kind,
            exit_node_id: site.exit_node_id,
            endpoint: site.endpoint,
            subnet: site.subnet,
            public_key: site.public_key,
            last_hole_punch: None,
            address: site.address,
        })
    }

    pub fn site(&self, site_id: i64) -> Result<Option<Site>> {
        let conn = self.conn.lock();
        let site = conn
            .query_row(
                &format!("{} WHERE site_id = ?1", SELECT_SITE),
                params![site_id],
                site_from_row,
            )
            .optional()?;
        Ok(site)
    }

    pub fn set_site_public_key(&self, site_id: i64, public_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sites SET public_key = ?1 WHERE site_id = ?2",
            params![public_key, site_id],
        )?;
        Ok(rows > 0)
    }

    /// Record a hole-punch observation for a site: observed endpoint plus
    /// freshness timestamp.
    pub fn record_site_hole_punch(&self, site_id: i64, endpoint: &str, timestamp: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sites SET endpoint = ?1, last_hole_punch = ?2 WHERE site_id = ?3",
            params![endpoint, timestamp, site_id],
        )?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    pub fn create_client(&self, client: NewClient) -> Result<Client> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO clients (org_id, name, subnet, exit_node_id) VALUES (?1, ?2, ?3, ?4)",
            params![client.org_id, client.name, client.subnet, client.exit_node_id],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created client {} ({})", id, client.name);
        Ok(Client {
            client_id: id,
            org_id: client.org_id,
            name: client.name,
            pub_key: None,
            subnet: client.subnet,
            endpoint: None,
            last_hole_punch: None,
            exit_node_id: client.exit_node_id,
        })
    }

    pub fn client(&self, client_id: i64) -> Result<Option<Client>> {
        let conn = self.conn.lock();
        let client = conn
            .query_row(
                "SELECT client_id, org_id, name, pub_key, subnet, endpoint, last_hole_punch, exit_node_id
                 FROM clients WHERE client_id = ?1",
                params![client_id],
                client_from_row,
            )
            .optional()?;
        Ok(client)
    }

    pub fn update_client_pub_key(&self, client_id: i64, pub_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE clients SET pub_key = ?1 WHERE client_id = ?2",
            params![pub_key, client_id],
        )?;
        Ok(rows > 0)
    }

    /// Record a hole-punch observation for a client.
    pub fn record_client_hole_punch(&self, client_id: i64, endpoint: &str, timestamp: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE clients SET endpoint = ?1, last_hole_punch = ?2 WHERE client_id = ?3",
            params![endpoint, timestamp, client_id],
        )?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Membership operations
    // ========================================================================

    pub fn add_client_to_site(&self, client_id: i64, site_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO client_sites (client_id, site_id) VALUES (?1, ?2)",
            params![client_id, site_id],
        )?;
        Ok(())
    }

    /// All sites a client belongs to, in stable site-id order.
    pub fn client_sites(&self, client_id: i64) -> Result<Vec<Site>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} INNER JOIN client_sites cs ON cs.site_id = sites.site_id
             WHERE cs.client_id = ?1 ORDER BY sites.site_id",
            SELECT_SITE
        ))?;
        let rows = stmt.query_map(params![client_id], site_from_row)?;

        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }

    // ========================================================================
    // Resource operations
    // ========================================================================

    pub fn create_resource(&self, site_id: i64, name: &str) -> Result<Resource> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resources (site_id, name) VALUES (?1, ?2)",
            params![site_id, name],
        )?;
        Ok(Resource {
            resource_id: conn.last_insert_rowid(),
            site_id,
            name: name.to_string(),
        })
    }

    pub fn resource(&self, resource_id: i64) -> Result<Option<Resource>> {
        let conn = self.conn.lock();
        let resource = conn
            .query_row(
                "SELECT resource_id, site_id, name FROM resources WHERE resource_id = ?1",
                params![resource_id],
                |row| {
                    Ok(Resource {
                        resource_id: row.get(0)?,
                        site_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(resource)
    }

    // ========================================================================
    // Target operations
    // ========================================================================

    pub fn create_target(
        &self,
        resource_id: i64,
        ip: &str,
        port: u16,
        method: Option<&str>,
        enabled: bool,
    ) -> Result<Target> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO targets (resource_id, ip, port, method, enabled) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![resource_id, ip, port, method, enabled],
        )?;
        Ok(Target {
            target_id: conn.last_insert_rowid(),
            resource_id,
            ip: ip.to_string(),
            port,
            method: method.map(String::from),
            enabled,
        })
    }

    pub fn target(&self, target_id: i64) -> Result<Option<Target>> {
        let conn = self.conn.lock();
        let target = conn
            .query_row(
                &format!("{} WHERE target_id = ?1", SELECT_TARGET),
                params![target_id],
                target_from_row,
            )
            .optional()?;
        Ok(target)
    }

    /// Apply a partial update and return the resulting row, or None if the
    /// target does not exist.
    pub fn update_target(&self, target_id: i64, update: TargetUpdate) -> Result<Option<Target>> {
        {
            let conn = self.conn.lock();
            if let Some(ip) = &update.ip {
                conn.execute(
                    "UPDATE targets SET ip = ?1 WHERE target_id = ?2",
                    params![ip, target_id],
                )?;
            }
            if let Some(port) = update.port {
                conn.execute(
                    "UPDATE targets SET port = ?1 WHERE target_id = ?2",
                    params![port, target_id],
                )?;
            }
            if let Some(method) = &update.method {
                conn.execute(
                    "UPDATE targets SET method = ?1 WHERE target_id = ?2",
                    params![method, target_id],
                )?;
            }
            if let Some(enabled) = update.enabled {
                conn.execute(
                    "UPDATE targets SET enabled = ?1 WHERE target_id = ?2",
                    params![enabled, target_id],
                )?;
            }
        }
        self.target(target_id)
    }

    pub fn delete_target(&self, target_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM targets WHERE target_id = ?1", params![target_id])?;
        if rows > 0 {
            debug!("Deleted target {}", target_id);
        }
        Ok(rows > 0)
    }

    pub fn targets_for_resource(&self, resource_id: i64) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE resource_id = ?1 ORDER BY target_id",
            SELECT_TARGET
        ))?;
        let rows = stmt.query_map(params![resource_id], target_from_row)?;

        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }

    /// Every enabled target across every resource owned by the site, in
    /// stable target-id order. This is the full recompute input for
    /// wireguard sites and the sync payload for agent sites.
    pub fn enabled_targets_for_site(&self, site_id: i64) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.target_id, t.resource_id, t.ip, t.port, t.method, t.enabled
             FROM targets t
             INNER JOIN resources r ON r.resource_id = t.resource_id
             WHERE r.site_id = ?1 AND t.enabled = 1
             ORDER BY t.target_id",
        )?;
        let rows = stmt.query_map(params![site_id], target_from_row)?;

        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }
}

const SELECT_SITE: &str = "SELECT sites.site_id, sites.org_id, sites.name, sites.kind, \
     sites.exit_node_id, sites.endpoint, sites.subnet, sites.public_key, \
     sites.last_hole_punch, sites.address FROM sites";

const SELECT_TARGET: &str =
    "SELECT target_id, resource_id, ip, port, method, enabled FROM targets";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        site_id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        kind: row.get::<_, String>(3)?.parse().unwrap_or_default(),
        exit_node_id: row.get(4)?,
        endpoint: row.get(5)?,
        subnet: row.get(6)?,
        public_key: row.get(7)?,
        last_hole_punch: row.get(8)?,
        address: row.get(9)?,
    })
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        client_id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        pub_key: row.get(3)?,
        subnet: row.get(4)?,
        endpoint: row.get(5)?,
        last_hole_punch: row.get(6)?,
        exit_node_id: row.get(7)?,
    })
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        target_id: row.get(0)?,
        resource_id: row.get(1)?,
        ip: row.get(2)?,
        port: row.get(3)?,
        method: row.get(4)?,
        enabled: row.get(5)?,
    })
}
