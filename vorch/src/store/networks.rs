use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, transition};
use crate::error::Result;
use crate::model::{NetworkPatch, NetworkState, NetworkStatus, VirtualNetwork, timestamp};

const COLUMNS: &str =
    "id, name, bridge, state, status, user_id, information, created_at, updated_at";

pub struct NetworkRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> NetworkRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_name(&mut self, name: &str) -> Result<Option<VirtualNetwork>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM networks WHERE name = ?"))
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(network_from_row).transpose()
    }

    pub async fn set_state(&mut self, id: &str, state: NetworkState) -> Result<()> {
        sqlx::query("UPDATE networks SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(timestamp())
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for NetworkRepo<'_> {
    type Entity = VirtualNetwork;
    type Patch = NetworkPatch;
    type Status = NetworkStatus;

    async fn find(&mut self, id: &str) -> Result<Option<VirtualNetwork>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM networks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(network_from_row).transpose()
    }

    async fn get_all(&mut self) -> Result<Vec<VirtualNetwork>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM networks ORDER BY created_at"))
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter().map(network_from_row).collect()
    }

    async fn add(&mut self, network: &VirtualNetwork) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO networks ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&network.id)
        .bind(&network.name)
        .bind(&network.bridge)
        .bind(network.state.as_str())
        .bind(network.status.as_str())
        .bind(&network.user_id)
        .bind(&network.information)
        .bind(&network.created_at)
        .bind(&network.updated_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM networks WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[NetworkPatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE networks SET state = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(patch.state.as_str())
            .bind(&now)
            .bind(&patch.id)
            .bind(patch.expected_status.as_str())
            .execute(&mut *self.conn)
            .await?;
            applied += result.rows_affected();
        }
        Ok(applied)
    }

    async fn transition(
        &mut self,
        id: &str,
        from: &[NetworkStatus],
        to: NetworkStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "networks", id, from, to, information).await
    }
}

fn network_from_row(r: &SqliteRow) -> Result<VirtualNetwork> {
    Ok(VirtualNetwork {
        id: r.get("id"),
        name: r.get("name"),
        bridge: r.get("bridge"),
        state: r.get::<String, _>("state").parse()?,
        status: r.get::<String, _>("status").parse()?,
        user_id: r.get("user_id"),
        information: r.get("information"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
