// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Agent Registry Repository
//!
//! `AgentRegistryRepository` backed by the `agents` and `agent_topics`
//! tables. Lease renewal and expiry are single conditional `UPDATE`s, so two
//! replicas running the expiry checker never race a heartbeat into an
//! inconsistent state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery, TopicRole, TopicSubscription};
use crate::domain::envelope::AgentIdentity;
use crate::domain::repository::{AgentRegistryRepository, RepositoryError};

pub struct PostgresAgentRegistryRepository {
    pool: PgPool,
}

const AGENT_COLUMNS: &str =
    "agent_id, agent_type, version, tenant, project, capabilities, status, last_heartbeat, lease_until, registered_at";

impl PostgresAgentRegistryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn topics_for(&self, agent_ids: &[String]) -> Result<HashMap<String, Vec<TopicSubscription>>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, topic, role
            FROM agent_topics
            WHERE agent_id = ANY($1)
            ORDER BY agent_id, topic
            "#,
        )
        .bind(agent_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let mut topics: HashMap<String, Vec<TopicSubscription>> = HashMap::new();
        for row in rows {
            let role_str: String = row.get("role");
            let role = TopicRole::parse(&role_str)
                .ok_or_else(|| RepositoryError::Serialization(format!("unknown topic role '{}'", role_str)))?;
            topics.entry(row.get("agent_id")).or_default().push(TopicSubscription {
                topic: row.get("topic"),
                role,
            });
        }
        Ok(topics)
    }

    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<AgentRegistration>, RepositoryError> {
        let mut registrations = rows.iter().map(row_to_registration).collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = registrations.iter().map(|r| r.agent_id().to_string()).collect();
        let mut topics = self.topics_for(&ids).await?;
        for registration in &mut registrations {
            registration.topics = topics.remove(registration.agent_id()).unwrap_or_default();
        }
        Ok(registrations)
    }
}

fn row_to_registration(row: &PgRow) -> Result<AgentRegistration, RepositoryError> {
    let status_str: String = row.get("status");
    let status = AgentStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown agent status '{}'", status_str)))?;
    let capabilities: Vec<String> = row.get("capabilities");
    Ok(AgentRegistration {
        identity: AgentIdentity {
            agent_type: row.get("agent_type"),
            id: row.get("agent_id"),
            version: row.get("version"),
        },
        tenant: row.get("tenant"),
        project: row.get("project"),
        capabilities: capabilities.into_iter().collect(),
        status,
        last_heartbeat: row.get("last_heartbeat"),
        lease_until: row.get("lease_until"),
        topics: Vec::new(),
        registered_at: row.get("registered_at"),
    })
}

#[async_trait]
impl AgentRegistryRepository for PostgresAgentRegistryRepository {
    async fn upsert(&self, registration: &AgentRegistration) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let capabilities: Vec<&str> = registration.capabilities.iter().map(String::as_str).collect();

        sqlx::query(
            r#"
            INSERT INTO agents (
                agent_id, agent_type, version, tenant, project, capabilities,
                status, last_heartbeat, lease_until, registered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (agent_id) DO UPDATE SET
                agent_type = EXCLUDED.agent_type,
                version = EXCLUDED.version,
                tenant = EXCLUDED.tenant,
                project = EXCLUDED.project,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                lease_until = EXCLUDED.lease_until
            "#,
        )
        .bind(registration.agent_id())
        .bind(&registration.identity.agent_type)
        .bind(&registration.identity.version)
        .bind(&registration.tenant)
        .bind(&registration.project)
        .bind(&capabilities)
        .bind(registration.status.as_str())
        .bind(registration.last_heartbeat)
        .bind(registration.lease_until)
        .bind(registration.registered_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to register agent: {}", e)))?;

        sqlx::query("DELETE FROM agent_topics WHERE agent_id = $1")
            .bind(registration.agent_id())
            .execute(&mut *tx)
            .await?;

        for subscription in &registration.topics {
            sqlx::query("INSERT INTO agent_topics (agent_id, topic, role) VALUES ($1, $2, $3)")
                .bind(registration.agent_id())
                .bind(&subscription.topic)
                .bind(subscription.role.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to save topic subscription: {}", e)))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, agent_id: &str) -> Result<Option<AgentRegistration>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1"))
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(self.hydrate(rows).await?.into_iter().next())
    }

    async fn renew_lease(
        &self,
        agent_id: &str,
        status: AgentStatus,
        heartbeat_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<AgentRegistration>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE agents
            SET status = $2, last_heartbeat = $3, lease_until = $4
            WHERE agent_id = $1 AND status <> 'UNAVAILABLE'
            RETURNING {AGENT_COLUMNS}
            "#
        ))
        .bind(agent_id)
        .bind(status.as_str())
        .bind(heartbeat_at)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to renew lease: {}", e)))?;
        Ok(self.hydrate(rows).await?.into_iter().next())
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool, RepositoryError> {
        let affected = sqlx::query("UPDATE agents SET status = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn find_matching(&self, query: &DiscoveryQuery) -> Result<Vec<AgentRegistration>, RepositoryError> {
        let statuses: Vec<&str> = query.statuses.iter().map(AgentStatus::as_str).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {AGENT_COLUMNS}
            FROM agents
            WHERE tenant = $1
              AND project = $2
              AND status = ANY($3)
              AND capabilities @> $4
              AND ($5::TEXT IS NULL OR agent_type = $5)
            "#
        ))
        .bind(&query.tenant)
        .bind(&query.project)
        .bind(&statuses)
        .bind(&query.capabilities)
        .bind(query.agent_type.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to discover agents: {}", e)))?;
        self.hydrate(rows).await
    }

    async fn list_all(&self) -> Result<Vec<AgentRegistration>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        self.hydrate(rows).await
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            UPDATE agents
            SET status = 'UNAVAILABLE'
            WHERE status <> 'UNAVAILABLE' AND lease_until < $1
            RETURNING agent_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to expire leases: {}", e)))?;
        let mut expired: Vec<String> = rows.iter().map(|row| row.get("agent_id")).collect();
        expired.sort();
        Ok(expired)
    }

    async fn add_topic(&self, agent_id: &str, subscription: &TopicSubscription) -> Result<bool, RepositoryError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO agent_topics (agent_id, topic, role)
            SELECT agent_id, $2, $3 FROM agents WHERE agent_id = $1
            ON CONFLICT (agent_id, topic) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(agent_id)
        .bind(&subscription.topic)
        .bind(subscription.role.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to subscribe topic: {}", e)))?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn remove_topic(&self, agent_id: &str, topic: &str) -> Result<bool, RepositoryError> {
        let affected = sqlx::query("DELETE FROM agent_topics WHERE agent_id = $1 AND topic = $2")
            .bind(agent_id)
            .bind(topic)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn purge_unavailable_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let affected = sqlx::query("DELETE FROM agents WHERE status = 'UNAVAILABLE' AND lease_until < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to purge agents: {}", e)))?
            .rows_affected();
        Ok(affected)
    }
}
