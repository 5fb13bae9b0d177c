// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::data_plane::{DataPlaneInstance, DataPlaneInstanceId};
use crate::domain::repository::{DataPlaneInstanceRepository, RepositoryError};

pub struct PostgresDataPlaneInstanceRepository {
    pool: PgPool,
}

impl PostgresDataPlaneInstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataPlaneInstanceRepository for PostgresDataPlaneInstanceRepository {
    async fn save(&self, instance: &DataPlaneInstance) -> Result<bool, RepositoryError> {
        let payload = serde_json::to_value(instance)?;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT 1 FROM data_plane_instances WHERE id = $1 FOR UPDATE")
            .bind(instance.id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO data_plane_instances (id, url, last_seen, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                last_seen = EXCLUDED.last_seen,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(instance.id.as_str())
        .bind(&instance.url)
        .bind(instance.last_seen)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(existing.is_some())
    }

    async fn find_by_id(&self, id: &DataPlaneInstanceId) -> Result<Option<DataPlaneInstance>, RepositoryError> {
        let row = sqlx::query("SELECT payload FROM data_plane_instances WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<DataPlaneInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT payload FROM data_plane_instances ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<DataPlaneInstance, RepositoryError> {
                let payload: serde_json::Value = row.try_get("payload")?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }

    async fn delete(&self, id: &DataPlaneInstanceId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM data_plane_instances WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(
        &self,
        id: &DataPlaneInstanceId,
        last_seen: DateTime<Utc>,
        load: Option<u32>,
    ) -> Result<bool, RepositoryError> {
        // The payload is what readers deserialize; keep it in step with the column
        let result = sqlx::query(
            r#"
            UPDATE data_plane_instances SET
                last_seen = $2,
                payload = jsonb_set(
                    jsonb_set(payload, '{last_seen}', $3),
                    '{load}',
                    COALESCE($4, payload->'load', 'null'::jsonb)
                )
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(last_seen)
        .bind(serde_json::to_value(last_seen)?)
        .bind(load.map(serde_json::Value::from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_stale(&self, id: &DataPlaneInstanceId, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM data_plane_instances WHERE id = $1 AND last_seen < $2")
            .bind(id.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data_plane::TransferTypeCapability;
    use crate::infrastructure::db::test_support::isolated_database;
    use chrono::Duration;
    use std::collections::HashMap;

    async fn repository() -> PostgresDataPlaneInstanceRepository {
        PostgresDataPlaneInstanceRepository::new(isolated_database().await.get_pool().clone())
    }

    fn instance(source: &str) -> DataPlaneInstance {
        DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![TransferTypeCapability::new(source, "http")],
            HashMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DSC_DATABASE_URL
    async fn test_replace_and_delete() {
        let repo = repository().await;
        assert!(!repo.save(&instance("blob")).await.unwrap());
        assert!(repo.save(&instance("s3")).await.unwrap());

        let listed = repo.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].capabilities(), &[TransferTypeCapability::new("s3", "http")]);

        assert!(repo.delete(&listed[0].id).await.unwrap());
        assert!(!repo.delete(&listed[0].id).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DSC_DATABASE_URL
    async fn test_touch_updates_liveness_in_place() {
        let repo = repository().await;
        let saved = instance("blob");
        repo.save(&saved).await.unwrap();

        let seen = saved.last_seen + Duration::seconds(30);
        assert!(repo.touch(&saved.id, seen, Some(4)).await.unwrap());
        assert!(repo.touch(&saved.id, seen, None).await.unwrap());

        let stored = repo.find_by_id(&saved.id).await.unwrap().unwrap();
        assert_eq!(stored.last_seen, seen);
        assert_eq!(stored.load, Some(4));
        assert_eq!(stored.capabilities(), saved.capabilities());

        repo.delete(&saved.id).await.unwrap();
        assert!(!repo.touch(&saved.id, seen, None).await.unwrap());
        assert!(repo.find_by_id(&saved.id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DSC_DATABASE_URL
    async fn test_delete_if_stale_spares_recently_seen() {
        let repo = repository().await;
        let saved = instance("blob");
        repo.save(&saved).await.unwrap();

        let seen = saved.last_seen + Duration::minutes(10);
        repo.touch(&saved.id, seen, None).await.unwrap();

        assert!(!repo.delete_if_stale(&saved.id, saved.last_seen + Duration::minutes(5)).await.unwrap());
        assert!(repo.delete_if_stale(&saved.id, seen + Duration::seconds(1)).await.unwrap());
        assert!(repo.list_all().await.unwrap().is_empty());
    }
}
