//! Append-only campaign event log.

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{CampaignId, ContactId};
use sqlx::PgConnection;
use uuid::Uuid;

/// Append an event on an existing connection or transaction.
pub(crate) async fn record_event_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
    contact_id: Option<ContactId>,
    kind: &EventKind,
) -> Result<i64> {
    let kind_json = serde_json::to_value(kind)
        .map_err(|e| Error::Other(format!("serialize event: {e}")))?;

    let (seq,): (i64,) = sqlx::query_as(
        "INSERT INTO campaign_events (campaign_id, contact_id, kind, created_at)
         VALUES ($1, $2, $3, now())
         RETURNING seq",
    )
    .bind(campaign_id.0)
    .bind(contact_id.map(|c| c.0))
    .bind(kind_json)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(campaign_id = %campaign_id, seq, event = kind.name(), "event recorded");
    Ok(seq)
}

impl super::Db {
    /// Append an event outside any other write.
    pub async fn record_event(
        &self,
        campaign_id: CampaignId,
        contact_id: Option<ContactId>,
        kind: &EventKind,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        record_event_on(&mut conn, campaign_id, contact_id, kind).await
    }

    /// Events for a campaign after `since_seq`, oldest first.
    pub async fn list_events(&self, campaign_id: CampaignId, since_seq: i64) -> Result<Vec<Event>> {
        let rows: Vec<(i64, Option<Uuid>, chrono::DateTime<chrono::Utc>, serde_json::Value)> =
            sqlx::query_as(
                "SELECT seq, contact_id, created_at, kind FROM campaign_events
                 WHERE campaign_id = $1 AND seq > $2
                 ORDER BY seq ASC",
            )
            .bind(campaign_id.0)
            .bind(since_seq)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(seq, contact_id, timestamp, kind)| {
                let kind: EventKind = serde_json::from_value(kind)
                    .map_err(|e| Error::Other(format!("bad event {seq}: {e}")))?;
                Ok(Event {
                    seq,
                    contact_id: contact_id.map(ContactId),
                    timestamp,
                    kind,
                })
            })
            .collect()
    }
}
