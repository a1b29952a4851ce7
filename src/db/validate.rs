//! Campaign readiness check.
//!
//! Read-only and independent of the campaign's current status. Used as the
//! launch gate and as a user-facing readiness report. Sender credentials are
//! verified by the mailer when the campaign is created; they are not
//! rechecked here.

use crate::error::Result;
use crate::model::campaign::{Readiness, ValidationReason};
use crate::model::{CampaignId, OwnerId};
use sqlx::PgConnection;

/// Raw facts about a campaign that readiness is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct ReadinessFacts {
    pub contacts: i64,
    /// Attached contacts without a complete, non-blank saved sequence.
    pub incomplete_sequences: i64,
    pub has_from_account: bool,
    pub has_template: bool,
}

impl ReadinessFacts {
    /// Every failing reason, in a stable order.
    pub fn readiness(&self) -> Readiness {
        let mut reasons = Vec::new();
        if self.contacts == 0 {
            reasons.push(ValidationReason::NoContacts);
        }
        if !self.has_from_account {
            reasons.push(ValidationReason::NoFromAccount);
        }
        let every_contact_sequenced = self.contacts > 0 && self.incomplete_sequences == 0;
        if !every_contact_sequenced && !self.has_template {
            reasons.push(ValidationReason::MissingEmailContent);
        }
        Readiness::from_reasons(reasons)
    }
}

/// A saved sequence is complete when it numbers 1..=N without gaps and no
/// email has a blank subject or body.
pub(crate) const COMPLETE_SEQUENCE_EXISTS: &str = "EXISTS (
    SELECT 1 FROM sequence_emails se
    WHERE se.campaign_id = cc.campaign_id AND se.contact_id = cc.contact_id
    HAVING count(*) > 0
       AND count(*) = max(se.email_number)
       AND bool_and(btrim(se.subject) <> '' AND btrim(se.body) <> '')
)";

/// Readiness check on an existing connection or transaction.
pub(crate) async fn validate_on(
    conn: &mut PgConnection,
    owner: OwnerId,
    id: CampaignId,
) -> Result<Readiness> {
    let facts: Option<ReadinessFacts> = sqlx::query_as(&format!(
        "SELECT
            (SELECT count(*) FROM campaign_contacts cc WHERE cc.campaign_id = c.id) AS contacts,
            (SELECT count(*) FROM campaign_contacts cc
              WHERE cc.campaign_id = c.id AND NOT {COMPLETE_SEQUENCE_EXISTS}) AS incomplete_sequences,
            c.from_account_id IS NOT NULL AS has_from_account,
            (COALESCE(btrim(c.subject), '') <> '' AND COALESCE(btrim(c.body), '') <> '') AS has_template
         FROM campaigns c
         WHERE c.id = $1 AND c.owner_id = $2"
    ))
    .bind(id.0)
    .bind(owner.0)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match facts {
        Some(facts) => facts.readiness(),
        None => Readiness::from_reasons(vec![ValidationReason::NotFound]),
    })
}

impl super::Db {
    /// Check whether a campaign could launch right now.
    ///
    /// A missing or foreign campaign yields only `NOT_FOUND`; otherwise every
    /// failing check is reported together.
    pub async fn validate(&self, owner: OwnerId, id: CampaignId) -> Result<Readiness> {
        let mut conn = self.pool.acquire().await?;
        validate_on(&mut conn, owner, id).await
    }
}
