//! The boundary with the contacts, campaign-editing, and content-generation
//! layers: what they write before launch, and what the worker reads back
//! when it sends.
//!
//! Contacts and content can only change while a campaign is `draft` or
//! `ready`.

use crate::error::{Error, Result};
use crate::model::campaign::{CampaignStatus, Template};
use crate::model::contact::{Contact, SequenceEmail};
use crate::model::{CampaignId, ContactId, OwnerId};
use sqlx::PgConnection;
use uuid::Uuid;

/// Builder for creating a campaign in `draft`.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub(crate) owner_id: OwnerId,
    pub(crate) name: String,
    pub(crate) template: Option<Template>,
    pub(crate) from_account_id: Option<Uuid>,
}

impl NewCampaign {
    pub fn new(owner_id: OwnerId, name: impl Into<String>) -> Self {
        Self {
            owner_id,
            name: name.into(),
            template: None,
            from_account_id: None,
        }
    }

    pub fn template(mut self, subject: impl Into<String>, body: impl Into<String>) -> Self {
        self.template = Some(Template {
            subject: subject.into(),
            body: body.into(),
        });
        self
    }

    pub fn from_account(mut self, account_id: Uuid) -> Self {
        self.from_account_id = Some(account_id);
        self
    }
}

/// Everything needed to send one email.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub from_account_id: Uuid,
    pub to: String,
    pub first_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub unsubscribe_token: Uuid,
}

/// Lock an owned campaign and make sure its contacts and content may change.
async fn lock_editable_on(conn: &mut PgConnection, owner: OwnerId, id: CampaignId) -> Result<()> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM campaigns WHERE id = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(id.0)
    .bind(owner.0)
    .fetch_optional(&mut *conn)
    .await?;

    let status: CampaignStatus = row
        .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?
        .0
        .parse()?;
    if status.is_editable() {
        Ok(())
    } else {
        Err(Error::Locked { status })
    }
}

impl super::Db {
    /// Create a contact.
    pub async fn create_contact(
        &self,
        owner: OwnerId,
        email: &str,
        first_name: Option<&str>,
    ) -> Result<Contact> {
        let id = ContactId::new();
        sqlx::query(
            "INSERT INTO contacts (id, owner_id, email, first_name, created_at)
             VALUES ($1, $2, $3, $4, now())",
        )
        .bind(id.0)
        .bind(owner.0)
        .bind(email)
        .bind(first_name)
        .execute(&self.pool)
        .await?;

        Ok(Contact {
            id,
            owner_id: owner,
            email: email.to_string(),
            first_name: first_name.map(str::to_string),
        })
    }

    /// Create a campaign in `draft`.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<CampaignId> {
        let id = CampaignId::new();
        let (subject, body) = match new.template {
            Some(t) => (Some(t.subject), Some(t.body)),
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO campaigns (id, owner_id, name, status, subject, body, from_account_id, created_at, updated_at)
             VALUES ($1, $2, $3, 'draft', $4, $5, $6, now(), now())",
        )
        .bind(id.0)
        .bind(new.owner_id.0)
        .bind(&new.name)
        .bind(subject)
        .bind(body)
        .bind(new.from_account_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(campaign_id = %id, name = %new.name, "campaign created");
        Ok(id)
    }

    /// Replace the campaign's uniform template.
    pub async fn set_template(
        &self,
        owner: OwnerId,
        id: CampaignId,
        template: &Template,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        lock_editable_on(&mut tx, owner, id).await?;
        sqlx::query("UPDATE campaigns SET subject = $2, body = $3, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .bind(&template.subject)
            .bind(&template.body)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Set the sending email account.
    pub async fn set_from_account(
        &self,
        owner: OwnerId,
        id: CampaignId,
        account_id: Uuid,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        lock_editable_on(&mut tx, owner, id).await?;
        sqlx::query("UPDATE campaigns SET from_account_id = $2, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Attach a contact to a campaign as `pending`. Returns `false` if it was
    /// already attached.
    pub async fn attach_contact(
        &self,
        owner: OwnerId,
        id: CampaignId,
        contact_id: ContactId,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        lock_editable_on(&mut tx, owner, id).await?;

        let owns_contact: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM contacts WHERE id = $1 AND owner_id = $2")
                .bind(contact_id.0)
                .bind(owner.0)
                .fetch_optional(&mut *tx)
                .await?;
        if owns_contact.is_none() {
            return Err(Error::NotFound(format!("contact {contact_id}")));
        }

        let inserted = sqlx::query(
            "INSERT INTO campaign_contacts (campaign_id, contact_id, status, current_email_number, total_emails, created_at, updated_at)
             VALUES ($1, $2, 'pending', 1, 1, now(), now())
             ON CONFLICT (campaign_id, contact_id) DO NOTHING",
        )
        .bind(id.0)
        .bind(contact_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(inserted == 1)
    }

    /// Detach a contact before launch, along with its saved sequence.
    pub async fn detach_contact(
        &self,
        owner: OwnerId,
        id: CampaignId,
        contact_id: ContactId,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        lock_editable_on(&mut tx, owner, id).await?;

        sqlx::query("DELETE FROM sequence_emails WHERE campaign_id = $1 AND contact_id = $2")
            .bind(id.0)
            .bind(contact_id.0)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query(
            "DELETE FROM campaign_contacts WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(id.0)
        .bind(contact_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(removed == 1)
    }

    /// Save (replace) a contact's generated sequence. Emails must be numbered
    /// 1..=N in order.
    pub async fn save_sequence(
        &self,
        owner: OwnerId,
        id: CampaignId,
        contact_id: ContactId,
        emails: &[SequenceEmail],
    ) -> Result<()> {
        let numbered = emails
            .iter()
            .enumerate()
            .all(|(i, email)| email.email_number as usize == i + 1);
        if emails.is_empty() || !numbered {
            return Err(Error::InvalidInput(
                "sequence emails must be numbered 1..=N in order".to_string(),
            ));
        }

        let mut tx = self.begin().await?;
        lock_editable_on(&mut tx, owner, id).await?;

        let attached: Option<(Uuid,)> = sqlx::query_as(
            "SELECT contact_id FROM campaign_contacts WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(id.0)
        .bind(contact_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if attached.is_none() {
            return Err(Error::NotFound(format!(
                "contact {contact_id} in campaign {id}"
            )));
        }

        sqlx::query("DELETE FROM sequence_emails WHERE campaign_id = $1 AND contact_id = $2")
            .bind(id.0)
            .bind(contact_id.0)
            .execute(&mut *tx)
            .await?;

        for email in emails {
            sqlx::query(
                "INSERT INTO sequence_emails (campaign_id, contact_id, email_number, day_offset, subject, body, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, now())",
            )
            .bind(id.0)
            .bind(contact_id.0)
            .bind(email.email_number as i32)
            .bind(email.day_offset as i32)
            .bind(&email.subject)
            .bind(&email.body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// A contact's saved sequence, in order.
    pub async fn get_sequence(
        &self,
        id: CampaignId,
        contact_id: ContactId,
    ) -> Result<Vec<SequenceEmail>> {
        let rows: Vec<(i32, i32, String, String)> = sqlx::query_as(
            "SELECT email_number, day_offset, subject, body FROM sequence_emails
             WHERE campaign_id = $1 AND contact_id = $2
             ORDER BY email_number ASC",
        )
        .bind(id.0)
        .bind(contact_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(n, offset, subject, body)| SequenceEmail::new(n as u32, offset as u32, subject, body))
            .collect())
    }

    /// Resolve sender, recipient, content, and unsubscribe token for one send.
    /// `email_number = None` selects the campaign's uniform template.
    pub async fn outgoing_email(
        &self,
        id: CampaignId,
        contact_id: ContactId,
        email_number: Option<u32>,
    ) -> Result<OutgoingEmail> {
        let row: Option<(Option<Uuid>, Option<String>, Option<String>, String, Option<String>)> =
            sqlx::query_as(
                "SELECT c.from_account_id, c.subject, c.body, ct.email, ct.first_name
                 FROM campaigns c
                 JOIN campaign_contacts cc ON cc.campaign_id = c.id
                 JOIN contacts ct ON ct.id = cc.contact_id
                 WHERE c.id = $1 AND cc.contact_id = $2",
            )
            .bind(id.0)
            .bind(contact_id.0)
            .fetch_optional(&self.pool)
            .await?;

        let (from_account_id, template_subject, template_body, to, first_name) = row
            .ok_or_else(|| Error::NotFound(format!("contact {contact_id} in campaign {id}")))?;
        let from_account_id = from_account_id
            .ok_or_else(|| Error::Other(format!("campaign {id} has no sending account")))?;

        let (subject, body) = match email_number {
            Some(n) => {
                let email: Option<(String, String)> = sqlx::query_as(
                    "SELECT subject, body FROM sequence_emails
                     WHERE campaign_id = $1 AND contact_id = $2 AND email_number = $3",
                )
                .bind(id.0)
                .bind(contact_id.0)
                .bind(n as i32)
                .fetch_optional(&self.pool)
                .await?;
                email.ok_or_else(|| {
                    Error::NotFound(format!("sequence email {n} for contact {contact_id}"))
                })?
            }
            None => match (template_subject, template_body) {
                (Some(subject), Some(body)) => (subject, body),
                _ => return Err(Error::Other(format!("campaign {id} has no template"))),
            },
        };

        // The no-op update makes RETURNING yield the existing token on conflict.
        let (unsubscribe_token,): (Uuid,) = sqlx::query_as(
            "INSERT INTO unsubscribe_tokens (token, campaign_id, contact_id, created_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (campaign_id, contact_id) DO UPDATE SET campaign_id = EXCLUDED.campaign_id
             RETURNING token",
        )
        .bind(Uuid::new_v4())
        .bind(id.0)
        .bind(contact_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(OutgoingEmail {
            from_account_id,
            to,
            first_name,
            subject,
            body,
            unsubscribe_token,
        })
    }
}
