//! Routing of notifications to recipients.
//!
//! Routing only enqueues deliveries; the outbox worker does the sending.
use anyhow::Result;
use tracing::{info, instrument};

use crate::config::Recipients;
use crate::db::{self, Pool, Tx};
use crate::model::{Notification, Recipient, Role};

#[derive(Debug, Clone)]
pub struct Notifier {
    recipients: Recipients,
}

impl Notifier {
    pub fn new(recipients: Recipients) -> Self {
        Self { recipients }
    }

    pub fn recipients(&self) -> &Recipients {
        &self.recipients
    }

    pub fn manager_names(&self) -> Vec<String> {
        self.recipients
            .influencer_managers()
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Enqueue one delivery per recipient inside `tx`. Influencer posts go to
    /// a single manager chosen by least assignments.
    #[instrument(skip_all, fields(kind = notification.kind()))]
    pub async fn enqueue_tx(
        &self,
        tx: &mut Tx<'_>,
        notification: &Notification,
    ) -> Result<Vec<Recipient>> {
        let targets = match notification.audience() {
            Role::TeamMember => self
                .recipients
                .team_members()
                .map(|m| Recipient {
                    name: m.name.clone(),
                    chat_id: m.chat_id,
                    role: Role::TeamMember,
                })
                .collect::<Vec<_>>(),
            Role::InfluencerManager => {
                let name = db::assign_manager_tx(tx, &self.manager_names()).await?;
                self.recipients
                    .influencer_managers()
                    .iter()
                    .filter(|m| m.name == name)
                    .take(1)
                    .map(|m| Recipient {
                        name: m.name.clone(),
                        chat_id: m.chat_id,
                        role: Role::InfluencerManager,
                    })
                    .collect()
            }
        };

        let text = notification.render();
        for r in &targets {
            db::enqueue_outbox_tx(tx, r.chat_id, &r.name, notification.kind(), &text).await?;
        }
        info!(recipients = targets.len(), "notification enqueued");
        Ok(targets)
    }

    pub async fn enqueue(&self, pool: &Pool, notification: &Notification) -> Result<Vec<Recipient>> {
        let mut tx = pool.begin().await?;
        let targets = self.enqueue_tx(&mut tx, notification).await?;
        tx.commit().await?;
        Ok(targets)
    }
}
