//! Handler for `contribution-created`: emails the faculty's marketing coordinators.

use crate::context::JobContext;
use crate::error::JobError;
use crate::message::{ContributionCreatedPayload, Message, Topic};
use crate::services::{Destination, NewContributionEmail, NotificationService, Role, UserService};
use crate::worker::JobHandler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

pub struct ContributionNotifier {
    users: Arc<dyn UserService>,
    notifications: Arc<dyn NotificationService>,
    web_app_url: String,
}

impl ContributionNotifier {
    pub fn new(
        users: Arc<dyn UserService>,
        notifications: Arc<dyn NotificationService>,
        web_app_url: impl Into<String>,
    ) -> Self {
        Self {
            users,
            notifications,
            web_app_url: web_app_url.into(),
        }
    }

    fn contribution_link(&self, contribution_id: i64) -> String {
        format!(
            "{}/contributions/{}",
            self.web_app_url.trim_end_matches('/'),
            contribution_id
        )
    }

    async fn notify(&self, ctx: &JobContext, payload: &ContributionCreatedPayload) -> Result<(), JobError> {
        let coordinators = ctx
            .run(
                self.users
                    .get_all_users_of_faculty(Role::MarketingCoordinator, payload.faculty_id),
            )
            .await?;

        if coordinators.is_empty() {
            info!(
                faculty_id = payload.faculty_id,
                "No marketing coordinator to send email to"
            );
            return Ok(());
        }

        let link = self.contribution_link(payload.contribution_id);
        for coordinator in coordinators {
            let destination = Destination {
                to_addresses: vec![coordinator.email.clone()],
            };
            let email = NewContributionEmail {
                name: coordinator.name.clone(),
                student_name: payload.user_name.clone(),
                link: link.clone(),
            };

            match ctx
                .run(self.notifications.send_new_contribution_email(&destination, &email))
                .await
            {
                Ok(()) => info!(user_id = coordinator.id, "Sent new contribution email"),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => error!(
                    user_id = coordinator.id,
                    email = %coordinator.email,
                    error = %e,
                    "Send email failed"
                ),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for ContributionNotifier {
    async fn handle(&self, ctx: &JobContext, message: &Message) -> Result<(), JobError> {
        match message {
            Message::ContributionCreated(payload) => self.notify(ctx, payload).await,
            other => Err(JobError::UnexpectedPayload {
                expected: Topic::ContributionCreated,
                actual: other.topic(),
            }),
        }
    }
}
