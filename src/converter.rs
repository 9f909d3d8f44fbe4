//! Handler for `article-uploaded`: converts the uploaded document to PDF.

use crate::context::JobContext;
use crate::error::JobError;
use crate::message::{ArticleUploadedPayload, Message, Topic};
use crate::services::{ArticleService, DocumentConverter};
use crate::worker::JobHandler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Converts an uploaded article and records the PDF on its latest version.
pub struct ArticleConverter {
    converter: Arc<dyn DocumentConverter>,
    articles: Arc<dyn ArticleService>,
}

impl ArticleConverter {
    pub fn new(converter: Arc<dyn DocumentConverter>, articles: Arc<dyn ArticleService>) -> Self {
        Self { converter, articles }
    }

    async fn convert(&self, ctx: &JobContext, payload: &ArticleUploadedPayload) -> Result<(), JobError> {
        info!(article_id = payload.article_id, link = %payload.link, "Converting article to PDF");

        let result = ctx
            .run(self.converter.convert(&payload.link, &payload.user))
            .await?;
        ctx.run(
            self.articles
                .update_link_pdf_for_version(payload.article_id, &result.key),
        )
        .await?;

        info!(article_id = payload.article_id, key = %result.key, "Article PDF ready");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ArticleConverter {
    async fn handle(&self, ctx: &JobContext, message: &Message) -> Result<(), JobError> {
        match message {
            Message::ArticleUploaded(payload) => self.convert(ctx, payload).await,
            other => Err(JobError::UnexpectedPayload {
                expected: Topic::ArticleUploaded,
                actual: other.topic(),
            }),
        }
    }
}
