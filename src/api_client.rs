//! HTTP client for the back end's internal API.
//!
//! The worker reaches every collaborator through the API service rather
//! than through the database or blob store directly:
//!
//! | Call | Endpoint |
//! |---|---|
//! | accepted contributions | `GET /internal/contribute-sessions/{id}/contributions?status=accepted` |
//! | exported asset | `PUT /internal/contribute-sessions/{id}/exported-assets` |
//! | latest article version | `GET /internal/articles/{id}/versions/latest` |
//! | article PDF link | `PUT /internal/articles/{id}/versions/latest/link-pdf` |
//! | faculty users | `GET /internal/faculties/{id}/users?role=...` |
//! | email | `POST /internal/notifications/new-contribution` |
//! | conversion | `POST /internal/converter/convert` |
//! | download | `GET /internal/media/files?key=...` |
//! | archive upload | `POST /internal/media/contributions?contributeSessionId=...` |

use crate::message::LoggedInUser;
use crate::services::{
    ArticleService, ArticleVersion, Contribution, ContributionService, Destination, DocumentConverter,
    FileStream, NewContributionEmail, NotificationService, ObjectStore, Role, SessionService,
    UploadResult, User, UserService,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::io::StreamReader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?
            .error_for_status()
            .with_context(|| format!("GET {} was rejected", path))?;

        response
            .json()
            .await
            .with_context(|| format!("GET {} returned an unexpected body", path))
    }

    async fn send_json<B: Serialize + ?Sized>(&self, method: reqwest::Method, path: &str, body: &B) -> Result<reqwest::Response> {
        self.http
            .request(method.clone(), self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, path))?
            .error_for_status()
            .with_context(|| format!("{} {} was rejected", method, path))
    }
}

#[async_trait]
impl ContributionService for ApiClient {
    async fn get_all_accepted_contributions(&self, session_id: i64) -> Result<Vec<Contribution>> {
        let path = format!("/internal/contribute-sessions/{}/contributions", session_id);
        self.get_json(&path, &[("status", "accepted")]).await
    }
}

#[async_trait]
impl SessionService for ApiClient {
    async fn update_exported_asset(&self, session_id: i64, key: &str) -> Result<()> {
        let path = format!("/internal/contribute-sessions/{}/exported-assets", session_id);
        self.send_json(reqwest::Method::PUT, &path, &json!({ "key": key }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleService for ApiClient {
    async fn get_latest_version_of_article(&self, article_id: i64) -> Result<ArticleVersion> {
        let path = format!("/internal/articles/{}/versions/latest", article_id);
        self.get_json(&path, &[]).await
    }

    async fn update_link_pdf_for_version(&self, article_id: i64, key: &str) -> Result<()> {
        let path = format!("/internal/articles/{}/versions/latest/link-pdf", article_id);
        self.send_json(reqwest::Method::PUT, &path, &json!({ "key": key }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserService for ApiClient {
    async fn get_all_users_of_faculty(&self, role: Role, faculty_id: i64) -> Result<Vec<User>> {
        let path = format!("/internal/faculties/{}/users", faculty_id);
        self.get_json(&path, &[("role", role.as_str())]).await
    }
}

#[async_trait]
impl NotificationService for ApiClient {
    async fn send_new_contribution_email(
        &self,
        destination: &Destination,
        payload: &NewContributionEmail,
    ) -> Result<()> {
        let body = json!({ "destination": destination, "payload": payload });
        self.send_json(reqwest::Method::POST, "/internal/notifications/new-contribution", &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentConverter for ApiClient {
    async fn convert(&self, link: &str, user: &LoggedInUser) -> Result<UploadResult> {
        let body = json!({ "link": link, "user": user });
        let response = self
            .send_json(reqwest::Method::POST, "/internal/converter/convert", &body)
            .await?;
        response
            .json()
            .await
            .context("Converter returned an unexpected body")
    }
}

#[async_trait]
impl ObjectStore for ApiClient {
    async fn get_file(&self, key: &str) -> Result<FileStream> {
        let response = self
            .http
            .get(self.url("/internal/media/files"))
            .query(&[("key", key)])
            .send()
            .await
            .with_context(|| format!("Failed to fetch object {}", key))?
            .error_for_status()
            .with_context(|| format!("Object {} is unavailable", key))?;

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn upload_contribution(&self, file: tokio::fs::File, session_id: i64) -> Result<UploadResult> {
        let session_id = session_id.to_string();
        let response = self
            .http
            .post(self.url("/internal/media/contributions"))
            .query(&[("contributeSessionId", session_id.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(reqwest::Body::from(file))
            .send()
            .await
            .context("Failed to upload export archive")?
            .error_for_status()
            .context("Export archive upload was rejected")?;

        response
            .json()
            .await
            .context("Upload returned an unexpected body")
    }
}
