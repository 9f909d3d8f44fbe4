//! Interfaces of the back-end services the worker depends on.
//!
//! The relational repositories, mailer, converter and blob store live
//! outside this crate; handlers only see these traits. [`crate::api_client`]
//! implements all of them over the back end's internal HTTP API.

use crate::message::LoggedInUser;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Readable body of a stored object.
pub type FileStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub id: i64,
    pub article_id: Option<i64>,
    #[serde(default)]
    pub images: Vec<ContributionImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionImage {
    pub key: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleVersion {
    pub link_original: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    MarketingCoordinator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::MarketingCoordinator => "marketing_coordinator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub to_addresses: Vec<String>,
}

/// Template variables of the "new contribution" email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContributionEmail {
    pub name: String,
    pub student_name: String,
    pub link: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContributionService: Send + Sync {
    /// Contributions of the session whose review status is "accepted".
    async fn get_all_accepted_contributions(&self, session_id: i64) -> Result<Vec<Contribution>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArticleService: Send + Sync {
    async fn get_latest_version_of_article(&self, article_id: i64) -> Result<ArticleVersion>;

    /// Records the converted PDF of the article's latest version.
    async fn update_link_pdf_for_version(&self, article_id: i64, key: &str) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_file(&self, key: &str) -> Result<FileStream>;

    /// Uploads an exported session archive and returns its storage key.
    async fn upload_contribution(&self, file: tokio::fs::File, session_id: i64) -> Result<UploadResult>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn update_exported_asset(&self, session_id: i64, key: &str) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_all_users_of_faculty(&self, role: Role, faculty_id: i64) -> Result<Vec<User>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_new_contribution_email(
        &self,
        destination: &Destination,
        payload: &NewContributionEmail,
    ) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Converts the stored document at `link` to PDF and stores the result.
    async fn convert(&self, link: &str, user: &LoggedInUser) -> Result<UploadResult>;
}
