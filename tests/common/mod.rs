//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mcm_worker::services::{
    ArticleService, ArticleVersion, Contribution, ContributionImage, ContributionService, FileStream,
    ObjectStore, SessionService, UploadResult,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub fn contribution(id: i64, article_id: i64, images: &[&str]) -> Contribution {
    Contribution {
        id,
        article_id: Some(article_id),
        images: images
            .iter()
            .map(|key| ContributionImage {
                key: key.to_string(),
                title: String::new(),
            })
            .collect(),
    }
}

#[derive(Default)]
pub struct FakeContributions {
    pub sessions: HashMap<i64, Vec<Contribution>>,
    pub failing: bool,
}

impl FakeContributions {
    /// Every manifest lookup fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: i64, contributions: Vec<Contribution>) -> Self {
        self.sessions.insert(session_id, contributions);
        self
    }
}

#[async_trait]
impl ContributionService for FakeContributions {
    async fn get_all_accepted_contributions(&self, session_id: i64) -> Result<Vec<Contribution>> {
        if self.failing {
            return Err(anyhow!("contribution repository unavailable"));
        }
        Ok(self.sessions.get(&session_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeArticles {
    pub links: HashMap<i64, String>,
}

impl FakeArticles {
    pub fn with_article(mut self, article_id: i64, link_original: &str) -> Self {
        self.links.insert(article_id, link_original.to_string());
        self
    }
}

#[async_trait]
impl ArticleService for FakeArticles {
    async fn get_latest_version_of_article(&self, article_id: i64) -> Result<ArticleVersion> {
        self.links
            .get(&article_id)
            .map(|link| ArticleVersion {
                link_original: link.clone(),
            })
            .ok_or_else(|| anyhow!("article {} not found", article_id))
    }

    async fn update_link_pdf_for_version(&self, _article_id: i64, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Object store over a key-to-bytes map. Keys can be made slow, and every
/// upload is captured.
#[derive(Default)]
pub struct FakeStore {
    objects: HashMap<String, Vec<u8>>,
    delays: Mutex<HashMap<String, Duration>>,
    uploads: Mutex<Vec<(i64, Vec<u8>)>>,
    fail_uploads: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeStore {
    pub fn with_object(mut self, key: &str, body: &[u8]) -> Self {
        self.objects.insert(key.to_string(), body.to_vec());
        self
    }

    pub fn with_delay(self, key: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
        self
    }

    pub fn with_failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn clear_delays(&self) {
        self.delays.lock().unwrap().clear();
    }

    pub fn uploads(&self) -> Vec<(i64, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_file(&self, key: &str) -> Result<FileStream> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let body = self
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {} does not exist", key))?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn upload_contribution(&self, mut file: tokio::fs::File, session_id: i64) -> Result<UploadResult> {
        if self.fail_uploads {
            return Err(anyhow!("store down"));
        }
        let mut body = Vec::new();
        file.read_to_end(&mut body).await?;
        self.uploads.lock().unwrap().push((session_id, body));
        Ok(UploadResult {
            key: format!("exports/{}.zip", session_id),
        })
    }
}

#[derive(Default)]
pub struct FakeSessions {
    updates: Mutex<Vec<(i64, String)>>,
    failing: bool,
}

impl FakeSessions {
    /// Every session update fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn updates(&self) -> Vec<(i64, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionService for FakeSessions {
    async fn update_exported_asset(&self, session_id: i64, key: &str) -> Result<()> {
        if self.failing {
            return Err(anyhow!("session repository unavailable"));
        }
        self.updates.lock().unwrap().push((session_id, key.to_string()));
        Ok(())
    }
}

/// Names of the entries in a zip archive, sorted.
pub fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

/// Number of entries directly under `dir`.
pub fn dir_len(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
