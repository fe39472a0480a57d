//! Versioned binary artifacts attached to a session.
//!
//! Filenames starting with `user:` are scoped to the user rather than the
//! session, so every session of that user sees them.

use crate::error::WeftError;
use crate::session::{SessionKey, USER_PREFIX};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[async_trait]
pub trait ArtifactService: Send + Sync {
    /// Store a new version; versions start at 0.
    async fn save(
        &self,
        key: &SessionKey,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u64, WeftError>;

    /// Load `version`, or the latest when `None`.
    async fn load(
        &self,
        key: &SessionKey,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Artifact>, WeftError>;

    /// Filenames visible to the session, sorted.
    async fn list(&self, key: &SessionKey) -> Result<Vec<String>, WeftError>;

    async fn delete(&self, key: &SessionKey, filename: &str) -> Result<(), WeftError>;

    async fn versions(&self, key: &SessionKey, filename: &str) -> Result<Vec<u64>, WeftError>;
}

#[derive(Default)]
pub struct InMemoryArtifactService {
    artifacts: RwLock<HashMap<String, Vec<Artifact>>>,
}

impl InMemoryArtifactService {
    pub fn new() -> Self {
        Self::default()
    }

    fn path(key: &SessionKey, filename: &str) -> String {
        if filename.starts_with(USER_PREFIX) {
            format!("{}/{}/user/{}", key.app, key.user, filename)
        } else {
            format!("{}/{}/{}/{}", key.app, key.user, key.session, filename)
        }
    }
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn save(
        &self,
        key: &SessionKey,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u64, WeftError> {
        let mut artifacts = self.artifacts.write().await;
        let versions = artifacts.entry(Self::path(key, filename)).or_default();
        versions.push(artifact);
        Ok(versions.len() as u64 - 1)
    }

    async fn load(
        &self,
        key: &SessionKey,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Artifact>, WeftError> {
        let artifacts = self.artifacts.read().await;
        let Some(versions) = artifacts.get(&Self::path(key, filename)) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.get(v as usize).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn list(&self, key: &SessionKey) -> Result<Vec<String>, WeftError> {
        let artifacts = self.artifacts.read().await;
        let session_prefix = format!("{}/{}/{}/", key.app, key.user, key.session);
        let user_prefix = format!("{}/{}/user/", key.app, key.user);
        let mut names: Vec<String> = artifacts
            .keys()
            .filter_map(|path| {
                path.strip_prefix(&session_prefix)
                    .or_else(|| path.strip_prefix(&user_prefix))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, key: &SessionKey, filename: &str) -> Result<(), WeftError> {
        self.artifacts
            .write()
            .await
            .remove(&Self::path(key, filename))
            .map(|_| ())
            .ok_or_else(|| WeftError::not_found("artifact", filename))
    }

    async fn versions(&self, key: &SessionKey, filename: &str) -> Result<Vec<u64>, WeftError> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts
            .get(&Self::path(key, filename))
            .map(|v| (0..v.len() as u64).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_increment_and_latest_wins() {
        let svc = InMemoryArtifactService::new();
        let key = SessionKey::new("pdf_app", "u1", "s1");
        assert_eq!(svc.save(&key, "report.pdf", Artifact::text("v0")).await.unwrap(), 0);
        assert_eq!(svc.save(&key, "report.pdf", Artifact::text("v1")).await.unwrap(), 1);

        let latest = svc.load(&key, "report.pdf", None).await.unwrap().unwrap();
        assert_eq!(latest.data, b"v1");
        let first = svc.load(&key, "report.pdf", Some(0)).await.unwrap().unwrap();
        assert_eq!(first.data, b"v0");
        assert!(svc.load(&key, "report.pdf", Some(7)).await.unwrap().is_none());
        assert_eq!(svc.versions(&key, "report.pdf").await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_user_scoped_artifacts_cross_sessions() {
        let svc = InMemoryArtifactService::new();
        let s1 = SessionKey::new("pdf_app", "u1", "s1");
        let s2 = SessionKey::new("pdf_app", "u1", "s2");
        svc.save(&s1, "user:avatar.png", Artifact::new("image/png", vec![1, 2, 3]))
            .await
            .unwrap();
        svc.save(&s1, "notes.txt", Artifact::text("private"))
            .await
            .unwrap();

        assert_eq!(svc.list(&s2).await.unwrap(), vec!["user:avatar.png"]);
        assert_eq!(
            svc.list(&s1).await.unwrap(),
            vec!["notes.txt", "user:avatar.png"]
        );

        svc.delete(&s1, "notes.txt").await.unwrap();
        assert!(svc.delete(&s1, "notes.txt").await.is_err());
    }

    #[test]
    fn test_artifact_json_is_base64() {
        let artifact = Artifact::new("application/pdf", b"%PDF".to_vec());
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["mimeType"], "application/pdf");
        assert_eq!(json["data"], "JVBERg==");
        let back: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);
    }
}
