//! 用户档案与档案工具
//!
//! ProfileStore 每用户一个 JSON 文件（`<dir>/<user>.json`），更新经同一把锁串行并原子落盘。
//! update_feeling / update_profile / get_profile 三个工具基于它读写档案。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::MemoryError;
use crate::memory::persistence::{check_owner, encode_user_id, read_json, write_json_atomic};
use crate::tools::grammar::Literal;
use crate::tools::registry::{expect_arity, string_arg};
use crate::tools::Tool;

const MAX_FIELD_LEN: usize = 64;
const MAX_VALUE_LEN: usize = 1000;

/// 用户档案
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feeling: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feeling_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.feeling.is_none() && self.fields.is_empty()
    }
}

/// 档案存储
#[derive(Debug)]
pub struct ProfileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_user_id(user_id)))
    }

    /// 读取档案；不存在时返回空档案
    pub async fn load(&self, user_id: &str) -> Result<UserProfile, MemoryError> {
        let profile: Option<UserProfile> = read_json(&self.path(user_id)).await?;
        if let Some(profile) = &profile {
            check_owner(user_id, &profile.user_id)?;
        }
        Ok(profile.unwrap_or_else(|| UserProfile {
            user_id: user_id.to_string(),
            ..UserProfile::default()
        }))
    }

    /// 读-改-写，返回更新后的档案
    pub async fn update<F>(&self, user_id: &str, f: F) -> Result<UserProfile, MemoryError>
    where
        F: FnOnce(&mut UserProfile) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut profile = self.load(user_id).await?;
        f(&mut profile);
        profile.updated_at = Some(Utc::now());
        write_json_atomic(&self.path(user_id), &profile).await?;
        Ok(profile)
    }
}

fn check_user_id(tool: &str, user_id: &str) -> Result<(), String> {
    if user_id.trim().is_empty() {
        Err(format!("{}: user_id must not be empty", tool))
    } else {
        Ok(())
    }
}

fn check_value(tool: &str, value: &str) -> Result<(), String> {
    if value.chars().count() > MAX_VALUE_LEN {
        Err(format!("{}: value longer than {} characters", tool, MAX_VALUE_LEN))
    } else {
        Ok(())
    }
}

/// 记录用户当前心情
pub struct UpdateFeelingTool {
    store: Arc<ProfileStore>,
}

impl UpdateFeelingTool {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for UpdateFeelingTool {
    fn name(&self) -> &str {
        "update_feeling"
    }

    fn description(&self) -> &str {
        "Record how the user currently feels, e.g. \"happy\", \"tired\", \"anxious\""
    }

    fn signature(&self) -> String {
        "update_feeling(user_id, feeling)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        expect_arity(self.name(), args, 2)?;
        let user_id = string_arg(self.name(), args, 0)?;
        let feeling = string_arg(self.name(), args, 1)?.trim().to_string();
        check_user_id(self.name(), user_id)?;
        check_value(self.name(), &feeling)?;
        if feeling.is_empty() {
            return Err("update_feeling: feeling must not be empty".to_string());
        }
        tracing::info!(user_id = %user_id, feeling = %feeling, "update_feeling tool execute");
        let stored = feeling.clone();
        self.store
            .update(user_id, move |p| {
                p.feeling = Some(stored);
                p.feeling_updated_at = Some(Utc::now());
            })
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Recorded feeling '{}' for {}", feeling, user_id))
    }
}

/// 设置档案字段
pub struct UpdateProfileTool {
    store: Arc<ProfileStore>,
}

impl UpdateProfileTool {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for UpdateProfileTool {
    fn name(&self) -> &str {
        "update_profile"
    }

    fn description(&self) -> &str {
        "Remember a fact about the user as a profile field, e.g. (\"alice\", \"hobby\", \"climbing\")"
    }

    fn signature(&self) -> String {
        "update_profile(user_id, field, value)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        expect_arity(self.name(), args, 3)?;
        let user_id = string_arg(self.name(), args, 0)?;
        let field = string_arg(self.name(), args, 1)?.trim().to_lowercase();
        let value = string_arg(self.name(), args, 2)?.trim().to_string();
        check_user_id(self.name(), user_id)?;
        check_value(self.name(), &value)?;
        let valid_field = !field.is_empty()
            && field.len() <= MAX_FIELD_LEN
            && field.chars().all(|c| c.is_alphanumeric() || c == '_');
        if !valid_field {
            return Err(format!(
                "update_profile: field must be 1-{} letters, digits or '_'",
                MAX_FIELD_LEN
            ));
        }
        tracing::info!(user_id = %user_id, field = %field, "update_profile tool execute");
        let (f, v) = (field.clone(), value.clone());
        self.store
            .update(user_id, move |p| {
                if f == "feeling" {
                    p.feeling = Some(v);
                    p.feeling_updated_at = Some(Utc::now());
                } else if v.is_empty() {
                    p.fields.remove(&f);
                } else {
                    p.fields.insert(f, v);
                }
            })
            .await
            .map_err(|e| e.to_string())?;
        if value.is_empty() {
            Ok(format!("Cleared {} for {}", field, user_id))
        } else {
            Ok(format!("Set {} = '{}' for {}", field, value, user_id))
        }
    }
}

/// 读取档案 JSON
pub struct GetProfileTool {
    store: Arc<ProfileStore>,
}

impl GetProfileTool {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetProfileTool {
    fn name(&self) -> &str {
        "get_profile"
    }

    fn description(&self) -> &str {
        "Look up what is known about the user"
    }

    fn signature(&self) -> String {
        "get_profile(user_id)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        expect_arity(self.name(), args, 1)?;
        let user_id = string_arg(self.name(), args, 0)?;
        check_user_id(self.name(), user_id)?;
        let profile = self.store.load(user_id).await.map_err(|e| e.to_string())?;
        serde_json::to_string(&profile).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Literal {
        Literal::Str(v.to_string())
    }

    #[tokio::test]
    async fn test_update_feeling_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path()));
        let tool = UpdateFeelingTool::new(Arc::clone(&store));
        let out = tool.execute(&[s("alice"), s("happy")]).await.unwrap();
        assert!(out.contains("happy"));

        let reopened = ProfileStore::new(dir.path());
        let profile = reopened.load("alice").await.unwrap();
        assert_eq!(profile.feeling.as_deref(), Some("happy"));
        assert!(profile.feeling_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_similar_user_ids_keep_separate_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path()));
        let tool = UpdateFeelingTool::new(Arc::clone(&store));
        tool.execute(&[s("alice/x"), s("anxious")]).await.unwrap();

        assert!(store.load("alice_x").await.unwrap().feeling.is_none());
        assert_eq!(
            store.load("alice/x").await.unwrap().feeling.as_deref(),
            Some("anxious")
        );
    }

    #[tokio::test]
    async fn test_update_and_get_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path()));
        let update = UpdateProfileTool::new(Arc::clone(&store));
        let get = GetProfileTool::new(Arc::clone(&store));

        update.execute(&[s("bob"), s("Hobby"), s("climbing")]).await.unwrap();
        let json = get.execute(&[s("bob")]).await.unwrap();
        let profile: UserProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile.fields.get("hobby").map(String::as_str), Some("climbing"));

        update.execute(&[s("bob"), s("hobby"), s("")]).await.unwrap();
        assert!(store.load("bob").await.unwrap().fields.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path()));
        let feeling = UpdateFeelingTool::new(Arc::clone(&store));
        let update = UpdateProfileTool::new(store);
        assert!(feeling.execute(&[s("alice")]).await.is_err());
        assert!(feeling.execute(&[s(""), s("happy")]).await.is_err());
        assert!(feeling.execute(&[s("alice"), Literal::Int(3)]).await.is_err());
        assert!(update
            .execute(&[s("alice"), s("bad field!"), s("x")])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_profile_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path());
        let profile = store.load("nobody").await.unwrap();
        assert!(profile.is_empty());
        assert_eq!(profile.user_id, "nobody");
    }
}
