//! 存储客户端抽象
//!
//! `store_object` 等动作通过该接口访问被测的对象存储。
//! 查询语法为逗号分隔的 `key=value` 条件，全部满足才算命中。

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{ExecutorError, Result};

/// 存储客户端
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// 存储对象，返回对象 ID
    async fn store_object(&self, data: &[u8], metadata: &BTreeMap<String, String>)
        -> Result<String>;

    async fn retrieve_object(&self, oid: &str) -> Result<Vec<u8>>;

    /// 按元数据查询，返回命中的对象 ID (按 ID 排序)
    async fn query(&self, query: &str) -> Result<Vec<String>>;

    /// 查询结果必须恰好一个
    async fn select_unique(&self, query: &str) -> Result<String> {
        let mut hits = self.query(query).await?;
        match hits.len() {
            1 => Ok(hits.remove(0)),
            0 => Err(ExecutorError::Archive(format!("查询 `{}` 没有命中", query))),
            n => Err(ExecutorError::Archive(format!(
                "查询 `{}` 命中 {} 个对象，期望 1 个",
                query, n
            ))),
        }
    }

    async fn get_metadata(&self, oid: &str) -> Result<BTreeMap<String, String>>;
}

struct StoredObject {
    data: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

/// 内存存储客户端
#[derive(Default)]
pub struct MemoryArchive {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    query
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .map(|clause| {
            clause
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ExecutorError::Archive(format!("无效的查询条件: {}", clause)))
        })
        .collect()
}

#[async_trait]
impl ArchiveClient for MemoryArchive {
    async fn store_object(
        &self,
        data: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut objects = self.objects.write().await;
        let oid = format!("obj-{:06}", objects.len() + 1);
        objects.insert(
            oid.clone(),
            StoredObject {
                data: data.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(oid)
    }

    async fn retrieve_object(&self, oid: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(oid)
            .map(|o| o.data.clone())
            .ok_or_else(|| ExecutorError::Archive(format!("对象 {} 不存在", oid)))
    }

    async fn query(&self, query: &str) -> Result<Vec<String>> {
        let conditions = parse_query(query)?;
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(_, o)| {
                conditions
                    .iter()
                    .all(|(k, v)| o.metadata.get(k).map(String::as_str) == Some(v.as_str()))
            })
            .map(|(oid, _)| oid.clone())
            .collect())
    }

    async fn get_metadata(&self, oid: &str) -> Result<BTreeMap<String, String>> {
        self.objects
            .read()
            .await
            .get(oid)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| ExecutorError::Archive(format!("对象 {} 不存在", oid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_store_and_query() {
        let archive = MemoryArchive::new();
        let a = archive
            .store_object(b"alpha", &meta(&[("kind", "doc"), ("owner", "x")]))
            .await
            .unwrap();
        archive
            .store_object(b"beta", &meta(&[("kind", "doc"), ("owner", "y")]))
            .await
            .unwrap();

        assert_eq!(archive.retrieve_object(&a).await.unwrap(), b"alpha");
        assert_eq!(archive.query("kind=doc").await.unwrap().len(), 2);
        assert_eq!(
            archive.select_unique("kind=doc, owner=x").await.unwrap(),
            a
        );
        assert_eq!(
            archive.get_metadata(&a).await.unwrap().get("owner").unwrap(),
            "x"
        );
    }

    #[tokio::test]
    async fn test_select_unique_requires_exactly_one() {
        let archive = MemoryArchive::new();
        archive.store_object(b"1", &meta(&[("k", "v")])).await.unwrap();
        archive.store_object(b"2", &meta(&[("k", "v")])).await.unwrap();

        assert!(archive.select_unique("k=v").await.is_err());
        assert!(archive.select_unique("k=none").await.is_err());
        assert!(archive.query("broken").await.is_err());
    }
}
