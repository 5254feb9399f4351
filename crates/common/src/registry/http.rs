use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Document, Fields, Filter, Registry, RegistryError, Snapshots};

/// Registry reached over a JSON document API.
///
/// `GET {base}/{collection}/{id}` reads a document, `PUT` replaces it and
/// `PATCH` merges into it, `POST {base}/{collection}` creates one and
/// `POST {base}/{collection}:query` runs a filtered query. Live queries poll.
#[derive(Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base: String,
    poll_interval: Duration,
}

#[derive(Serialize)]
struct QueryBody<'a> {
    filters: &'a [Filter],
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

impl HttpRegistry {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_matches('/'))
    }

    fn check(resp: &reqwest::Response, path: &str) -> Result<(), RegistryError> {
        if resp.status().is_success() {
            return Ok(());
        }
        Err(RegistryError::Status { status: resp.status().as_u16(), path: path.to_string() })
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RegistryError> {
        let path = crate::doc_path(collection, id);
        let resp = self.client.get(self.url(&path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(&resp, &path)?;
        let fields: Fields = resp.json().await?;
        Ok(Some(Document { id: id.to_string(), fields }))
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, RegistryError> {
        let path = format!("{}:query", collection.trim_matches('/'));
        let resp = self
            .client
            .post(self.url(&path))
            .json(&QueryBody { filters })
            .send()
            .await?;
        Self::check(&resp, &path)?;
        Ok(resp.json().await?)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), RegistryError> {
        let path = crate::doc_path(collection, id);
        let req = if merge {
            self.client.patch(self.url(&path))
        } else {
            self.client.put(self.url(&path))
        };
        let resp = req.json(&fields).send().await?;
        Self::check(&resp, &path)
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, RegistryError> {
        let resp = self.client.post(self.url(collection)).json(&fields).send().await?;
        Self::check(&resp, collection)?;
        let created: Created = resp.json().await?;
        Ok(created.id)
    }

    async fn listen(&self, collection: &str, filters: &[Filter]) -> Result<Snapshots, RegistryError> {
        let state = (self.clone(), collection.to_string(), filters.to_vec(), None::<Vec<Document>>, true);
        let stream = futures::stream::unfold(state, |(reg, collection, filters, mut last, mut first)| async move {
            loop {
                if !first {
                    tokio::time::sleep(reg.poll_interval).await;
                }
                first = false;
                match reg.query(&collection, &filters).await {
                    Ok(current) => {
                        if last.as_ref() == Some(&current) {
                            continue;
                        }
                        last = Some(current.clone());
                        return Some((Ok(current), (reg, collection, filters, last, first)));
                    }
                    Err(e) => {
                        warn!(collection=%collection, error=%e, "registry poll failed");
                        return Some((Err(e), (reg, collection, filters, last, first)));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
