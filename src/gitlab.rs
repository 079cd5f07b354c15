use crate::error::ApiError;
use crate::project::{Group, ProjectRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PAGE_SIZE: u32 = 100;

/// One page of a listing. Entries are optional because the service may
/// return `null` items in a partial response.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<Option<T>>,
    pub next_page: Option<u32>,
}

#[async_trait]
pub trait GroupsService: Send + Sync {
    async fn get_group(&self, cancel: &CancellationToken, id: &str) -> Result<Group, ApiError>;

    /// Lists every group visible to the caller, not only top-level ones.
    async fn list_groups(
        &self,
        cancel: &CancellationToken,
        skip_ids: &[u64],
        page: u32,
        per_page: u32,
    ) -> Result<Page<Group>, ApiError>;

    async fn list_subgroups(
        &self,
        cancel: &CancellationToken,
        id: u64,
        skip_ids: &[u64],
        page: u32,
        per_page: u32,
    ) -> Result<Page<Group>, ApiError>;
}

#[async_trait]
pub trait ProjectsService: Send + Sync {
    /// Lists the projects directly owned by a group.
    async fn list_group_projects(
        &self,
        cancel: &CancellationToken,
        group_id: u64,
        page: u32,
        per_page: u32,
    ) -> Result<Page<ProjectRecord>, ApiError>;
}

pub fn make_http_client(api_token: &str) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if !api_token.is_empty() {
        let mut value = HeaderValue::from_str(api_token)
            .with_context(|| "Invalid token: cannot be set as HTTP header")?;
        value.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", value);
    }

    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .default_headers(headers)
        .build()
        .with_context(|| "Failed to create http client")
}

/// REST v4 client for a GitLab instance.
#[derive(Debug, Clone)]
pub struct GitLab {
    client: Client,
    base_url: Url,
}

impl GitLab {
    pub fn new(gitlab_url: &str, api_token: &str) -> Result<Self> {
        let base_url = Url::parse(gitlab_url)
            .with_context(|| format!("Invalid GitLab URL: {}", gitlab_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Invalid GitLab URL: {}", gitlab_url);
        }

        Ok(Self {
            client: make_http_client(api_token)?,
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "v4"])
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<(Option<T>, Option<u32>), ApiError> {
        let req = self.client.get(url.clone()).query(query);
        log::debug!("GET url={} query={:?}", url, query);

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            res = req.send() => res?,
        };

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(url.path().to_owned()));
        }

        let next_page = res
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|page| *page > 0);

        let json = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            json = res.text() => json?,
        };

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: json,
            });
        }

        let body: Option<T> = serde_json::from_str(&json)?;
        Ok((body, next_page))
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: Url,
        mut query: Vec<(&str, String)>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<T>, ApiError> {
        query.push(("per_page", per_page.to_string()));
        if page > 0 {
            query.push(("page", page.to_string()));
        }

        let (items, next_page) = self.get::<Vec<Option<T>>>(cancel, url, &query).await?;
        let items = items.unwrap_or_default();
        log::debug!("Fetched page: count={} next_page={:?}", items.len(), next_page);

        Ok(Page { items, next_page })
    }
}

fn skip_groups_query(skip_ids: &[u64]) -> Vec<(&'static str, String)> {
    skip_ids
        .iter()
        .map(|id| ("skip_groups[]", id.to_string()))
        .collect()
}

#[async_trait]
impl GroupsService for GitLab {
    async fn get_group(&self, cancel: &CancellationToken, id: &str) -> Result<Group, ApiError> {
        let url = self.endpoint(&["groups", id])?;
        let query = [("with_projects", String::from("false"))];
        match self.get::<Group>(cancel, url, &query).await? {
            (Some(group), _) => Ok(group),
            (None, _) => Err(ApiError::NotFound(format!("group {}", id))),
        }
    }

    async fn list_groups(
        &self,
        cancel: &CancellationToken,
        skip_ids: &[u64],
        page: u32,
        per_page: u32,
    ) -> Result<Page<Group>, ApiError> {
        let url = self.endpoint(&["groups"])?;
        let mut query = skip_groups_query(skip_ids);
        query.push(("top_level_only", String::from("false")));
        query.push(("order_by", String::from("id")));
        query.push(("sort", String::from("asc")));
        self.get_page(cancel, url, query, page, per_page).await
    }

    async fn list_subgroups(
        &self,
        cancel: &CancellationToken,
        id: u64,
        skip_ids: &[u64],
        page: u32,
        per_page: u32,
    ) -> Result<Page<Group>, ApiError> {
        let id = id.to_string();
        let url = self.endpoint(&["groups", &id, "subgroups"])?;
        let mut query = skip_groups_query(skip_ids);
        query.push(("all_available", String::from("true")));
        self.get_page(cancel, url, query, page, per_page).await
    }
}

#[async_trait]
impl ProjectsService for GitLab {
    async fn list_group_projects(
        &self,
        cancel: &CancellationToken,
        group_id: u64,
        page: u32,
        per_page: u32,
    ) -> Result<Page<ProjectRecord>, ApiError> {
        let id = group_id.to_string();
        let url = self.endpoint(&["groups", &id, "projects"])?;
        let query = vec![
            ("include_subgroups", String::from("false")),
            ("with_shared", String::from("false")),
            ("simple", String::from("true")),
        ];
        self.get_page(cancel, url, query, page, per_page).await
    }
}
