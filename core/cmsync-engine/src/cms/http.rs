//! HTTP implementation of [`CmsApi`].
//!
//! Uses the Webflow-style v2 REST API: bearer auth, JSON bodies, locale
//! variants addressed by `cmsLocaleId`.

use super::api::{CmsApi, CollectionSchema, ItemPage, ItemPatch, ItemTarget, SchemaField};
use crate::config::CmsApiConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmsync_types::{
    CollectionId, FieldData, Locale, LocaleId, LocaleSet, RemoteId, RemoteRow, SiteId,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Site response (only the locale block is used).
#[derive(Debug, Deserialize)]
struct SiteResponse {
    locales: Option<SiteLocales>,
}

#[derive(Debug, Deserialize)]
struct SiteLocales {
    primary: Option<SiteLocale>,
    #[serde(default)]
    secondary: Vec<SiteLocale>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteLocale {
    cms_locale_id: String,
    tag: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionResponse {
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    fields: Vec<FieldResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldResponse {
    slug: String,
    #[serde(default)]
    display_name: String,
    #[serde(default, rename = "type")]
    field_type: String,
    #[serde(default)]
    is_required: bool,
}

#[derive(Debug, Deserialize)]
struct ItemListResponse {
    #[serde(default)]
    items: Vec<ItemResponse>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemResponse {
    id: String,
    cms_locale_id: Option<String>,
    last_published: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    field_data: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    items: Vec<ItemResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    published_item_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    cms_locale_ids: &'a [LocaleId],
    is_archived: bool,
    is_draft: bool,
    field_data: &'a [FieldData],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchEntry<'a> {
    id: &'a RemoteId,
    cms_locale_id: &'a LocaleId,
    field_data: &'a FieldData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetEntry<'a> {
    id: &'a RemoteId,
    cms_locale_ids: &'a [LocaleId],
}

#[derive(Debug, Serialize)]
struct ItemsBody<T> {
    items: Vec<T>,
}

fn targets_body(targets: &[ItemTarget]) -> ItemsBody<TargetEntry<'_>> {
    ItemsBody {
        items: targets
            .iter()
            .map(|t| TargetEntry {
                id: &t.remote_id,
                cms_locale_ids: &t.locale_ids,
            })
            .collect(),
    }
}

impl ItemResponse {
    fn into_row(self, fallback_locale: Option<&LocaleId>) -> Option<RemoteRow> {
        let locale_id = self
            .cms_locale_id
            .map(LocaleId::new)
            .or_else(|| fallback_locale.cloned())?;
        Some(RemoteRow {
            remote_id: RemoteId::new(self.id),
            locale_id,
            field_data: FieldData::from_map(self.field_data),
            last_published: self.last_published,
            last_updated: self.last_updated,
            is_draft: self.is_draft,
            is_archived: self.is_archived,
        })
    }
}

/// CMS client over HTTPS.
pub struct HttpCmsClient {
    config: CmsApiConfig,
    client: Client,
}

impl HttpCmsClient {
    /// Creates a client. Fails only if the TLS backend cannot initialise.
    pub fn new(config: CmsApiConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CmsApiConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/v2{}", self.config.api_base_url, path))
            .bearer_auth(&self.config.api_token)
            .header("accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> SyncResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("{context} failed: {e}")))?;
        check_status(response, context).await
    }
}

async fn check_status(response: Response, context: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::NOT_FOUND => SyncError::NotFound(format!("{context}: {body}")),
        StatusCode::CONFLICT => SyncError::Conflict(format!("{context}: {body}")),
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        other => SyncError::Api {
            status: other.as_u16(),
            message: format!("{context}: {body}"),
        },
    })
}

fn locale_csv(locale_ids: &[LocaleId]) -> String {
    locale_ids
        .iter()
        .map(LocaleId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl CmsApi for HttpCmsClient {
    fn provider_name(&self) -> &'static str {
        "Webflow"
    }

    async fn list_locales(&self, site: &SiteId) -> SyncResult<LocaleSet> {
        let response = self
            .send(
                self.request(Method::GET, &format!("/sites/{site}")),
                "get site",
            )
            .await?;
        let site_response: SiteResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("failed to parse site: {e}")))?;

        let locales = site_response
            .locales
            .ok_or_else(|| SyncError::Setup(format!("site {site} has no locale configuration")))?;
        let primary = locales
            .primary
            .ok_or_else(|| SyncError::Setup(format!("site {site} has no primary locale")))?;

        let mut all = vec![Locale::primary(primary.cms_locale_id, primary.tag)];
        all.extend(
            locales
                .secondary
                .into_iter()
                .filter(|l| l.enabled)
                .map(|l| Locale::new(l.cms_locale_id, l.tag)),
        );
        Ok(LocaleSet::new(all)?)
    }

    async fn get_collection(&self, collection: &CollectionId) -> SyncResult<CollectionSchema> {
        let response = self
            .send(
                self.request(Method::GET, &format!("/collections/{collection}")),
                "get collection",
            )
            .await?;
        let body: CollectionResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("failed to parse collection: {e}")))?;

        Ok(CollectionSchema {
            id: CollectionId::new(body.id),
            display_name: body.display_name,
            slug: body.slug,
            fields: body
                .fields
                .into_iter()
                .map(|f| SchemaField {
                    slug: f.slug,
                    display_name: f.display_name,
                    field_type: f.field_type,
                    required: f.is_required,
                })
                .collect(),
        })
    }

    async fn list_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        offset: usize,
        limit: usize,
    ) -> SyncResult<ItemPage> {
        let request = self
            .request(Method::GET, &format!("/collections/{collection}/items"))
            .query(&[
                ("cmsLocaleId", locale_csv(locale_ids)),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ]);
        let response = self.send(request, "list items").await?;
        let list: ItemListResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("failed to parse item list: {e}")))?;

        let fallback = (locale_ids.len() == 1).then(|| &locale_ids[0]);
        let page_len = list.items.len();
        let items: Vec<RemoteRow> = list
            .items
            .into_iter()
            .filter_map(|item| item.into_row(fallback))
            .collect();
        if items.len() < page_len {
            debug!(
                dropped = page_len - items.len(),
                "skipped rows without a locale id"
            );
        }

        let total = list.pagination.map_or(offset + page_len, |p| p.total);
        Ok(ItemPage {
            items,
            received: page_len,
            total,
        })
    }

    async fn create_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        rows: &[FieldData],
    ) -> SyncResult<Vec<RemoteRow>> {
        let body = CreateRequest {
            cms_locale_ids: locale_ids,
            is_archived: false,
            is_draft: false,
            field_data: rows,
        };
        let request = self
            .request(Method::POST, &format!("/collections/{collection}/items/bulk"))
            .json(&body);
        let response = self.send(request, "create items").await?;

        // Some API versions answer with an empty body; ids are re-read anyway.
        let text = response.text().await.unwrap_or_default();
        let created: CreateResponse = if text.trim().is_empty() {
            CreateResponse::default()
        } else {
            serde_json::from_str(&text)?
        };
        let primary = locale_ids.first();
        Ok(created
            .items
            .into_iter()
            .filter_map(|item| item.into_row(primary))
            .collect())
    }

    async fn update_items(
        &self,
        collection: &CollectionId,
        patches: &[ItemPatch],
        live: bool,
    ) -> SyncResult<()> {
        let path = if live {
            format!("/collections/{collection}/items/live")
        } else {
            format!("/collections/{collection}/items")
        };
        let body = ItemsBody {
            items: patches
                .iter()
                .map(|p| PatchEntry {
                    id: &p.remote_id,
                    cms_locale_id: &p.locale_id,
                    field_data: &p.field_data,
                })
                .collect(),
        };
        self.send(
            self.request(Method::PATCH, &path).json(&body),
            if live { "update live items" } else { "update items" },
        )
        .await?;
        Ok(())
    }

    async fn unpublish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<()> {
        self.send(
            self.request(Method::DELETE, &format!("/collections/{collection}/items/live"))
                .json(&targets_body(targets)),
            "unpublish items",
        )
        .await?;
        Ok(())
    }

    async fn delete_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<()> {
        self.send(
            self.request(Method::DELETE, &format!("/collections/{collection}/items"))
                .json(&targets_body(targets)),
            "delete items",
        )
        .await?;
        Ok(())
    }

    async fn publish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<usize> {
        let response = self
            .send(
                self.request(Method::POST, &format!("/collections/{collection}/items/publish"))
                    .json(&targets_body(targets)),
                "publish items",
            )
            .await?;
        let text = response.text().await.unwrap_or_default();
        let published: PublishResponse = if text.trim().is_empty() {
            PublishResponse::default()
        } else {
            serde_json::from_str(&text)?
        };
        Ok(published
            .published_item_ids
            .map_or(targets.len(), |ids| ids.len()))
    }
}
