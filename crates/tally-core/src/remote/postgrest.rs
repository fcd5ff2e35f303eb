//! Supabase/PostgREST implementation of [`RemoteStore`].

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{Filter, RemoteError, RemoteQuery, RemoteStore};
use crate::models::{RecordId, Table};
use crate::util::{compact_text, is_http_url, normalize_name, normalize_text_option};

const REST_PATH: &str = "/rest/v1";

#[derive(Clone)]
pub struct PostgrestRemote {
    rest_url: String,
    anon_key: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for PostgrestRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PostgrestRemote")
            .field("rest_url", &self.rest_url)
            .field("anon_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl PostgrestRemote {
    /// Client for the project at `url` (the project root or its `/rest/v1` endpoint).
    pub fn new(
        url: impl AsRef<str>,
        anon_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, RemoteError> {
        let anon_key = normalize_text_option(Some(anon_key.into()))
            .ok_or_else(|| RemoteError::NotConfigured("anon key must not be empty".into()))?;
        Ok(Self {
            rest_url: normalize_rest_url(url.as_ref())?,
            anon_key,
            access_token: normalize_text_option(access_token),
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        self.client
            .request(method, format!("{}/{}", self.rest_url, table.name()))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .header("Accept", "application/json")
    }

    async fn send_upsert(&self, table: Table, rows: &[Value]) -> Result<Response, RemoteError> {
        let response = self
            .request(Method::POST, table)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(rows)
            .send()
            .await?;
        Ok(response)
    }

    /// Retry a rejected batch row by row, resolving each name collision to
    /// the row the server already holds.
    async fn upsert_individually(
        &self,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let response = self.send_upsert(table, std::slice::from_ref(&row)).await?;
            if response.status() == StatusCode::CONFLICT {
                let name = row
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let canonical = self.find_by_name(table, &name).await?.ok_or_else(|| {
                    RemoteError::Conflict {
                        table,
                        message: format!("no canonical row found for '{name}'"),
                    }
                })?;
                tracing::debug!("Resolved {table} name collision for '{name}' to canonical row");
                stored.push(canonical);
            } else {
                stored.extend(read_rows(response).await?);
            }
        }
        Ok(stored)
    }

    async fn find_by_name(&self, table: Table, name: &str) -> Result<Option<Value>, RemoteError> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Ok(None);
        }
        let response = self
            .request(Method::GET, table)
            .query(&[
                ("select", "*".to_string()),
                ("name", format!("ilike.{}", name_pattern(&key))),
            ])
            .send()
            .await?;
        let mut candidates: Vec<Value> = read_rows(response)
            .await?
            .into_iter()
            .filter(|row| {
                row.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|candidate| normalize_name(candidate) == key)
            })
            .collect();
        // Active rows first
        candidates.sort_by_key(|row| !row.get("active").and_then(Value::as_bool).unwrap_or(true));
        Ok(candidates.into_iter().next())
    }
}

#[async_trait]
impl RemoteStore for PostgrestRemote {
    async fn upsert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.send_upsert(table, &rows).await?;
        if response.status() == StatusCode::CONFLICT && table.is_deduplicated() {
            tracing::debug!(
                "Batch upsert to {table} hit a uniqueness conflict; retrying {} rows individually",
                rows.len()
            );
            return self.upsert_individually(table, rows).await;
        }
        read_rows(response).await
    }

    async fn select(&self, table: Table, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .request(Method::GET, table)
            .query(&query_params(query))
            .send()
            .await?;
        read_rows(response).await
    }

    async fn update_by_id(
        &self,
        table: Table,
        id: &RecordId,
        patch: Value,
    ) -> Result<Option<Value>, RemoteError> {
        let response = self
            .request(Method::PATCH, table)
            .query(&query_params(&patch_target(id, &patch)))
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        Ok(read_rows(response).await?.into_iter().next())
    }
}

async fn read_rows(response: Response) -> Result<Vec<Value>, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        });
    }

    let payload = response.json::<Value>().await?;
    match payload {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        object @ Value::Object(_) => Ok(vec![object]),
        other => Err(RemoteError::InvalidPayload(format!(
            "expected an array of rows, got {}",
            compact_text(&other.to_string())
        ))),
    }
}

/// Row addressed by a patch, guarded by the patch's own `updated_at`
fn patch_target(id: &RecordId, patch: &Value) -> RemoteQuery {
    let mut filters = vec![Filter::Eq("id".into(), Value::String(id.to_string()))];
    if let Some(stamp) = patch.get("updated_at").filter(|stamp| stamp.is_string()) {
        filters.push(Filter::Lt("updated_at".into(), stamp.clone()));
    }
    RemoteQuery {
        filters,
        ..RemoteQuery::default()
    }
}

fn query_params(query: &RemoteQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        let value = match filter.value() {
            Value::String(value) => value.clone(),
            other => other.to_string(),
        };
        params.push((
            filter.column().to_string(),
            format!("{}.{value}", filter.operator()),
        ));
    }
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|column| format!("{column}.asc"))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if query.offset > 0 {
        params.push(("offset".to_string(), query.offset.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// `ilike` pattern matching any spacing and casing of a normalized name.
fn name_pattern(key: &str) -> String {
    let words = key
        .split_whitespace()
        .map(|word| word.replace(['*', '%', '_', ',', '(', ')'], "*"))
        .collect::<Vec<_>>();
    format!("*{}*", words.join("*"))
}

fn normalize_rest_url(raw: &str) -> Result<String, RemoteError> {
    let url = normalize_text_option(Some(raw.to_string()))
        .ok_or_else(|| RemoteError::NotConfigured("remote URL must not be empty".into()))?;
    if !is_http_url(&url) {
        return Err(RemoteError::NotConfigured(
            "remote URL must include http:// or https://".into(),
        ));
    }
    let url = url.trim_end_matches('/');
    if url.ends_with(REST_PATH) {
        Ok(url.to_string())
    } else {
        Ok(format!("{url}{REST_PATH}"))
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorBody>(body) {
        if let Some(message) = payload.message {
            let extra = payload.details.or(payload.hint).unwrap_or_default();
            return if extra.trim().is_empty() {
                format!("{} ({})", message.trim(), status.as_u16())
            } else {
                format!("{}: {} ({})", message.trim(), extra.trim(), status.as_u16())
            };
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn normalize_rest_url_appends_rest_path_once() {
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/rest/v1").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert!(normalize_rest_url("demo.supabase.co").is_err());
        assert!(normalize_rest_url("  ").is_err());
    }

    #[test]
    fn query_params_follow_postgrest_syntax() {
        let query = RemoteQuery {
            filters: vec![
                Filter::Gt("updated_at".into(), "2024-03-01T10:00:00.000000Z".into()),
                Filter::Eq("kind".into(), "SALE".into()),
                Filter::Lte("quantity".into(), 3.into()),
            ],
            order: vec!["updated_at".into(), "id".into()],
            offset: 1000,
            limit: Some(500),
        };

        let params = query_params(&query);
        let expected: Vec<(String, String)> = [
            ("select", "*"),
            ("updated_at", "gt.2024-03-01T10:00:00.000000Z"),
            ("kind", "eq.SALE"),
            ("quantity", "lte.3"),
            ("order", "updated_at.asc,id.asc"),
            ("offset", "1000"),
            ("limit", "500"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        assert_eq!(params, expected);
    }

    #[test]
    fn name_pattern_tolerates_spacing_and_wildcards() {
        assert_eq!(name_pattern("iced coffee"), "*iced*coffee*");
        assert_eq!(name_pattern("50% off"), "*50**off*");
    }

    #[test]
    fn parse_api_error_prefers_message_and_details() {
        let body = r#"{"code":"23505","message":"duplicate key value","details":"Key (name_key)=(tea) already exists."}"#;
        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, body),
            "duplicate key value: Key (name_key)=(tea) already exists. (409)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }

    #[test]
    fn debug_redacts_credentials() {
        let remote = PostgrestRemote::new(
            "https://demo.supabase.co",
            "anon-secret",
            Some("user-secret".into()),
        )
        .unwrap();
        let debug = format!("{remote:?}");
        assert!(!debug.contains("anon-secret"));
        assert!(!debug.contains("user-secret"));
        assert_eq!(remote.rest_url(), "https://demo.supabase.co/rest/v1");
    }

    #[test]
    fn patches_only_replace_older_rows() {
        let guarded = query_params(&patch_target(
            &RecordId::from("t-1"),
            &json!({"reversed": true, "updated_at": "2024-03-01T10:00:00.000000Z"}),
        ));
        assert_eq!(
            guarded[1..].to_vec(),
            vec![
                ("id".to_string(), "eq.t-1".to_string()),
                (
                    "updated_at".to_string(),
                    "lt.2024-03-01T10:00:00.000000Z".to_string()
                ),
            ]
        );

        let unguarded = query_params(&patch_target(&RecordId::from("t-1"), &json!({"active": false})));
        assert_eq!(unguarded.len(), 2);
    }
}
