//! Ad search preview against the serving API.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_SEARCH_URL: &str = "http://localhost:8080/search";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionValues {
    pub dimension: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Search form as submitted by the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchForm {
    pub placement_id: String,
    #[serde(default)]
    pub api_server_host: Option<String>,
    #[serde(default)]
    pub dimension_values: Vec<DimensionValues>,
}

/// Body of the serving API's search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub service_id: String,
    pub placement_id: String,
    pub user_info: BTreeMap<String, Vec<String>>,
}

/// Result groups (e.g. `matched_ads`) → placements with their campaigns.
pub type SearchResponse = BTreeMap<String, Vec<Value>>;

/// Dimension → values. A repeated dimension keeps its last values.
pub fn build_user_info(form: &SearchForm) -> BTreeMap<String, Vec<String>> {
    form.dimension_values
        .iter()
        .map(|dv| (dv.dimension.clone(), dv.values.clone()))
        .collect()
}

pub fn build_request(service_id: &str, form: &SearchForm) -> SearchRequest {
    SearchRequest {
        service_id: service_id.to_string(),
        placement_id: form.placement_id.clone(),
        user_info: build_user_info(form),
    }
}

#[derive(Clone)]
pub struct SearchClient {
    client: Client,
    default_url: String,
}

impl Default for SearchClient {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_URL)
    }
}

impl SearchClient {
    pub fn new(default_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            default_url: default_url.into(),
        }
    }

    /// The form's host when given, else the default.
    pub fn url_for(&self, form: &SearchForm) -> String {
        form.api_server_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .unwrap_or(&self.default_url)
            .to_string()
    }

    pub async fn search(&self, service_id: &str, form: &SearchForm) -> Result<SearchResponse> {
        let url = self.url_for(form);
        let request = build_request(service_id, form);
        debug!(
            "Searching placement {} of service {} at {}",
            request.placement_id, service_id, url
        );

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("search request to {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Search API error {}: {}", status, text));
        }

        let response: SearchResponse = resp
            .json()
            .await
            .context("Failed to parse search response")?;
        info!(
            "Search for placement {} returned {} result groups",
            request.placement_id,
            response.len()
        );
        Ok(response)
    }
}

/// One entry per creative in the placement results: the creative's content
/// fields, plus the creative with its ad group, campaign and placement nested
/// inside. Child arrays are dropped from the nested parents.
pub fn flatten_to_contents(results: &[Value]) -> Vec<Value> {
    let mut contents = Vec::new();
    for placement in results {
        for campaign in children(placement, "campaigns") {
            for ad_group in children(campaign, "adGroups") {
                for creative in children(ad_group, "creatives") {
                    let placement_fields = fields_without(placement, "campaigns");

                    let mut campaign_fields = fields_without(campaign, "adGroups");
                    campaign_fields.insert("placement".to_string(), Value::Object(placement_fields));

                    let mut ad_group_fields = fields_without(ad_group, "creatives");
                    ad_group_fields.insert("campaign".to_string(), Value::Object(campaign_fields));

                    let mut creative_fields = creative.as_object().cloned().unwrap_or_default();
                    creative_fields.insert("adGroup".to_string(), Value::Object(ad_group_fields));

                    let mut entry = match creative.get("content") {
                        Some(Value::Object(content)) => content.clone(),
                        _ => Map::new(),
                    };
                    entry.insert("creative".to_string(), Value::Object(creative_fields));
                    contents.push(Value::Object(entry));
                }
            }
        }
    }
    contents
}

fn children<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn fields_without(value: &Value, key: &str) -> Map<String, Value> {
    let mut fields = value.as_object().cloned().unwrap_or_default();
    fields.remove(key);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form(host: Option<&str>) -> SearchForm {
        serde_json::from_value(json!({
            "placementId": "p1",
            "apiServerHost": host,
            "dimensionValues": [
                { "dimension": "gender", "values": ["F"] },
                { "dimension": "age", "values": ["20", "30"] }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let request = build_request("s1", &form(None));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "service_id": "s1",
                "placement_id": "p1",
                "user_info": { "age": ["20", "30"], "gender": ["F"] }
            })
        );
    }

    #[test]
    fn test_url_falls_back_to_default() {
        let client = SearchClient::default();
        assert_eq!(client.url_for(&form(None)), DEFAULT_SEARCH_URL);
        assert_eq!(client.url_for(&form(Some("  "))), DEFAULT_SEARCH_URL);
        assert_eq!(
            client.url_for(&form(Some("http://api:9000/search"))),
            "http://api:9000/search"
        );
    }

    #[test]
    fn test_flatten_to_contents_nests_parents() {
        let results = vec![json!({
            "id": "p1",
            "name": "Banner",
            "contentType": { "id": "ct1" },
            "campaigns": [{
                "id": "c1",
                "adGroups": [{
                    "id": "a1",
                    "creatives": [
                        { "id": "cr1", "content": { "id": "co1", "values": "{\"title\":\"hi\"}" } },
                        { "id": "cr2" }
                    ]
                }]
            }, { "id": "c2" }]
        })];

        let contents = flatten_to_contents(&results);
        assert_eq!(contents.len(), 2);

        let first = &contents[0];
        assert_eq!(first["id"], "co1");
        assert_eq!(first["creative"]["id"], "cr1");
        assert_eq!(first["creative"]["adGroup"]["id"], "a1");
        assert!(first["creative"]["adGroup"].get("creatives").is_none());
        assert_eq!(first["creative"]["adGroup"]["campaign"]["id"], "c1");
        let placement = &first["creative"]["adGroup"]["campaign"]["placement"];
        assert_eq!(placement["name"], "Banner");
        assert!(placement.get("campaigns").is_none());

        assert!(contents[1].get("id").is_none());
        assert_eq!(contents[1]["creative"]["id"], "cr2");
    }

    #[test]
    fn test_flatten_ignores_malformed_results() {
        assert!(flatten_to_contents(&[json!("oops"), json!({ "campaigns": null })]).is_empty());
    }
}
