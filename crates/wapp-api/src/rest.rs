// REST HTTP client
//
// Wraps `reqwest::Client` with service URL construction, query encoding,
// and error-body parsing. This is the plain request/response surface used
// to create, update, and load an object's canonical state; the stream
// runtime consumes it but does not own it.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Error body shape returned by the service on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Raw HTTP client for the service REST API.
///
/// Endpoints are service-relative paths such as `/2.0/device`; the client
/// prefixes them with the configured base URL.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    verbose: bool,
}

impl RestClient {
    /// Create a REST client from a `TransportConfig`.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a REST client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            verbose: false,
        }
    }

    /// Ask the service for verbose responses (`verbose=true` on every query).
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The service base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build a full URL for a service-relative endpoint.
    pub fn url(&self, endpoint: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{endpoint}"))?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// GET an endpoint and normalise the body to a list of result objects.
    ///
    /// An array body is returned as is, a single object becomes a
    /// one-element list, and an empty body yields an empty list.
    pub async fn fetch(&self, endpoint: &str, params: &Map<String, Value>) -> Result<Vec<Value>, Error> {
        let body = self.get(endpoint, params).await?;
        Ok(match body {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        })
    }

    /// Send a GET request with query parameters.
    pub async fn get(&self, endpoint: &str, params: &Map<String, Value>) -> Result<Value, Error> {
        let url = self.url(endpoint)?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .query(&self.query_pairs(params))
            .send()
            .await
            .map_err(Error::Transport)?;

        parse_response(resp).await
    }

    /// Send a POST request with a JSON body.
    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, Error> {
        self.post_with_params(endpoint, &Map::new(), body).await
    }

    /// Send a POST request with query parameters and a JSON body.
    pub async fn post_with_params(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        body: &Value,
    ) -> Result<Value, Error> {
        let url = self.url(endpoint)?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .query(&self.query_pairs(params))
            .json(body)
            .send()
            .await
            .map_err(Error::Transport)?;

        parse_response(resp).await
    }

    /// Send a PUT request with a JSON body.
    pub async fn put(&self, endpoint: &str, body: &Value) -> Result<Value, Error> {
        let url = self.url(endpoint)?;
        debug!("PUT {}", url);

        let resp = self
            .http
            .put(url)
            .query(&self.query_pairs(&Map::new()))
            .json(body)
            .send()
            .await
            .map_err(Error::Transport)?;

        parse_response(resp).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, endpoint: &str) -> Result<(), Error> {
        let url = self.url(endpoint)?;
        debug!("DELETE {}", url);

        let resp = self.http.delete(url).send().await.map_err(Error::Transport)?;
        parse_response(resp).await.map(|_| ())
    }

    /// Flatten JSON params into query pairs.
    ///
    /// Scalars become their string form, arrays become repeated keys
    /// (`method=retrieve&method=update`), nested objects are sent as JSON.
    fn query_pairs(&self, params: &Map<String, Value>) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(params.len() + 1);
        for (key, value) in params {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    pairs.extend(items.iter().map(|item| (key.clone(), scalar_to_string(item))));
                }
                other => pairs.push((key.clone(), scalar_to_string(other))),
            }
        }
        if self.verbose && !params.contains_key("verbose") {
            pairs.push(("verbose".into(), "true".into()));
        }
        pairs
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a response into its JSON body, or an `Error::Api` on failure.
async fn parse_response(resp: reqwest::Response) -> Result<Value, Error> {
    let status = resp.status();
    let body = resp.text().await.map_err(Error::Transport)?;

    if !status.is_success() {
        let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
        let (code, message) = match parsed {
            Some(ErrorBody { code, message }) => (
                code,
                message.unwrap_or_else(|| format!("HTTP {status}")),
            ),
            None => (None, format!("HTTP {status}: {}", preview(&body))),
        };
        return Err(Error::Api {
            status: status.as_u16(),
            code,
            message,
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: format!("{e} (body preview: {:?})", preview(&body)),
        body: body.clone(),
    })
}

fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> RestClient {
        RestClient::with_client(
            reqwest::Client::new(),
            Url::parse("https://example.test/services/").unwrap(),
        )
    }

    #[test]
    fn url_joins_without_double_slash() {
        let url = client().url("/2.0/device").unwrap();
        assert_eq!(url.as_str(), "https://example.test/services/2.0/device");
    }

    #[test]
    fn arrays_become_repeated_keys() {
        let params = json!({ "method": ["retrieve", "update"], "quantity": 2, "skip": null });
        let pairs = client().query_pairs(params.as_object().unwrap());
        assert_eq!(
            pairs,
            vec![
                ("method".to_owned(), "retrieve".to_owned()),
                ("method".to_owned(), "update".to_owned()),
                ("quantity".to_owned(), "2".to_owned()),
            ]
        );
    }

    #[test]
    fn verbose_flag_is_appended() {
        let pairs = client().with_verbose(true).query_pairs(&Map::new());
        assert_eq!(pairs, vec![("verbose".to_owned(), "true".to_owned())]);
    }
}
