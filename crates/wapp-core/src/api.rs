// ── REST seam ──
//
// The plain request/response calls the runtime makes for an object's
// canonical state. `RestClient` is the production implementation; tests
// substitute an in-memory fake.

use async_trait::async_trait;
use serde_json::{Map, Value};

use wapp_api::RestClient;

use crate::error::CoreError;

/// REST operations the runtime depends on.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// GET `endpoint` and return its results as a list.
    async fn fetch(&self, endpoint: &str, params: Map<String, Value>) -> Result<Vec<Value>, CoreError>;

    /// POST `body`, with optional query parameters.
    async fn post(
        &self,
        endpoint: &str,
        params: Map<String, Value>,
        body: Value,
    ) -> Result<Value, CoreError>;

    async fn put(&self, endpoint: &str, body: Value) -> Result<Value, CoreError>;

    async fn delete(&self, endpoint: &str) -> Result<(), CoreError>;
}

#[async_trait]
impl RestApi for RestClient {
    async fn fetch(&self, endpoint: &str, params: Map<String, Value>) -> Result<Vec<Value>, CoreError> {
        Ok(RestClient::fetch(self, endpoint, &params).await?)
    }

    async fn post(
        &self,
        endpoint: &str,
        params: Map<String, Value>,
        body: Value,
    ) -> Result<Value, CoreError> {
        Ok(RestClient::post_with_params(self, endpoint, &params, &body).await?)
    }

    async fn put(&self, endpoint: &str, body: Value) -> Result<Value, CoreError> {
        Ok(RestClient::put(self, endpoint, &body).await?)
    }

    async fn delete(&self, endpoint: &str) -> Result<(), CoreError> {
        Ok(RestClient::delete(self, endpoint).await?)
    }
}

/// In-memory `RestApi` for unit tests: records calls, replays queued
/// responses in order.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Fetch(String, Map<String, Value>),
        Post(String, Map<String, Value>, Value),
        Put(String, Value),
        Delete(String),
    }

    #[derive(Default)]
    pub(crate) struct FakeRest {
        pub calls: Mutex<Vec<Call>>,
        pub responses: Mutex<VecDeque<Result<Value, CoreError>>>,
    }

    impl FakeRest {
        pub(crate) fn respond(&self, response: Result<Value, CoreError>) -> &Self {
            if let Ok(mut queue) = self.responses.lock() {
                queue.push_back(response);
            }
            self
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: Call) -> Result<Value, CoreError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            self.responses
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(Ok(Value::Array(Vec::new())))
        }
    }

    #[async_trait]
    impl RestApi for FakeRest {
        async fn fetch(
            &self,
            endpoint: &str,
            params: Map<String, Value>,
        ) -> Result<Vec<Value>, CoreError> {
            Ok(match self.record(Call::Fetch(endpoint.to_owned(), params))? {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            })
        }

        async fn post(
            &self,
            endpoint: &str,
            params: Map<String, Value>,
            body: Value,
        ) -> Result<Value, CoreError> {
            self.record(Call::Post(endpoint.to_owned(), params, body))
        }

        async fn put(&self, endpoint: &str, body: Value) -> Result<Value, CoreError> {
            self.record(Call::Put(endpoint.to_owned(), body))
        }

        async fn delete(&self, endpoint: &str) -> Result<(), CoreError> {
            self.record(Call::Delete(endpoint.to_owned())).map(|_| ())
        }
    }
}
