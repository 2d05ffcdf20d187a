//! Function Compute implementation of the platform contract.
//!
//! Talks to the 2016-08-15 REST API with signed JSON requests. Deleting a
//! resource that is already gone counts as success.

mod error;
pub mod sign;
mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::credentials::Credentials;
use crate::platform::{ComputePlatform, FunctionSpec, PlatformFuture, ServiceSpec, TriggerSpec};
use types::{
    AliasPage, ApiErrorBody, CreateFunctionBody, CreateServiceBody, CreateTriggerBody, FunctionPage,
    ListPage, TriggerPage, UpdateEnvironmentBody, VersionPage,
};

pub use error::FcError;

/// API version prefix of every request path.
pub const API_VERSION: &str = "2016-08-15";

/// Page size requested from list calls.
pub const LIST_LIMIT: u32 = 100;

const JSON_CONTENT_TYPE: &str = "application/json";
const INVOKE_CONTENT_TYPE: &str = "text/plain";
const ACCOUNT_HEADER: &str = "x-fc-account-id";

/// Connection settings for [`FcClient`].
#[derive(Clone, Debug)]
pub struct FcSettings {
    /// Platform region, for example `cn-hangzhou`.
    pub region: String,
    /// Explicit endpoint overriding the account/region default.
    pub endpoint: Option<String>,
    /// Account identity and keys.
    pub credentials: Credentials,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl FcSettings {
    /// Base URL requests are sent to, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        match self.endpoint.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            Some(endpoint) if endpoint.contains("://") => endpoint.trim_end_matches('/').to_owned(),
            Some(endpoint) => format!("https://{}", endpoint.trim_end_matches('/')),
            None => format!(
                "https://{}.{}.fc.aliyuncs.com",
                self.credentials.account_id, self.region
            ),
        }
    }
}

/// HTTP client for the Function Compute API.
#[derive(Clone, Debug)]
pub struct FcClient {
    base_url: String,
    credentials: Credentials,
    http: Client,
}

struct Request<'a> {
    method: Method,
    path: &'a str,
    query: Option<String>,
    content_type: &'static str,
    body: Option<String>,
}

impl FcClient {
    /// Builds a client from settings.
    ///
    /// # Errors
    ///
    /// Returns [`FcError::Config`] when the credentials are incomplete or the
    /// HTTP client cannot be built.
    pub fn new(settings: &FcSettings) -> Result<Self, FcError> {
        if settings.credentials.is_incomplete() {
            return Err(FcError::Config(String::from(
                "account id, access key id, and access key secret are required",
            )));
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| FcError::Config(err.to_string()))?;
        Ok(Self {
            base_url: settings.base_url(),
            credentials: settings.credentials.clone(),
            http,
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: Request<'_>) -> Result<String, FcError> {
        let date = sign::http_date(chrono::Utc::now());
        let headers = [(ACCOUNT_HEADER, self.credentials.account_id.as_str())];
        let authorization = sign::authorization(
            &self.credentials.access_key_id,
            &self.credentials.access_key_secret,
            &sign::SigningInput {
                method: request.method.as_str(),
                content_md5: "",
                content_type: request.content_type,
                date: &date,
                headers: &headers,
                resource: &signed_resource(request.path),
            },
        )?;

        let url = match &request.query {
            Some(query) => format!("{}{}?{query}", self.base_url, request.path),
            None => format!("{}{}", self.base_url, request.path),
        };
        tracing::debug!(method = %request.method, path = request.path, "function compute request");
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .header("date", &date)
            .header("content-type", request.content_type)
            .header(ACCOUNT_HEADER, &self.credentials.account_id)
            .header("authorization", authorization);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let transport = |err: reqwest::Error| FcError::Transport {
            path: request.path.to_owned(),
            message: err.to_string(),
        };
        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        if status.is_success() {
            return Ok(text);
        }
        let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
        Err(FcError::Api {
            method: request.method.to_string(),
            path: request.path.to_owned(),
            status: status.as_u16(),
            code: body.code,
            message: if body.message.is_empty() { text } else { body.message },
        })
    }

    async fn post_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), FcError> {
        self.write_json(Method::POST, path, body).await
    }

    async fn write_json<T: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<(), FcError> {
        let encoded = serde_json::to_string(body).map_err(|err| FcError::Decode {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
        self.send(Request {
            method,
            path,
            query: None,
            content_type: JSON_CONTENT_TYPE,
            body: Some(encoded),
        })
        .await
        .map(drop)
    }

    async fn delete(&self, path: &str) -> Result<(), FcError> {
        let result = self
            .send(Request {
                method: Method::DELETE,
                path,
                query: None,
                content_type: JSON_CONTENT_TYPE,
                body: None,
            })
            .await;
        match result {
            Err(err) if err.is_not_found() => {
                tracing::debug!(path, "already deleted");
                Ok(())
            }
            other => other.map(drop),
        }
    }

    async fn list<P: ListPage + DeserializeOwned>(&self, path: &str) -> Result<Vec<String>, FcError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let query = next_token.as_ref().map_or_else(
                || format!("limit={LIST_LIMIT}"),
                |token| format!("limit={LIST_LIMIT}&nextToken={token}"),
            );
            let text = self
                .send(Request {
                    method: Method::GET,
                    path,
                    query: Some(query),
                    content_type: JSON_CONTENT_TYPE,
                    body: None,
                })
                .await?;
            let page: P = serde_json::from_str(&text).map_err(|err| FcError::Decode {
                path: path.to_owned(),
                message: err.to_string(),
            })?;
            let (mut page_names, token) = page.into_parts();
            names.append(&mut page_names);
            if token.is_none() {
                return Ok(names);
            }
            next_token = token;
        }
    }
}

/// Proxy resources are signed with a trailing newline before the (empty)
/// query list.
fn signed_resource(path: &str) -> String {
    if path.starts_with(&format!("/{API_VERSION}/proxy/")) {
        format!("{path}\n")
    } else {
        path.to_owned()
    }
}

fn services_path() -> String {
    format!("/{API_VERSION}/services")
}

fn service_path(service: &str) -> String {
    format!("/{API_VERSION}/services/{service}")
}

fn function_path(service: &str, function: &str) -> String {
    format!("/{API_VERSION}/services/{service}/functions/{function}")
}

fn proxy_path(service: &str, function: &str, path: &str) -> String {
    format!(
        "/{API_VERSION}/proxy/{service}/{function}/{}",
        path.trim_start_matches('/')
    )
}

impl ComputePlatform for FcClient {
    type Error = FcError;

    fn create_service<'a>(&'a self, spec: &'a ServiceSpec) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.post_json(&services_path(), &CreateServiceBody::from(spec))
                .await
        })
    }

    fn create_function<'a>(
        &'a self,
        service: &'a str,
        spec: &'a FunctionSpec,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("{}/functions", service_path(service));
            self.post_json(&path, &CreateFunctionBody::from(spec)).await
        })
    }

    fn create_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        spec: &'a TriggerSpec,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("{}/triggers", function_path(service, function));
            self.post_json(&path, &CreateTriggerBody::from(spec)).await
        })
    }

    fn invoke<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        path: &'a str,
        body: String,
    ) -> PlatformFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let proxy = proxy_path(service, function, path);
            self.send(Request {
                method: Method::POST,
                path: &proxy,
                query: None,
                content_type: INVOKE_CONTENT_TYPE,
                body: Some(body),
            })
            .await
        })
    }

    fn update_function_environment<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        environment: &'a BTreeMap<String, String>,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.write_json(
                Method::PUT,
                &function_path(service, function),
                &UpdateEnvironmentBody {
                    environment_variables: environment,
                },
            )
            .await
        })
    }

    fn list_aliases<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            self.list::<AliasPage>(&format!("{}/aliases", service_path(service)))
                .await
        })
    }

    fn list_versions<'a>(
        &'a self,
        service: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            self.list::<VersionPage>(&format!("{}/versions", service_path(service)))
                .await
        })
    }

    fn list_functions<'a>(
        &'a self,
        service: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            self.list::<FunctionPage>(&format!("{}/functions", service_path(service)))
                .await
        })
    }

    fn list_triggers<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            self.list::<TriggerPage>(&format!("{}/triggers", function_path(service, function)))
                .await
        })
    }

    fn delete_alias<'a>(
        &'a self,
        service: &'a str,
        alias: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.delete(&format!("{}/aliases/{alias}", service_path(service)))
                .await
        })
    }

    fn delete_version<'a>(
        &'a self,
        service: &'a str,
        version: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.delete(&format!("{}/versions/{version}", service_path(service)))
                .await
        })
    }

    fn delete_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        trigger: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.delete(&format!(
                "{}/triggers/{trigger}",
                function_path(service, function)
            ))
            .await
        })
    }

    fn delete_function<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete(&function_path(service, function)).await })
    }

    fn delete_service<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete(&service_path(service)).await })
    }
}

#[cfg(test)]
mod tests;
