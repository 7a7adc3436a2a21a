//! Client facade
//!
//! The composed pipeline as seen by callers: typed JSON helpers on top, and
//! every non-2xx response turned into a classified [`HttpError`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use url::{ParseError, Url};

use crate::http::error::{ErrorKind, HttpError};
use crate::http::pipeline::Pipeline;
use crate::http::transport::HttpTransport;
use crate::types::{HttpRequest, HttpResponse, Method};
use crate::{Error, Result};

/// Marketplace API client built on an assembled pipeline
#[derive(Debug, Clone)]
pub struct MarketplaceClient {
    pipeline: Pipeline,
    base_url: Option<Url>,
}

impl MarketplaceClient {
    pub fn new(pipeline: Pipeline, base_url: Option<Url>) -> Self {
        Self { pipeline, base_url }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolve `path` against the base URL; absolute URLs pass through
    pub fn url(&self, path: &str) -> Result<Url> {
        match (Url::parse(path), &self.base_url) {
            (Ok(url), _) => Ok(url),
            (Err(ParseError::RelativeUrlWithoutBase), Some(base)) => Ok(base.join(path)?),
            (Err(e), _) => Err(e.into()),
        }
    }

    /// An empty request for `path`
    pub fn request(&self, method: Method, path: &str) -> Result<HttpRequest> {
        Ok(HttpRequest::new(method, self.url(path)?))
    }

    /// GET `path` with `query` merged into the URL
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let request = query
            .iter()
            .fold(self.request(Method::GET, path)?, |req, (k, v)| req.with_query(*k, *v));
        let response = self.send(request).await?;
        decode(&response)
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, path)?.with_json(body)?;
        decode(&self.send(request).await?)
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::PUT, path)?.with_json(body)?;
        decode(&self.send(request).await?)
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::PATCH, path)?.with_json(body)?;
        decode(&self.send(request).await?)
    }

    /// DELETE `path`; any 2xx counts as success
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }

    /// Send a prepared request; non-2xx responses become errors
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        let response = self.pipeline.send(request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let error = HttpError::from_response(&response, Some(&url)).unwrap_or_else(|| {
            HttpError::new(ErrorKind::Generic, format!("HTTP error {}", response.status))
                .with_status(response.status)
        });
        Err(Error::Http(error))
    }
}

/// Decode a 2xx body; empty and `null` bodies decode as `{}`
fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    let text = response.text();
    let trimmed = text.trim();
    let value = if trimmed.is_empty() || trimmed == "null" {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(trimmed)?
    };
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_and_null_bodies() {
        let empty: Value = decode(&HttpResponse::new(204)).unwrap();
        assert_eq!(empty, serde_json::json!({}));

        let null: Value = decode(&HttpResponse::new(200).with_body("null")).unwrap();
        assert_eq!(null, serde_json::json!({}));

        let list: Vec<u32> = decode(&HttpResponse::new(200).with_body("[1,2]")).unwrap();
        assert_eq!(list, vec![1, 2]);
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode::<Value>(&HttpResponse::new(200).with_body("<html>")).unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }
}
