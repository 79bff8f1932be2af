//! Stream endpoint with bearer credential
//!
//! The credential is taken from the explicit config field first, then from a
//! `jwt` query parameter on the stream URL. The `jwt` parameter is always
//! removed from the URL that is used for requests.

use reqwest::{RequestBuilder, Url};

use crate::error::{AppError, Result};

/// Query parameter that may carry the bearer credential
pub const JWT_QUERY_PARAM: &str = "jwt";

/// Normalized stream URL plus optional bearer credential
#[derive(Clone)]
pub struct StreamEndpoint {
    url: Url,
    token: Option<String>,
}

impl StreamEndpoint {
    /// Parse the configured URL and resolve the credential
    pub fn new(url: &str, auth_token: Option<&str>) -> Result<Self> {
        let mut url =
            Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{}: {}", url, e)))?;

        let query_token = url
            .query_pairs()
            .find(|(key, _)| key == JWT_QUERY_PARAM)
            .map(|(_, value)| value.into_owned());

        let token = auth_token
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or(query_token.filter(|t| !t.is_empty()));

        strip_query_param(&mut url, JWT_QUERY_PARAM);

        Ok(Self { url, token })
    }

    /// URL used for OPTIONS and POST requests
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Attach the bearer authorization header when a credential exists
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl std::fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the credential itself
        f.debug_struct("StreamEndpoint")
            .field("url", &self.url.as_str())
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

fn strip_query_param(url: &mut Url, name: &str) {
    if url.query().is_none() {
        return;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_header(endpoint: &StreamEndpoint) -> Option<String> {
        let request = endpoint
            .authorize(reqwest::Client::new().get(endpoint.url().clone()))
            .build()
            .unwrap();
        request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn test_token_from_query() {
        let endpoint =
            StreamEndpoint::new("https://media.example.com/cam1/whep?jwt=abc.def", None).unwrap();
        assert_eq!(endpoint.url().as_str(), "https://media.example.com/cam1/whep");
        assert_eq!(auth_header(&endpoint).as_deref(), Some("Bearer abc.def"));
    }

    #[test]
    fn test_explicit_token_wins_and_query_is_stripped() {
        let endpoint = StreamEndpoint::new(
            "https://media.example.com/cam1/whep?jwt=old&quality=hd",
            Some("explicit"),
        )
        .unwrap();
        assert_eq!(
            endpoint.url().as_str(),
            "https://media.example.com/cam1/whep?quality=hd"
        );
        assert_eq!(auth_header(&endpoint).as_deref(), Some("Bearer explicit"));
    }

    #[test]
    fn test_empty_explicit_token_falls_back_to_query() {
        let endpoint =
            StreamEndpoint::new("http://localhost:8889/cam/whep?jwt=q", Some("")).unwrap();
        assert_eq!(auth_header(&endpoint).as_deref(), Some("Bearer q"));
    }

    #[test]
    fn test_no_token() {
        let endpoint = StreamEndpoint::new("http://localhost:8889/cam/whep", None).unwrap();
        assert_eq!(endpoint.url().as_str(), "http://localhost:8889/cam/whep");
        assert!(auth_header(&endpoint).is_none());
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            StreamEndpoint::new("not a url", None),
            Err(AppError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let endpoint = StreamEndpoint::new("http://h/whep", Some("secret")).unwrap();
        assert!(!format!("{:?}", endpoint).contains("secret"));
    }
}
