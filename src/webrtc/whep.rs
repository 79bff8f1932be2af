//! WHEP signaling client
//!
//! HTTP side of a negotiation attempt:
//! - `OPTIONS` on the stream URL to discover ICE servers (`Link` header)
//! - `POST` of the SDP offer, answered with `201 Created` + `Location`
//! - `PATCH` of trickle ICE fragments to the session URL
//! - optional `DELETE` of the session URL on close

use reqwest::header::{CONTENT_TYPE, IF_MATCH, LINK, LOCATION};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, trace};

use super::config::IceServer;
use super::signaling::parse_link_header;
use crate::auth::StreamEndpoint;
use crate::error::{AppError, Result};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// Answer returned for an accepted offer
#[derive(Debug, Clone)]
pub struct WhepAnswer {
    /// Session resource, used for trickle and teardown
    pub session_url: Url,
    pub sdp: String,
}

/// Error body of a 400 response
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client bound to one stream endpoint
#[derive(Debug, Clone)]
pub struct WhepClient {
    client: Client,
    endpoint: StreamEndpoint,
}

impl WhepClient {
    pub fn new(endpoint: StreamEndpoint) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    /// Discover ICE servers; the response status is not checked
    pub async fn request_ice_servers(&self) -> Result<Vec<IceServer>> {
        let url = self.endpoint.url().clone();
        debug!("OPTIONS {}", url);

        let response = self
            .endpoint
            .authorize(self.client.request(reqwest::Method::OPTIONS, url))
            .send()
            .await?;

        let values: Vec<&str> = response
            .headers()
            .get_all(LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let servers = parse_link_header(values);

        debug!("Discovered {} ICE server(s)", servers.len());
        Ok(servers)
    }

    /// Send the local offer and return the answer plus session URL
    pub async fn send_offer(&self, offer: &str) -> Result<WhepAnswer> {
        let url = self.endpoint.url().clone();
        debug!("POST {} ({} bytes)", url, offer.len());

        let response = self
            .endpoint
            .authorize(self.client.post(url.clone()))
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.to_string())
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {}
            StatusCode::BAD_REQUEST => return Err(server_reported(response).await),
            status => return Err(status_error(status)),
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::InvalidResponse("missing Location header".to_string()))?;
        let session_url = url
            .join(location)
            .map_err(|e| AppError::InvalidResponse(format!("bad Location {}: {}", location, e)))?;

        let sdp = response.text().await?;
        trace!("Answer SDP:\n{}", sdp);

        Ok(WhepAnswer { session_url, sdp })
    }

    /// Deliver a trickle ICE fragment to the session
    pub async fn send_candidates(&self, session_url: &Url, fragment: String) -> Result<()> {
        debug!("PATCH {}", session_url);

        let response = self
            .endpoint
            .authorize(self.client.patch(session_url.clone()))
            .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .header(IF_MATCH, "*")
            .body(fragment)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(status_error(status)),
        }
    }

    /// Tear down the session resource
    pub async fn delete_session(&self, session_url: &Url) -> Result<()> {
        debug!("DELETE {}", session_url);

        let response = self
            .endpoint
            .authorize(self.client.delete(session_url.clone()))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status))
        }
    }
}

fn status_error(status: StatusCode) -> AppError {
    AppError::from_status(status.as_u16())
        .unwrap_or_else(|| AppError::UnexpectedStatus(status.as_u16()))
}

async fn server_reported(response: Response) -> AppError {
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return AppError::Http(e),
    };
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(body) => AppError::ServerReported(body.error),
        Err(e) => {
            debug!("Unreadable 400 body: {}", e);
            AppError::UnexpectedStatus(StatusCode::BAD_REQUEST.as_u16())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_server::{WhepServer, MOCK_ANSWER};
    use super::*;

    async fn client(server: &WhepServer, token: Option<&str>) -> WhepClient {
        WhepClient::new(StreamEndpoint::new(&server.url, token).unwrap())
    }

    #[tokio::test]
    async fn test_ice_servers_from_link() {
        let server = WhepServer::start().await;
        server.state.lock().link = vec![
            r#"<stun:stun.example.com:3478>; rel="ice-server""#.to_string(),
            r#"<turn:turn.example.com:3478>; rel="ice-server"; username="u"; credential="p"; credential-type="password""#.to_string(),
        ];

        let servers = client(&server, Some("tok"))
            .await
            .request_ice_servers()
            .await
            .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478".to_string()]);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
        assert_eq!(
            server.state.lock().options[0].authorization.as_deref(),
            Some("Bearer tok")
        );
    }

    #[tokio::test]
    async fn test_no_link_header() {
        let server = WhepServer::start().await;
        let servers = client(&server, None).await.request_ice_servers().await.unwrap();
        assert!(servers.is_empty());
        assert!(server.state.lock().options[0].authorization.is_none());
    }

    #[tokio::test]
    async fn test_offer_accepted() {
        let server = WhepServer::start().await;
        let answer = client(&server, Some("tok")).await.send_offer("v=0\r\n").await.unwrap();

        assert_eq!(answer.sdp, MOCK_ANSWER);
        assert_eq!(answer.session_url.path(), "/stream/whep/session-1");
        assert_eq!(
            answer.session_url.host_str(),
            Url::parse(&server.url).unwrap().host_str()
        );

        let state = server.state.lock();
        assert_eq!(state.offers[0].body, "v=0\r\n");
        assert_eq!(state.offers[0].content_type.as_deref(), Some(SDP_CONTENT_TYPE));
        assert_eq!(state.offers[0].authorization.as_deref(), Some("Bearer tok"));
    }

    #[tokio::test]
    async fn test_offer_token_from_query() {
        let server = WhepServer::start().await;
        let url = format!("{}?jwt=querytok&keep=1", server.url);
        let client = WhepClient::new(StreamEndpoint::new(&url, None).unwrap());

        client.send_offer("v=0\r\n").await.unwrap();
        assert_eq!(
            server.state.lock().offers[0].authorization.as_deref(),
            Some("Bearer querytok")
        );
    }

    #[tokio::test]
    async fn test_offer_status_mapping() {
        let server = WhepServer::start().await;
        let client = client(&server, None).await;

        let cases = [(401, "authentication failed"), (403, "access denied"), (404, "stream not found"), (500, "bad status code 500")];
        for (status, message) in cases {
            server.state.lock().offer_status = status;
            let err = client.send_offer("v=0\r\n").await.unwrap_err();
            assert_eq!(err.to_string(), message);
        }
    }

    #[tokio::test]
    async fn test_offer_bad_request_message() {
        let server = WhepServer::start().await;
        {
            let mut state = server.state.lock();
            state.offer_status = 400;
            state.offer_body = r#"{"error":"bad offer"}"#.to_string();
        }

        let err = client(&server, None).await.send_offer("v=0\r\n").await.unwrap_err();
        assert!(matches!(err, AppError::ServerReported(_)));
        assert_eq!(err.to_string(), "bad offer");
    }

    #[tokio::test]
    async fn test_offer_without_location() {
        let server = WhepServer::start().await;
        server.state.lock().location = None;

        let err = client(&server, None).await.send_offer("v=0\r\n").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_send_candidates() {
        let server = WhepServer::start().await;
        let client = client(&server, Some("tok")).await;
        let answer = client.send_offer("v=0\r\n").await.unwrap();

        client
            .send_candidates(&answer.session_url, "a=ice-ufrag:u1\r\n".to_string())
            .await
            .unwrap();

        {
            let state = server.state.lock();
            let patch = &state.patches[0];
            assert_eq!(patch.path, "/stream/whep/session-1");
            assert_eq!(patch.content_type.as_deref(), Some(TRICKLE_CONTENT_TYPE));
            assert_eq!(patch.if_match.as_deref(), Some("*"));
            assert_eq!(patch.authorization.as_deref(), Some("Bearer tok"));
            assert_eq!(patch.body, "a=ice-ufrag:u1\r\n");
        }

        server.state.lock().patch_status = 404;
        let err = client
            .send_candidates(&answer.session_url, String::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "stream not found");
    }

    #[tokio::test]
    async fn test_delete_session() {
        let server = WhepServer::start().await;
        let client = client(&server, Some("tok")).await;
        let answer = client.send_offer("v=0\r\n").await.unwrap();

        client.delete_session(&answer.session_url).await.unwrap();

        let state = server.state.lock();
        assert_eq!(state.deletes[0].path, "/stream/whep/session-1");
        assert_eq!(state.deletes[0].authorization.as_deref(), Some("Bearer tok"));
    }
}
