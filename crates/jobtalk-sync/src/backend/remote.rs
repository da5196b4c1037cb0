use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use jobtalk_types::api::{ErrorBody, ExistsResponse, MarkReadResponse, SendMessageRequest};
use jobtalk_types::events::{GatewayCommand, GatewayEvent, MessageInsert};
use jobtalk_types::models::{ApplicationLink, ApplicationStatus, Conversation, ConversationSummary, Message};

use super::{Backend, FeedStream, OutgoingMessage};
use crate::error::SyncError;

/// How long to wait for the gateway to acknowledge a subscription.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend for a jobtalk server: REST for reads and writes, one gateway
/// socket per subscribed conversation for live inserts.
///
/// Every call is made as the holder of `token`; the user-id arguments of
/// [`Backend`] must name that same user.
#[derive(Clone)]
pub struct RemoteBackend {
    http: Client,
    base_url: String,
    token: String,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn gateway_url(&self) -> String {
        format!(
            "{}/gateway?token={}",
            self.base_url.replace("http://", "ws://").replace("https://", "wss://"),
            self.token
        )
    }

    async fn request<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SyncError> {
        let response = builder
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| SyncError::Backend(format!("malformed response: {}", e)));
        }

        let body = response.json::<ErrorBody>().await.ok();
        Err(status_error(status, body))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        self.request(self.http.get(self.url(path))).await
    }
}

fn status_error(status: StatusCode, body: Option<ErrorBody>) -> SyncError {
    let code = body.as_ref().map(|b| b.error.clone()).unwrap_or_default();
    match status {
        StatusCode::FORBIDDEN => match body.and_then(|b| b.reason) {
            Some(reason) => SyncError::Authorization(reason),
            None => SyncError::Backend(format!("forbidden: {}", code)),
        },
        StatusCode::NOT_FOUND => SyncError::NotFound,
        StatusCode::CONFLICT => SyncError::Conflict(code),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Network(status.to_string()),
        s if s.is_server_error() => SyncError::Network(status.to_string()),
        _ => SyncError::Backend(format!("{}: {}", status, code)),
    }
}

fn decode_event(message: &WsMessage) -> Option<GatewayEvent> {
    match message {
        WsMessage::Text(text) => match serde_json::from_str(text.as_str()) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Undecodable gateway event: {}", e);
                None
            }
        },
        _ => None,
    }
}

impl Backend for RemoteBackend {
    async fn list_conversations(&self, _user_id: Uuid) -> Result<Vec<ConversationSummary>, SyncError> {
        self.get("/conversations").await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>, SyncError> {
        match self.get(&format!("/conversations/{}", conversation_id)).await {
            Ok(conversation) => Ok(Some(conversation)),
            Err(SyncError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, SyncError> {
        self.get(&format!("/conversations/{}/messages", conversation_id))
            .await
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<FeedStream, SyncError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.gateway_url())
            .await
            .map_err(|e| SyncError::Network(format!("gateway connect failed: {}", e)))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let command = GatewayCommand::Subscribe {
            conversation_ids: vec![conversation_id],
        };
        let text = serde_json::to_string(&command).map_err(|e| SyncError::Backend(e.to_string()))?;
        ws_tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| SyncError::Network(format!("gateway send failed: {}", e)))?;

        // Inserts can overtake the acknowledgement; keep them.
        let mut early: Vec<MessageInsert> = Vec::new();
        let ack = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            loop {
                match ws_rx.next().await {
                    Some(Ok(message)) => match decode_event(&message) {
                        Some(GatewayEvent::Subscribed { conversation_id: id }) if id == conversation_id => {
                            return Ok(());
                        }
                        Some(GatewayEvent::SubscribeRejected { conversation_id: id }) if id == conversation_id => {
                            return Err(SyncError::NotFound);
                        }
                        Some(GatewayEvent::MessageInsert(insert)) if insert.conversation_id == conversation_id => {
                            early.push(insert);
                        }
                        _ => {}
                    },
                    Some(Err(e)) => return Err(SyncError::Network(format!("gateway error: {}", e))),
                    None => return Err(SyncError::Network("gateway closed".into())),
                }
            }
        })
        .await;

        match ack {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Network("gateway did not acknowledge subscription".into())),
        }
        debug!("Subscribed to {} over gateway", conversation_id);

        let stream = async_stream::stream! {
            for insert in early {
                yield insert;
            }
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(message) => {
                        if let Some(GatewayEvent::MessageInsert(insert)) = decode_event(&message) {
                            if insert.conversation_id == conversation_id {
                                yield insert;
                            }
                        }
                    }
                }
            }
            // Write half lives as long as the stream so the socket stays open.
            drop(ws_tx);
            debug!("Gateway stream for {} ended", conversation_id);
        };
        Ok(stream.boxed())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, SyncError> {
        let body = SendMessageRequest {
            content: message.content,
            client_marker: Some(message.client_marker),
        };
        self.request(
            self.http
                .post(self.url(&format!("/conversations/{}/messages", message.conversation_id)))
                .json(&body),
        )
        .await
    }

    async fn mark_read(&self, conversation_id: Uuid, _reader_id: Uuid) -> Result<(), SyncError> {
        let response: MarkReadResponse = self
            .request(self.http.post(self.url(&format!("/conversations/{}/read", conversation_id))))
            .await?;
        debug!("Marked {} messages read in {}", response.marked, conversation_id);
        Ok(())
    }

    async fn share_phone(&self, conversation_id: Uuid, _sharer_id: Uuid) -> Result<(), SyncError> {
        let _: Conversation = self
            .request(self.http.post(self.url(&format!("/conversations/{}/phone", conversation_id))))
            .await?;
        Ok(())
    }

    async fn application_status(&self, job_id: Uuid, applicant_id: Uuid) -> Result<Option<ApplicationStatus>, SyncError> {
        match self
            .get::<ApplicationLink>(&format!("/jobs/{}/applications/{}", job_id, applicant_id))
            .await
        {
            Ok(link) => Ok(Some(link.status)),
            Err(SyncError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn hire_request_exists(&self, _employer_id: Uuid, jobseeker_id: Uuid) -> Result<bool, SyncError> {
        let response: ExistsResponse = self.get(&format!("/hire-requests/{}", jobseeker_id)).await?;
        Ok(response.exists)
    }
}
