//! [`KvStore`] client for the hosted store server.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use shared::{
    error::{ApiError, ErrorCode},
    paths::StorePath,
    protocol::{ReadResponse, StoreEvent, StoreWrite},
};
use storage::{KvStore, Snapshot, StoreError, Subscription, SubscriptionHandle};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
pub struct RemoteStore {
    http: Client,
    base: Url,
}

impl RemoteStore {
    pub fn new(server_url: &str) -> Result<Self, StoreError> {
        let mut base = Url::parse(server_url)
            .map_err(|error| StoreError::Rejected(format!("invalid server url {server_url}: {error}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StoreError::Rejected(format!(
                "server url must start with http:// or https://, got {server_url}"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.base
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let response = self
            .http
            .get(self.endpoint("healthz")?)
            .send()
            .await
            .map_err(unavailable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(failure(response).await)
        }
    }

    fn endpoint(&self, relative: &str) -> Result<Url, StoreError> {
        self.base
            .join(relative)
            .map_err(|error| StoreError::Rejected(format!("invalid endpoint {relative}: {error}")))
    }

    fn store_url(&self, path: &StorePath) -> Result<Url, StoreError> {
        self.endpoint(&format!("v1/store/{path}"))
    }

    fn subscribe_url(&self, path: &StorePath) -> Result<Url, StoreError> {
        let mut url = self.endpoint("v1/subscribe")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::Rejected(format!("cannot derive websocket url from {url}")))?;
        url.query_pairs_mut().append_pair("path", path.as_str());
        Ok(url)
    }
}

fn unavailable(error: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

async fn failure(response: Response) -> StoreError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(ApiError {
            code: ErrorCode::Unavailable | ErrorCode::Internal,
            message,
        }) => StoreError::Unavailable(message),
        Ok(ApiError { message, .. }) => StoreError::Rejected(message),
        Err(_) if status.is_server_error() => StoreError::Unavailable(status.to_string()),
        Err(_) => StoreError::Rejected(status.to_string()),
    }
}

#[async_trait]
impl KvStore for RemoteStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        let response = self
            .http
            .get(self.store_url(path)?)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        let body: ReadResponse = response.json().await.map_err(|error| StoreError::Malformed {
            path: path.to_string(),
            reason: error.to_string(),
        })?;
        Ok(body.value)
    }

    async fn set(&self, path: &StorePath, write: StoreWrite) -> Result<(), StoreError> {
        let url = self.store_url(path)?;
        let request = match write {
            StoreWrite::Delete => self.http.delete(url),
            write => self.http.put(url).json(&write),
        };
        let response = request.send().await.map_err(unavailable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(failure(response).await)
        }
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let url = self.subscribe_url(path)?;
        let (mut socket, _) = connect_async(url.as_str()).await.map_err(unavailable)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let watched = path.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = socket.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(error) => {
                        warn!(path = %watched, %error, "remote: subscription socket failed");
                        break;
                    }
                };
                match serde_json::from_str::<StoreEvent>(&text) {
                    Ok(StoreEvent::ValueChanged { value, .. }) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Ok(StoreEvent::Error(error)) => {
                        warn!(path = %watched, message = %error.message, "remote: subscription rejected");
                        break;
                    }
                    Err(error) => {
                        warn!(path = %watched, %error, "remote: undecodable event");
                    }
                }
            }
            debug!(path = %watched, "remote: subscription closed");
        });

        let abort = reader.abort_handle();
        let handle = SubscriptionHandle::new(move || abort.abort());
        Ok(Subscription::new(path.clone(), rx, handle))
    }
}
