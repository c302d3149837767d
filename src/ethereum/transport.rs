use std::fmt::Debug;

use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, ProviderError, Ws};
use ethers::providers::RpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use url::Url;

/// JSON-RPC transport selected by URL scheme.
#[derive(Debug, Clone)]
pub enum Transport {
    Http(Http),
    Ws(Ws),
}

#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum TransportError {
    #[error("Http error: {0}")]
    Http(<Http as JsonRpcClient>::Error),

    #[error("WebSocket error: {0}")]
    Ws(<Ws as JsonRpcClient>::Error),

    #[error("Unsupported transport: {0}")]
    InvalidScheme(Url),
}

impl Transport {
    pub async fn new(url: Url) -> Result<Self, TransportError> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(Http::new(url))),
            "ws" | "wss" => Ok(Self::Ws(
                Ws::connect(url).await.map_err(TransportError::Ws)?,
            )),
            _ => Err(TransportError::InvalidScheme(url)),
        }
    }
}

impl RpcError for TransportError {
    fn as_error_response(&self) -> Option<&ethers::providers::JsonRpcError> {
        match self {
            Self::Http(error) => error.as_error_response(),
            Self::Ws(error) => error.as_error_response(),
            Self::InvalidScheme(_) => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            Self::Http(error) => error.as_serde_error(),
            Self::Ws(error) => error.as_serde_error(),
            Self::InvalidScheme(_) => None,
        }
    }
}

impl From<TransportError> for ProviderError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Http(error) => Self::from(error),
            TransportError::Ws(error) => Self::from(error),
            TransportError::InvalidScheme(url) => {
                Self::CustomError(format!("Unsupported transport: {url}"))
            }
        }
    }
}

#[async_trait]
impl JsonRpcClient for Transport {
    type Error = TransportError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        match self {
            Self::Http(inner) => inner
                .request(method, params)
                .await
                .map_err(TransportError::Http),
            Self::Ws(inner) => inner
                .request(method, params)
                .await
                .map_err(TransportError::Ws),
        }
    }
}
