//! Proxy dispatcher (§4.4): the entry point invoked once per intercepted
//! request.

use bytes::Bytes;
use log::warn;
use tokio::time::Duration;
use uuid::Uuid;

use crate::broker::{BrokerHandle, BrokerState};
use crate::codec::WireEnvelope;
use crate::constants::{RPC_QUEUE, TENANT_HEADER};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{ErrorCapture, ProxyError};
use crate::persistence::{PersistenceQueue, WriteRecord};
use crate::supervisor::SharedSupervisor;
use crate::worker::outbound::synthetic_response;

pub struct ProxyDispatcher {
    broker: BrokerHandle,
    persistence: PersistenceQueue,
    supervisor: SharedSupervisor,
    request_timeout: Duration,
}

impl ProxyDispatcher {
    pub fn new(
        broker: BrokerHandle,
        persistence: PersistenceQueue,
        supervisor: SharedSupervisor,
        request_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            persistence,
            supervisor,
            request_timeout,
        }
    }

    /// Dispatches one intercepted request. Never propagates an error to the
    /// caller: every failure mode is translated into a synthetic `502` so
    /// the front end always receives a well-formed response object.
    pub async fn dispatch(&self, mut request: RequestEnvelope) -> ResponseEnvelope {
        let tenant_id = match extract_tenant(&request) {
            Ok(id) => id,
            Err(err) => {
                // No tenant is known, so no write record can be attributed —
                // per §3, a write record requires a tenant id.
                return synthesize_502(&err.into());
            }
        };

        match self.dispatch_inner(tenant_id, &mut request).await {
            Ok(response) => {
                self.persistence
                    .enqueue(WriteRecord::success(tenant_id, request, response.clone()));
                response
            }
            Err(err) => {
                let capture = ErrorCapture::from_error(&err);
                let response = synthesize_502(&err);
                self.persistence
                    .enqueue(WriteRecord::failure(tenant_id, request, capture));
                response
            }
        }
    }

    async fn dispatch_inner(
        &self,
        _tenant_id: Uuid,
        request: &mut RequestEnvelope,
    ) -> anyhow::Result<ResponseEnvelope> {
        if self.broker.state().await != BrokerState::Ready {
            self.supervisor.check_and_restart().await;
            anyhow::bail!(ProxyError::NotConnected);
        }

        request.strip_tenant_header();
        request.add_tag_header();

        let payload = request
            .to_wire_form()
            .map_err(|e| ProxyError::DecodeError(e.to_string()))?;

        let reply_bytes = self
            .broker
            .publish_request(RPC_QUEUE, Bytes::from(payload.into_bytes()), self.request_timeout)
            .await?;

        let reply_text = std::str::from_utf8(&reply_bytes)
            .map_err(|e| ProxyError::DecodeError(e.to_string()))?;
        let response = ResponseEnvelope::from_wire_form(reply_text)
            .map_err(|e| ProxyError::DecodeError(e.to_string()))?;
        Ok(response)
    }
}

fn extract_tenant(request: &RequestEnvelope) -> Result<Uuid, ProxyError> {
    let value = request
        .tenant_header_value()
        .ok_or(ProxyError::Unauthorized { header: TENANT_HEADER })?;
    let text = value.to_string_lossy();
    Uuid::parse_str(&text).map_err(|_| {
        warn!("malformed {TENANT_HEADER} header: {text}");
        ProxyError::Unauthorized { header: TENANT_HEADER }
    })
}

fn synthesize_502(err: &anyhow::Error) -> ResponseEnvelope {
    synthetic_response(502, "Bad Gateway", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteString;
    use crate::envelope::Scheme;

    fn bare_request(tenant_header: Option<&str>) -> RequestEnvelope {
        let mut headers = vec![];
        if let Some(value) = tenant_header {
            headers.push((
                ByteString::from_static(TENANT_HEADER),
                ByteString::from(value.as_bytes().to_vec()),
            ));
        }
        RequestEnvelope {
            http_version: "HTTP/1.1".into(),
            host: "example.com".into(),
            port: 443,
            scheme: Scheme::Https,
            method: ByteString::from_static("GET"),
            path: ByteString::from_static("/"),
            authority: ByteString::from_static("example.com"),
            headers,
            content: ByteString(vec![]),
            timestamp_start: 0.0,
            timestamp_end: 0.0,
        }
    }

    #[test]
    fn extract_tenant_rejects_missing_header() {
        let request = bare_request(None);
        assert!(matches!(
            extract_tenant(&request),
            Err(ProxyError::Unauthorized { .. })
        ));
    }

    #[test]
    fn extract_tenant_rejects_malformed_uuid() {
        let request = bare_request(Some("not-a-uuid"));
        assert!(matches!(
            extract_tenant(&request),
            Err(ProxyError::Unauthorized { .. })
        ));
    }

    #[test]
    fn extract_tenant_accepts_well_formed_uuid() {
        let request = bare_request(Some("11111111-1111-1111-1111-111111111111"));
        assert!(extract_tenant(&request).is_ok());
    }
}
