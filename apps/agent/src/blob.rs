//! Block blob uploads over HTTP.
//!
//! Stages blocks with Put Block and commits them with Put Block List,
//! both addressed through the SAS URI handed out by the twin store.

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use twinsync_device_agent::{AgentError, BoxFuture, BlobStore};

const STORAGE_API_VERSION: &str = "2021-08-06";

pub struct HttpBlobStore {
    http: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new() -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Blob(e.to_string()))?;
        Ok(Self { http })
    }

    async fn put(&self, url: String, body: Vec<u8>) -> Result<(), AgentError> {
        let resp = self
            .http
            .put(&url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .body(body)
            .send()
            .await
            .map_err(|e| AgentError::Blob(e.to_string()))?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Blob(format!("{}: {body}", status.as_u16())));
        }
        Ok(())
    }
}

/// Appends `query` to a URI that may already carry a SAS query string.
fn with_query(sas_uri: &str, query: &str) -> String {
    let sep = if sas_uri.contains('?') { '&' } else { '?' };
    format!("{sas_uri}{sep}{query}")
}

fn put_block_url(sas_uri: &str, block_id: &str) -> String {
    let encoded = utf8_percent_encode(block_id, NON_ALPHANUMERIC);
    with_query(sas_uri, &format!("comp=block&blockid={encoded}"))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

impl BlobStore for HttpBlobStore {
    fn put_block<'a>(
        &'a self,
        sas_uri: &'a str,
        block_id: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::trace!(block_id, bytes = data.len(), "put block");
            self.put(put_block_url(sas_uri, block_id), data).await
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        sas_uri: &'a str,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(blocks = block_ids.len(), "put block list");
            let url = with_query(sas_uri, "comp=blocklist");
            self.put(url, block_list_xml(block_ids).into_bytes()).await
        })
    }
}
