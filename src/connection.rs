use reqwest::{header, Client, Response, StatusCode};
use url::Url;

use crate::breakpoint::ContentLength;
use crate::config::DownloadConfig;
use crate::error::{Error, Result};

/// What the server told us about the body we're about to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub status: u16,
    pub content_length: ContentLength,
    pub accept_ranges: bool,
    pub etag: Option<String>,
}

impl Connected {
    pub fn from_response(response: &Response) -> Self {
        let headers = response.headers();
        let accept_ranges = response.status() == StatusCode::PARTIAL_CONTENT
            || headers
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            status: response.status().as_u16(),
            content_length: response.content_length().into(),
            accept_ranges,
            etag,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT.as_u16()
    }
}

/// `bytes=start-` or `bytes=start-end` with an inclusive end.
pub fn range_header(start: u64, end_inclusive: Option<u64>) -> String {
    match end_inclusive {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

#[derive(Clone)]
pub struct HttpConnection {
    client: Client,
}

impl HttpConnection {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }

    pub async fn open(&self, url: &Url, range: Option<String>) -> Result<Response> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }
        Ok(response)
    }
}
