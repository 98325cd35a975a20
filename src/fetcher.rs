//! An HTTP client that fetches templates from the server using conditional requests.
use std::time::Duration;

use reqwest::{
    header::{ACCEPT, ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};

use crate::{Error, Result, Template};

/// Response of a template fetch.
#[derive(Debug)]
pub enum FetchResponse {
    /// The server confirmed that the cached template is current.
    NotModified,
    /// A new template was downloaded.
    Modified {
        #[allow(missing_docs)]
        template: Template,
        /// Version token to send with the next conditional fetch.
        etag: Option<String>,
    },
}

/// Something that can produce templates. Implemented by [`HttpTemplateFetcher`]; closures can be
/// used for custom transports.
pub trait TemplateSource: Send + Sync {
    /// Fetch the template. `etag` is the stored version token, if any.
    fn fetch(&self, etag: Option<&str>) -> Result<FetchResponse>;
}

impl<F> TemplateSource for F
where
    F: Fn(Option<&str>) -> Result<FetchResponse> + Send + Sync,
{
    fn fetch(&self, etag: Option<&str>) -> Result<FetchResponse> {
        self(etag)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct HttpTemplateFetcherConfig {
    pub endpoint_url: String,
    pub api_token: String,
    pub environment: String,
    pub request_timeout: Duration,
    /// Immediate retries on transport errors within a single fetch.
    pub retry_attempts: u32,
}

/// A client that fetches templates from `<endpoint_url>/<environment>`.
pub struct HttpTemplateFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    api_token: String,
    retry_attempts: u32,
}

impl HttpTemplateFetcher {
    #[allow(missing_docs)]
    pub fn new(config: HttpTemplateFetcherConfig) -> Result<HttpTemplateFetcher> {
        let url = environment_url(&config.endpoint_url, &config.environment)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(HttpTemplateFetcher {
            client,
            url,
            api_token: config.api_token,
            retry_attempts: config.retry_attempts,
        })
    }

    /// URL the template is fetched from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn fetch_once(&self, etag: Option<&str>) -> Result<FetchResponse> {
        let mut request = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.api_token)
            .header(ACCEPT, "application/json");
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        log::debug!(target: "togglr", has_etag = etag.is_some(); "fetching template");
        let response = request.send()?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "togglr", "template not modified");
                Ok(FetchResponse::NotModified)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "togglr", "client is not authorized. Check your API token");
                Err(Error::Unauthorized)
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let body = response.bytes()?;
                let template = Template::from_slice(&body)?;
                log::debug!(target: "togglr",
                            version:serde = template.version,
                            etag:serde = etag;
                            "successfully fetched template");
                Ok(FetchResponse::Modified { template, etag })
            }
            status => {
                log::warn!(target: "togglr", "received unexpected response while fetching template: {status}");
                Err(Error::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

impl TemplateSource for HttpTemplateFetcher {
    fn fetch(&self, etag: Option<&str>) -> Result<FetchResponse> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(etag) {
                Err(Error::Network(err)) if attempt < self.retry_attempts => {
                    attempt += 1;
                    log::debug!(target: "togglr", attempt; "retrying template fetch after network error: {err}");
                }
                result => return result,
            }
        }
    }
}

/// Append `environment` as a path segment to `endpoint_url`.
fn environment_url(endpoint_url: &str, environment: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint_url).map_err(Error::InvalidEndpointUrl)?;
    url.path_segments_mut()
        .map_err(|()| Error::InvalidEndpointUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .push(environment);
    Ok(url)
}
