use std::{ops::Deref, sync::Arc};

use reqwest::{Client, ClientBuilder};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

use crate::error::{KuraError, KuraResult};

/// reqwest client whose requests share one cookie jar.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> KuraResult<Self> {
        let cookies = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies.clone()).build()?;
        Ok(Self { client, cookies })
    }

    /// Stores a `Set-Cookie` style value as if `url` had sent it.
    pub fn add_cookie(&self, cookie: &str, url: &Url) -> KuraResult<()> {
        let mut jar = self
            .cookies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        jar.parse(cookie, url)
            .map_err(|e| KuraError::ConfigError(format!("invalid cookie for {url}: {e}")))?;
        Ok(())
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
