//! Book search against the public book archive.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::ResourcesConfig;
use crate::error::{StoreError, StoreResult};
use crate::services::notifier::{Notifier, Toast};

/// Searched when the user submits a blank term
pub const DEFAULT_SEARCH_TERM: &str = "education";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub identifier: String,
    pub title: String,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub mediatype: String,
    pub cover_url: String,
}

/// Archive metadata fields hold either one string or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn join(self, separator: &str) -> String {
        match self {
            OneOrMany::One(value) => value,
            OneOrMany::Many(values) => values.join(separator),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    response: SearchResponse,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    docs: Vec<BookDoc>,
}

#[derive(Debug, Deserialize)]
struct BookDoc {
    identifier: String,
    #[serde(default)]
    title: Option<OneOrMany>,
    #[serde(default)]
    creator: Option<OneOrMany>,
    #[serde(default)]
    description: Option<OneOrMany>,
    #[serde(default)]
    mediatype: Option<String>,
}

/// Decode an advanced-search response body into books
pub fn parse_search_response(body: &str, base_url: &str) -> StoreResult<Vec<Book>> {
    let envelope: SearchEnvelope = serde_json::from_str(body)?;
    let base_url = base_url.trim_end_matches('/');

    Ok(envelope
        .response
        .docs
        .into_iter()
        .map(|doc| Book {
            cover_url: format!("{}/services/img/{}", base_url, doc.identifier),
            title: doc
                .title
                .map(|t| t.join(" "))
                .unwrap_or_else(|| doc.identifier.clone()),
            creator: doc.creator.map(|c| c.join(", ")),
            description: doc.description.map(|d| d.join("\n")),
            mediatype: doc.mediatype.unwrap_or_else(|| "texts".to_string()),
            identifier: doc.identifier,
        })
        .collect())
}

/// Client for the archive's advanced-search API
#[derive(Clone)]
pub struct BookArchiveClient {
    client: Client,
    base_url: String,
    page_size: u32,
}

impl BookArchiveClient {
    pub fn new(base_url: &str, page_size: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
        }
    }

    pub fn from_config(config: &ResourcesConfig) -> Self {
        Self::new(&config.api_base_url, config.page_size)
    }

    /// Search URL for `term`; a blank term searches for [`DEFAULT_SEARCH_TERM`]
    pub fn search_url(&self, term: &str) -> String {
        let term = if term.trim().is_empty() {
            DEFAULT_SEARCH_TERM
        } else {
            term
        };
        format!(
            "{}/advancedsearch.php?q={}+mediatype%3Atexts\
             &fl[]=identifier&fl[]=title&fl[]=creator&fl[]=description&fl[]=mediatype\
             &rows={}&page=1&output=json",
            self.base_url,
            urlencoding::encode(term),
            self.page_size
        )
    }

    pub async fn search(&self, term: &str) -> StoreResult<Vec<Book>> {
        let url = self.search_url(term);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "book archive returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let books = parse_search_response(&body, &self.base_url)?;
        info!(term = %term, results = books.len(), "Book search completed");
        Ok(books)
    }
}

/// Book search as the resources page uses it: failures become a toast
/// and an empty result list.
pub struct ResourceBrowser {
    client: BookArchiveClient,
    notifier: Arc<dyn Notifier>,
}

impl ResourceBrowser {
    pub fn new(client: BookArchiveClient, notifier: Arc<dyn Notifier>) -> Self {
        Self { client, notifier }
    }

    pub async fn search(&self, term: &str) -> Vec<Book> {
        match self.client.search(term).await {
            Ok(books) => books,
            Err(e) => {
                error!(term = %term, error = %e, "Error fetching books");
                self.notifier.notify(Toast::destructive(
                    "Error",
                    "Failed to fetch books. Please try again later.",
                ));
                Vec::new()
            }
        }
    }
}
