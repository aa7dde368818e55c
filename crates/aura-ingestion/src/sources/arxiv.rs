//! arXiv Atom API client.
//!
//! Endpoint used:
//!   query: http://export.arxiv.org/api/query?search_query=cat:{topic}&sortBy=submittedDate

use async_trait::async_trait;
use aura_common::{RetryPolicy, SandboxClient};
use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

use super::{PaperSource, SourceQuery};
use crate::error::{AttemptError, IngestionError};
use crate::models::PaperMetadata;

pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

pub struct ArxivClient {
    client: SandboxClient,
    base_url: String,
    retry: RetryPolicy,
}

impl ArxivClient {
    pub fn new(client: SandboxClient, retry: RetryPolicy) -> Self {
        Self { client, base_url: ARXIV_API_URL.to_string(), retry }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn query_url(&self, topic: &str, max_results: usize) -> String {
        format!(
            "{}?search_query=cat:{}&sortBy=submittedDate&sortOrder=descending&max_results={}",
            self.base_url,
            topic.trim().replace(' ', "+"),
            max_results
        )
    }

    async fn fetch_feed(&self, url: &str) -> Result<String, AttemptError> {
        let resp = self
            .client
            .get(url)
            .map_err(|e| AttemptError::Permanent(e.to_string()))?
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(AttemptError::from_status(resp.status(), url));
        }
        resp.text().await.map_err(AttemptError::from_reqwest)
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn name(&self) -> &str { "arxiv" }

    #[instrument(skip(self), fields(topic = %query.topic))]
    async fn search(&self, query: &SourceQuery) -> Result<Vec<PaperMetadata>, IngestionError> {
        let url = self.query_url(&query.topic, query.max_results);
        debug!(%url, "Querying arXiv");

        let xml = self
            .retry
            .run("arxiv_query", || self.fetch_feed(&url))
            .await
            .map_err(|e| IngestionError::SourceUnavailable(e.to_string()))?;

        let entries = parse_atom_feed(&xml).map_err(IngestionError::SourceUnavailable)?;
        let total = entries.len();

        let papers: Vec<PaperMetadata> = entries
            .into_iter()
            .filter(|p| match (query.window, p.published_on) {
                (Some(w), Some(d)) => w.contains(d),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();

        info!(returned = total, in_window = papers.len(), "arXiv feed parsed");
        Ok(papers)
    }
}

/// `http://arxiv.org/abs/2401.12345v1` → `2401.12345v1`.
pub fn external_id_from_url(id_url: &str) -> Option<String> {
    let id = id_url.trim();
    let id = id.split_once("/abs/").map(|(_, rest)| rest).unwrap_or(id);
    let id = id.trim_matches('/');
    if id.is_empty() { None } else { Some(id.to_string()) }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

#[derive(Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    primary_category: Option<String>,
    categories: Vec<String>,
    abs_url: Option<String>,
    pdf_url: Option<String>,
}

impl EntryBuilder {
    fn on_link(&mut self, e: &BytesStart<'_>) {
        let Some(href) = attr(e, b"href") else { return };
        match (attr(e, b"title").as_deref(), attr(e, b"rel").as_deref()) {
            (Some("pdf"), _) => self.pdf_url = Some(href),
            (_, Some("alternate")) => self.abs_url = Some(href),
            _ => {}
        }
    }

    fn build(self) -> Result<PaperMetadata, String> {
        let external_id = external_id_from_url(&self.id).ok_or("entry without id")?;
        let title = collapse(&self.title);
        if title.is_empty() {
            return Err(format!("{external_id}: entry without title"));
        }

        let source_url = self.abs_url.or_else(|| Some(self.id.trim().to_string()));
        let pdf_url = self
            .pdf_url
            .or_else(|| source_url.as_ref().filter(|u| u.contains("/abs/")).map(|u| u.replacen("/abs/", "/pdf/", 1)))
            .ok_or_else(|| format!("{external_id}: entry without PDF link"))?;

        let mut categories = Vec::new();
        if let Some(primary) = self.primary_category {
            categories.push(primary);
        }
        for c in self.categories {
            if !categories.contains(&c) {
                categories.push(c);
            }
        }

        let published_on = self
            .published
            .trim()
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        let summary = collapse(&self.summary);

        Ok(PaperMetadata {
            external_id,
            title,
            abstract_text: if summary.is_empty() { None } else { Some(summary) },
            categories,
            authors: self.authors,
            published_on,
            source_url,
            pdf_url: Some(pdf_url),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
}

/// Parse an arXiv Atom feed into metadata records, feed order preserved.
/// Entries missing a title or PDF link are dropped with a warning; entries with
/// an id already seen in the feed are collapsed.
pub fn parse_atom_feed(xml: &str) -> Result<Vec<PaperMetadata>, String> {
    let mut papers = Vec::new();
    let mut seen = HashSet::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<EntryBuilder> = None;
    let mut field = Field::None;
    let mut in_author = false;
    let mut author_name = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.name().as_ref() {
                    b"entry" => current = Some(EntryBuilder::default()),
                    b"author" if current.is_some() => { in_author = true; author_name.clear(); }
                    b"name" if in_author => field = Field::AuthorName,
                    b"id" if current.is_some() => field = Field::Id,
                    b"title" if current.is_some() => field = Field::Title,
                    b"summary" if current.is_some() => field = Field::Summary,
                    b"published" if current.is_some() => field = Field::Published,
                    b"link" => if let Some(ref mut entry) = current { entry.on_link(e) },
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if let Some(ref mut entry) = current {
                    match e.name().as_ref() {
                        b"link" => entry.on_link(e),
                        b"arxiv:primary_category" => entry.primary_category = attr(e, b"term"),
                        b"category" => {
                            if let Some(term) = attr(e, b"term") {
                                entry.categories.push(term);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                if let Some(ref mut entry) = current {
                    match field {
                        Field::Id        => entry.id.push_str(&text),
                        Field::Title     => { entry.title.push(' '); entry.title.push_str(&text); }
                        Field::Summary   => { entry.summary.push(' '); entry.summary.push_str(&text); }
                        Field::Published => entry.published.push_str(&text),
                        Field::AuthorName => author_name.push_str(&text),
                        Field::None => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                match e.name().as_ref() {
                    b"id" | b"title" | b"summary" | b"published" | b"name" => field = Field::None,
                    b"author" => {
                        if in_author {
                            if let Some(ref mut entry) = current {
                                let name = collapse(&author_name);
                                if !name.is_empty() {
                                    entry.authors.push(name);
                                }
                            }
                            in_author = false;
                        }
                    }
                    b"entry" => {
                        if let Some(entry) = current.take() {
                            match entry.build() {
                                Ok(p) if seen.insert(p.external_id.clone()) => papers.push(p),
                                Ok(p) => debug!(external_id = %p.external_id, "Duplicate feed entry collapsed"),
                                Err(reason) => warn!(%reason, "Skipping arXiv entry"),
                            }
                        }
                        field = Field::None;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed Atom feed at byte {}: {e}", reader.buffer_position())),
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}
