//! Live arXiv query.
//!
//! Run with: cargo test --package aura-ingestion --test test_arxiv_live -- --ignored --nocapture

use aura_common::{RetryPolicy, SandboxClient};
use aura_ingestion::{ArxivClient, PaperSource, SourceQuery};

#[tokio::test]
#[ignore] // Requires network access
async fn test_arxiv_search_cs_ai() {
    let client = ArxivClient::new(SandboxClient::new().unwrap(), RetryPolicy::default());
    let query = SourceQuery { topic: "cs.AI".into(), max_results: 5, window: None };

    let papers = client.search(&query).await.expect("arXiv search failed");

    println!("Found {} papers", papers.len());
    for paper in &papers {
        println!("\n---");
        println!("ID: {}", paper.external_id);
        println!("Title: {}", paper.title);
        println!("PDF: {:?}", paper.pdf_url);
    }

    assert!(!papers.is_empty(), "Should find at least one paper");
    assert!(papers.iter().all(|p| p.pdf_url.is_some()));
}
