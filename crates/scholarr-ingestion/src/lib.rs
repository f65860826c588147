//! Ingestion pipeline for Scholar profiles.
//!
//! One scholar flows through: gateway fetch → HTML parse → paged walk →
//! publication upsert → explicit outcome. Post-run, the enrichment runner
//! recovers identifiers from metadata services and the PDF queue resolves
//! open-access links. The name-search side channel carries its own breaker.

pub mod enrichment;
pub mod fetcher;
pub mod gateway;
pub mod models;
pub mod name_search;
pub mod paginator;
pub mod pdf;
pub mod processor;
pub mod scholar_html;
pub mod upserter;
