//! Paginated message fetching
//!
//! Walks the message log page by page (newest first) until a short page
//! signals the end or the page ceiling is hit. Hitting the ceiling leaves
//! `has_more` set so callers never mistake a truncated result for a complete
//! one.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Timing;
use crate::error::IndexerResult;
use crate::indexer::{IndexerApi, Message, MessageFilter};

/// Messages collected by one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessages {
    pub messages: Vec<Message>,
    /// More messages may exist beyond what was returned
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct MessageFetcher {
    page_limit: usize,
    max_pages: usize,
    page_delay: Duration,
}

impl MessageFetcher {
    pub fn new(page_limit: usize, max_pages: usize, page_delay: Duration) -> Self {
        Self {
            page_limit: page_limit.max(1),
            max_pages: max_pages.max(1),
            page_delay,
        }
    }

    pub fn from_timing(timing: &Timing) -> Self {
        Self::new(timing.page_limit, timing.max_pages, timing.page_delay)
    }

    /// Fetch every message matching `filter`, up to the page ceiling.
    ///
    /// A failure on the first page is returned as an error. A failure on a
    /// later page keeps what was collected and reports `has_more`.
    pub async fn fetch(
        &self,
        api: &dyn IndexerApi,
        filter: &MessageFilter,
    ) -> IndexerResult<FetchedMessages> {
        let mut messages = Vec::new();
        let mut has_more = true;

        for page in 0..self.max_pages {
            if page > 0 {
                sleep(self.page_delay).await;
            }

            let offset = page * self.page_limit;
            let batch = match api.fetch_message_page(filter, self.page_limit, offset).await {
                Ok(batch) => batch,
                Err(e) if page == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        page,
                        collected = messages.len(),
                        "message page failed, result is incomplete: {}",
                        e
                    );
                    break;
                }
            };

            let returned = batch.len();
            messages.extend(batch);
            debug!(page, returned, total = messages.len(), "message page");

            if returned < self.page_limit {
                has_more = false;
                break;
            }
        }

        if has_more {
            warn!(
                max_pages = self.max_pages,
                collected = messages.len(),
                "message fetch stopped before the end of the log"
            );
        }

        Ok(FetchedMessages { messages, has_more })
    }
}
