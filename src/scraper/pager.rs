//! Lazy paginated walk over a channel's message history.
//!
//! Incremental mode (`after` set) pages forward, advancing the cursor
//! to the greatest id of each batch; cold mode pages backward from
//! newest, advancing `before` to the smallest. Either way each batch
//! is yielded in descending timestamp order, with an inter-request
//! sleep to stay under the service's rate limits.

use async_stream::try_stream;
use futures::stream::BoxStream;
use std::time::Duration;
use tracing::trace;

use crate::discord::{ChatGateway, MessageBundle, PageRequest, PAGE_SIZE};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Resume point: only messages with a strictly greater id.
    pub after: Option<String>,
    /// Start point for backward paging; defaults to newest.
    pub before: Option<String>,
    /// Overall cap across all pages.
    pub limit: Option<usize>,
    /// Sleep between page requests, milliseconds.
    pub delay_ms: u64,
}

pub fn stream_messages<'a>(
    gateway: &'a dyn ChatGateway,
    channel_id: &'a str,
    opts: FetchOptions,
) -> BoxStream<'a, anyhow::Result<MessageBundle>> {
    Box::pin(try_stream! {
        let incremental = opts.after.is_some();
        let mut after_cursor = opts.after.clone();
        let mut before_cursor = opts.before.clone();
        let mut fetched = 0usize;
        let mut first_page = true;

        loop {
            let remaining = match opts.limit {
                Some(limit) if fetched >= limit => break,
                Some(limit) => limit - fetched,
                None => usize::MAX,
            };
            let page_limit = (PAGE_SIZE as usize).min(remaining) as u8;

            if !first_page && opts.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(opts.delay_ms)).await;
            }
            first_page = false;

            let request = PageRequest {
                limit: page_limit,
                before: if incremental { None } else { before_cursor.clone() },
                after: if incremental { after_cursor.clone() } else { None },
            };
            let batch = gateway.message_page(channel_id, &request).await?;
            trace!(channel = channel_id, size = batch.len(), "fetched page");
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            if incremental {
                after_cursor = batch.iter().map(|m| m.id.clone()).max();
            } else {
                before_cursor = batch.iter().map(|m| m.id.clone()).min();
            }

            let mut ordered = batch;
            ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            for bundle in ordered {
                yield bundle;
                fetched += 1;
            }

            // A short page means the history is exhausted.
            if batch_len < page_limit as usize {
                break;
            }
        }
    })
}
