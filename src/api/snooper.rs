//! Usage snooper: transparent token scraping on the fast path.
//!
//! Wraps the relayed upstream body and forwards every byte unchanged while
//! scanning chunks that mention "tokens" with two anchored patterns. The
//! accumulation is additive because Anthropic streaming reports input and
//! output tokens in separate events while OpenAI reports a single usage
//! object at the end. Best-effort: a token count whose JSON straddles a
//! chunk boundary is missed (under-counting is tolerated, over-counting
//! never happens). No body bytes are retained.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::core::usage::{AccountingGuard, UsageCounters};

lazy_static! {
    static ref RE_INPUT: Regex =
        Regex::new(r#""(?:prompt_tokens|input_tokens)"\s*:\s*(\d+)"#).unwrap();
    static ref RE_OUTPUT: Regex =
        Regex::new(r#""(?:completion_tokens|output_tokens)"\s*:\s*(\d+)"#).unwrap();
}

/// Scan one relayed chunk for token counts.
pub fn scan_chunk(chunk: &[u8], counters: &UsageCounters) {
    // Cheap pre-filter before running the regexes
    if !contains_tokens(chunk) {
        return;
    }
    if let Some(captures) = RE_INPUT.captures(chunk) {
        if let Some(n) = parse_count(&captures[1]) {
            counters.add_prompt(n);
        }
    }
    if let Some(captures) = RE_OUTPUT.captures(chunk) {
        if let Some(n) = parse_count(&captures[1]) {
            counters.add_completion(n);
        }
    }
}

fn contains_tokens(chunk: &[u8]) -> bool {
    chunk.windows(6).any(|w| w == b"tokens")
}

fn parse_count(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Pass-through body stream that feeds [`scan_chunk`] and owns the request's
/// accounting guard, so the usage record fires when the relay finishes or
/// the client disconnects.
///
/// The request only counts as successful once the upstream body has been
/// relayed to the end (`complete_ok` carries the upstream 2xx verdict); a
/// disconnect mid-stream drops the stream before that point and records a
/// failure with whatever counters accumulated.
pub struct UsageSnooper<S> {
    inner: S,
    counters: Arc<UsageCounters>,
    guard: AccountingGuard,
    complete_ok: bool,
}

impl<S> UsageSnooper<S> {
    pub fn new(
        inner: S,
        counters: Arc<UsageCounters>,
        guard: AccountingGuard,
        complete_ok: bool,
    ) -> Self {
        UsageSnooper {
            inner,
            counters,
            guard,
            complete_ok,
        }
    }
}

impl<S, E> Stream for UsageSnooper<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match polled {
            Poll::Ready(Some(Ok(ref chunk))) => scan_chunk(chunk, &self.counters),
            Poll::Ready(None) => {
                if self.complete_ok {
                    self.guard.mark_success();
                }
            }
            _ => {}
        }
        polled
    }
}
