// ABOUTME: Page-based and cursor-based pagination over the request client
// ABOUTME: Produces lazy, finite, single-pass record streams; a new stream always starts from page one

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

/// Monday cursors are valid for 60 minutes from issuance.
pub const DEFAULT_CURSOR_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    /// `None` marks the last page
    pub cursor: Option<String>,
}

/// An opaque cursor together with the instant it was handed out.
/// Lives only inside one pagination sequence and is never persisted.
#[derive(Debug, Clone)]
pub struct PageCursor {
    token: String,
    issued_at: Instant,
}

impl PageCursor {
    pub fn issued_now(token: String) -> Self {
        Self {
            token,
            issued_at: Instant::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, validity: Duration) -> bool {
        self.issued_at.elapsed() >= validity
    }
}

/// Page-number pagination starting at page 1.
///
/// The remote does not report totals, so a full page always triggers one more
/// request; the sequence ends after the first page strictly shorter than
/// `page_size` (an empty page included).
pub fn page_based<T, F, Fut>(fetch: F, page_size: usize) -> impl Stream<Item = SyncResult<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<Vec<T>>>,
{
    let page_size = page_size.max(1);

    stream::try_unfold((fetch, Some(1u32)), move |(mut fetch, next)| async move {
        let Some(page) = next else {
            return Ok::<_, SyncError>(None);
        };
        let items = fetch(page).await?;
        tracing::debug!("Fetched page {} ({} records)", page, items.len());

        let next = if items.len() < page_size {
            None
        } else {
            Some(page + 1)
        };
        Ok(Some((
            stream::iter(items.into_iter().map(Ok::<T, SyncError>)),
            (fetch, next),
        )))
    })
    .try_flatten()
}

enum CursorStep {
    Initial,
    Next(PageCursor),
    Done,
}

/// Cursor pagination: one call to `initial`, then `next(cursor)` until the
/// returned cursor is absent.
///
/// A cursor older than `validity` is reported as [`SyncError::CursorExpired`]
/// without sending it; the remote's own expiry signal surfaces the same way.
pub fn cursor_based<T, I, IFut, N, NFut>(
    initial: I,
    next: N,
    validity: Duration,
) -> impl Stream<Item = SyncResult<T>>
where
    I: FnOnce() -> IFut,
    IFut: Future<Output = SyncResult<CursorPage<T>>>,
    N: FnMut(String) -> NFut,
    NFut: Future<Output = SyncResult<CursorPage<T>>>,
{
    let state = (Some(initial), next, CursorStep::Initial);

    stream::try_unfold(state, move |(mut initial, mut next, step)| async move {
        let page = match step {
            CursorStep::Done => return Ok::<_, SyncError>(None),
            CursorStep::Initial => match initial.take() {
                Some(initial) => initial().await?,
                None => return Ok::<_, SyncError>(None),
            },
            CursorStep::Next(cursor) => {
                if cursor.is_expired(validity) {
                    return Err(SyncError::CursorExpired);
                }
                next(cursor.token).await?
            }
        };

        tracing::debug!(
            "Fetched cursor page ({} records, more: {})",
            page.items.len(),
            page.cursor.is_some()
        );

        let step = match page.cursor {
            Some(token) if !token.is_empty() => CursorStep::Next(PageCursor::issued_now(token)),
            _ => CursorStep::Done,
        };
        Ok(Some((
            stream::iter(page.items.into_iter().map(Ok::<T, SyncError>)),
            (initial, next, step),
        )))
    })
    .try_flatten()
}

struct Restarting<M, S> {
    make: M,
    current: Pin<Box<S>>,
    restarts: u32,
    max_restarts: u32,
    done: bool,
}

/// Re-open a pagination sequence from scratch when it reports an expired cursor.
///
/// Up to `max_restarts` fresh sequences are opened; an expiry beyond that is
/// passed through. Records yielded before a restart are yielded again by the
/// fresh sequence.
pub fn restart_on_expiry<T, M, S>(mut make: M, max_restarts: u32) -> impl Stream<Item = SyncResult<T>>
where
    M: FnMut() -> S,
    S: Stream<Item = SyncResult<T>>,
{
    let current = Box::pin(make());
    let state = Restarting {
        make,
        current,
        restarts: 0,
        max_restarts,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            match st.current.next().await {
                Some(Err(SyncError::CursorExpired)) if st.restarts < st.max_restarts => {
                    st.restarts += 1;
                    tracing::warn!(
                        "Pagination cursor expired, restarting sequence (restart {}/{})",
                        st.restarts,
                        st.max_restarts
                    );
                    st.current = Box::pin((st.make)());
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                Some(Ok(item)) => return Some((Ok(item), st)),
                None => return None,
            }
        }
    })
}
