//! Pagination loop shared by every listing protocol

use super::sequence::{self, Emitter, Halt, ResultSequence};
use super::{CursorState, Entry, ListError, ListingPage};
use crate::metrics;
use tokio_util::sync::CancellationToken;

/// Fetches single pages of one listing protocol
#[async_trait::async_trait]
pub trait PageSource: Send + Sync + 'static {
    /// Short protocol name for logs and metrics
    fn protocol(&self) -> &'static str;

    /// Local argument checks; a failure ends the listing before any request
    fn validate(&self) -> Result<(), ListError> {
        Ok(())
    }

    /// Cursor for the first page
    fn initial_cursor(&self) -> CursorState;

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError>;
}

/// Start enumerating `source` on a background task.
///
/// The returned sequence yields each entry of each page in server order,
/// then the page's common prefixes. A failure is delivered as one `Err`
/// item and ends the sequence. After `cancel` fires, at most the items
/// already handed over are seen, followed by a single
/// [`ListError::Cancelled`].
pub fn spawn_listing<S: PageSource>(
    source: S,
    cancel: CancellationToken,
) -> ResultSequence<Result<Entry, ListError>> {
    let (emitter, sequence) = sequence::channel(cancel);
    tokio::spawn(run(source, emitter));
    sequence
}

async fn run<S: PageSource>(source: S, emitter: Emitter<Result<Entry, ListError>>) {
    let protocol = source.protocol();

    if let Err(e) = source.validate() {
        tracing::debug!(protocol = protocol, error = %e, "Listing rejected before first request");
        let _ = emitter.emit(Err(e)).await;
        return;
    }

    match enumerate(&source, &emitter).await {
        Ok(pages) => {
            tracing::debug!(protocol = protocol, pages = pages, "Listing finished");
        }
        Err(Halt::Cancelled) => {
            tracing::debug!(protocol = protocol, "Listing cancelled");
            metrics::record_listing_cancelled(protocol);
            emitter.finish_with(Err(ListError::Cancelled)).await;
        }
        Err(Halt::Closed) => {
            tracing::debug!(protocol = protocol, "Listing consumer went away");
        }
    }
}

/// Drive the page loop; returns the number of pages fetched
async fn enumerate<S: PageSource>(
    source: &S,
    emitter: &Emitter<Result<Entry, ListError>>,
) -> Result<u64, Halt> {
    let protocol = source.protocol();
    let mut cursor = source.initial_cursor();
    let mut pages = 0u64;

    loop {
        if pages > 0 {
            // Fetch the next page only once the consumer caught up.
            emitter.ready().await?;
        }
        if emitter.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let fetched = tokio::select! {
            biased;
            _ = emitter.cancelled() => return Err(Halt::Cancelled),
            page = source.fetch_page(&cursor) => page,
        };
        pages += 1;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                metrics::record_listing_error(protocol, e.kind());
                tracing::warn!(protocol = protocol, error = %e, "Listing page failed");
                emitter.emit(Err(e)).await?;
                return Ok(pages);
            }
        };

        metrics::record_listing_page(protocol, page.entries.len() + page.prefixes.len());

        let ListingPage {
            entries,
            prefixes,
            is_truncated,
            next_cursor,
        } = page;

        for entry in entries {
            emitter.emit(Ok(entry)).await?;
        }
        for prefix in prefixes {
            emitter.emit(Ok(Entry::Prefix(prefix))).await?;
        }

        if !is_truncated {
            return Ok(pages);
        }
        if next_cursor.is_empty() {
            let e = ListError::ProtocolViolation(format!(
                "{} page is truncated but carries no cursor",
                protocol
            ));
            metrics::record_listing_error(protocol, e.kind());
            emitter.emit(Err(e)).await?;
            return Ok(pages);
        }
        cursor = next_cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::ObjectEntry;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves canned pages and records the cursors it was asked for
    #[derive(Clone, Default)]
    struct ScriptedSource {
        pages: Arc<Mutex<VecDeque<Result<ListingPage, ListError>>>>,
        cursors: Arc<Mutex<Vec<CursorState>>>,
        fetches: Arc<AtomicUsize>,
        invalid: bool,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<ListingPage, ListError>>) -> Self {
            Self {
                pages: Arc::new(Mutex::new(pages.into())),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl PageSource for ScriptedSource {
        fn protocol(&self) -> &'static str {
            "scripted"
        }

        fn validate(&self) -> Result<(), ListError> {
            if self.invalid {
                Err(ListError::Validation("bad bucket".into()))
            } else {
                Ok(())
            }
        }

        fn initial_cursor(&self) -> CursorState {
            CursorState::ContinuationToken(String::new())
        }

        async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.cursors.lock().push(cursor.clone());
            self.pages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ListError::Decode("script exhausted".into())))
        }
    }

    fn object(key: &str) -> Entry {
        Entry::Object(ObjectEntry {
            key: key.into(),
            ..Default::default()
        })
    }

    fn page(keys: &[&str], truncated: bool, token: &str) -> Result<ListingPage, ListError> {
        Ok(ListingPage {
            entries: keys.iter().map(|k| object(k)).collect(),
            prefixes: Vec::new(),
            is_truncated: truncated,
            next_cursor: CursorState::ContinuationToken(token.into()),
        })
    }

    fn keys(items: &[Result<Entry, ListError>]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| item.as_ref().ok().map(|e| e.key().to_string()))
            .collect()
    }

    // ========================================================================
    // TEST: pagination
    // ========================================================================

    #[tokio::test]
    async fn test_two_pages_in_order() {
        let source = ScriptedSource::new(vec![
            page(&["a", "b"], true, "tok1"),
            page(&["c"], false, ""),
        ]);
        let cursors = source.cursors.clone();

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["a", "b", "c"]);
        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(
            *cursors.lock(),
            vec![
                CursorState::ContinuationToken(String::new()),
                CursorState::ContinuationToken("tok1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_prefixes_follow_entries() {
        let source = ScriptedSource::new(vec![Ok(ListingPage {
            entries: vec![object("a.txt")],
            prefixes: vec!["dir/".into()],
            is_truncated: false,
            next_cursor: CursorState::ContinuationToken(String::new()),
        })]);

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Ok(Entry::Prefix(ref p)) if p == "dir/"));
    }

    #[tokio::test]
    async fn test_empty_listing() {
        let source = ScriptedSource::new(vec![page(&[], false, "")]);
        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_without_cursor_is_protocol_violation() {
        let source = ScriptedSource::new(vec![page(&["a"], true, "")]);
        let fetches = source.fetches.clone();

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ListError::ProtocolViolation(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_error_ends_sequence() {
        let source = ScriptedSource::new(vec![
            page(&["a"], true, "tok1"),
            Err(ListError::Decode("bad escape".into())),
            page(&["never"], false, ""),
        ]);

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["a"]);
        assert!(matches!(items.last(), Some(Err(ListError::Decode(_)))));
    }

    #[tokio::test]
    async fn test_validation_failure_makes_no_request() {
        let source = ScriptedSource {
            invalid: true,
            ..ScriptedSource::new(vec![page(&["a"], false, "")])
        };
        let fetches = source.fetches.clone();

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ListError::Validation(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listing_is_repeatable() {
        let script = || {
            ScriptedSource::new(vec![
                page(&["a", "b"], true, "tok1"),
                page(&["c"], false, ""),
            ])
        };

        let first = spawn_listing(script(), CancellationToken::new())
            .collect_all()
            .await;
        let second = spawn_listing(script(), CancellationToken::new())
            .collect_all()
            .await;
        assert_eq!(keys(&first), keys(&second));
    }

    // ========================================================================
    // TEST: cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_cancel_between_pages() {
        let source = ScriptedSource::new(vec![
            page(&["a", "b"], true, "tok1"),
            page(&["c"], false, ""),
        ]);
        let fetches = source.fetches.clone();

        let mut listing = spawn_listing(source, CancellationToken::new());
        assert_eq!(listing.recv().await.unwrap().unwrap().key(), "a");
        assert_eq!(listing.recv().await.unwrap().unwrap().key(), "b");

        listing.cancel();

        assert!(matches!(listing.recv().await, Some(Err(ListError::Cancelled))));
        assert!(listing.recv().await.is_none());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let source = ScriptedSource::new(vec![page(&["a"], false, "")]);
        let fetches = source.fetches.clone();

        let items = spawn_listing(source, token).collect_all().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ListError::Cancelled)));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }
}
