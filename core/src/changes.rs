//! Lazy, paginated stream over `activities/leadchanges.json`.

use std::collections::VecDeque;

use tracing::debug;

use crate::client::Client;
use crate::error::{MarketoError, Result};
use crate::http::Transport;
use crate::types::LeadChange;

#[derive(Debug)]
enum Cursor {
    /// No request made yet; the paging token for `since` is still unknown.
    Start,
    /// More pages are available at this token.
    Next(String),
    /// The last page has been fetched, or an error ended the stream.
    Done,
}

/// Iterator over lead-change activities, in the order Marketo returns them.
///
/// Pages are fetched on demand: the first `next()` resolves the paging token
/// and loads the first page; later pages load when the buffer runs dry and
/// Marketo reported `moreResult`. The first error is yielded once, after which
/// the iterator is exhausted. It cannot be restarted.
pub struct LeadChanges<'c, T: Transport> {
    client: &'c Client<T>,
    since: String,
    fields: Vec<String>,
    buffer: VecDeque<LeadChange>,
    cursor: Cursor,
    pages: usize,
}

impl<'c, T: Transport> LeadChanges<'c, T> {
    pub(crate) fn new(client: &'c Client<T>, since: &str, fields: Vec<String>) -> Self {
        Self {
            client,
            since: since.to_string(),
            fields,
            buffer: VecDeque::new(),
            cursor: Cursor::Start,
            pages: 0,
        }
    }

    /// Number of change pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fetch_next_page(&mut self) -> Result<()> {
        let page_token = match &self.cursor {
            Cursor::Done => return Ok(()),
            Cursor::Next(token) => token.clone(),
            Cursor::Start => {
                // Refused locally, so there is no HTTP status to report.
                if self.fields.is_empty() {
                    return Err(MarketoError::Api {
                        status: 0,
                        code: String::new(),
                        message: "at least one field must be watched".to_string(),
                    });
                }
                self.client.paging_token(&self.since)?
            }
        };

        debug!(page = self.pages + 1, "fetching lead changes page");
        let page = self.client.lead_changes_page(&page_token, &self.fields)?;
        self.pages += 1;
        self.buffer.extend(page.changes);

        // Keep polling only while Marketo says so and hands us a cursor.
        self.cursor = match (page.more_result, page.next_page_token) {
            (true, Some(token)) => Cursor::Next(token),
            _ => Cursor::Done,
        };
        Ok(())
    }
}

impl<T: Transport> Iterator for LeadChanges<'_, T> {
    type Item = Result<LeadChange>;

    fn next(&mut self) -> Option<Self::Item> {
        // A page may legitimately be empty while moreResult is still true.
        while self.buffer.is_empty() && !matches!(self.cursor, Cursor::Done) {
            if let Err(err) = self.fetch_next_page() {
                self.cursor = Cursor::Done;
                self.buffer.clear();
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl<T: Transport> std::iter::FusedIterator for LeadChanges<'_, T> {}

impl<T: Transport> std::fmt::Debug for LeadChanges<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadChanges")
            .field("since", &self.since)
            .field("fields", &self.fields)
            .field("buffered", &self.buffer.len())
            .field("cursor", &self.cursor)
            .field("pages", &self.pages)
            .finish()
    }
}
