//! Paginated Fetcher
//!
//! Pulls one entity kind for one account across an incremental window, one
//! page per [`PageFetcher::next_batch`] call. The search endpoint refuses to
//! page past a fixed offset, so once the numeric cursor reaches the cap the
//! window's lower bound is moved up to the last seen modification instant and
//! paging restarts from the first page of the narrowed window. When more
//! records than the cap share one instant, that instant is paged in object id
//! order before narrowing resumes just past it.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use tracing::{debug, warn};

use crate::credentials::CredentialManager;
use crate::crm::{CrmApi, RawRecord, SearchPage, SearchRequest};
use crate::error::SyncError;
use crate::models::Credentials;
use crate::sync::entities::{EntityDescriptor, EntityKind};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_OFFSET_CAP: u64 = 9_900;

/// Position of the fetcher inside its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// Paging from the window's lower bound; `None` is the first page.
    Offset(Option<u64>),
    /// Offset cap was hit; paging from `since` instead of the lower bound.
    Watermark {
        since: DateTime<Utc>,
        after: Option<u64>,
    },
    /// More than the offset cap's worth of records share the instant `at`;
    /// paging through them in object id order, past `after_id`.
    Tie {
        at: DateTime<Utc>,
        after_id: Option<String>,
        after: Option<u64>,
    },
    Exhausted,
}

/// Incremental window of one entity kind for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWindow {
    pub kind: EntityKind,
    pub lower_bound: DateTime<Utc>,
    pub upper_bound: DateTime<Utc>,
    pub cursor: CursorState,
}

impl SyncWindow {
    pub fn new(kind: EntityKind, lower_bound: DateTime<Utc>, upper_bound: DateTime<Utc>) -> Self {
        Self {
            kind,
            lower_bound,
            upper_bound,
            cursor: CursorState::Offset(None),
        }
    }

    pub fn lower_effective_bound(&self) -> DateTime<Utc> {
        match &self.cursor {
            CursorState::Watermark { since, .. } => *since,
            CursorState::Tie { at, .. } => *at,
            _ => self.lower_bound,
        }
    }

    pub fn after(&self) -> Option<u64> {
        match &self.cursor {
            CursorState::Offset(after)
            | CursorState::Watermark { after, .. }
            | CursorState::Tie { after, .. } => *after,
            CursorState::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor == CursorState::Exhausted
    }

    /// Search request for the page the cursor points at.
    pub fn request(&self, descriptor: &EntityDescriptor, page_size: u32) -> SearchRequest {
        match &self.cursor {
            CursorState::Tie { at, after_id, after } => SearchRequest::tied_at(
                descriptor.modified_property,
                *at,
                after_id.as_deref(),
                descriptor.properties,
                page_size,
                *after,
            ),
            _ => SearchRequest::modified_between(
                descriptor.modified_property,
                self.lower_effective_bound(),
                self.upper_bound,
                descriptor.properties,
                page_size,
                self.after(),
            ),
        }
    }

    /// Move the cursor past a fetched page.
    ///
    /// `next_after` is the provider's cursor for the following page and
    /// `last` the page's last record.
    pub fn advance(&mut self, next_after: Option<&str>, last: Option<&RawRecord>, cap: u64) {
        let Some(raw) = next_after else {
            self.cursor = match &self.cursor {
                CursorState::Tie { at, .. } => self.resume_after(*at),
                _ => CursorState::Exhausted,
            };
            return;
        };

        let Ok(offset) = raw.parse::<u64>() else {
            warn!(
                entity_kind = %self.kind,
                cursor = raw,
                "malformed pagination cursor, ending pagination"
            );
            self.cursor = CursorState::Exhausted;
            return;
        };

        if offset >= cap {
            let bound = self.lower_effective_bound();
            self.cursor = match (&self.cursor, last) {
                (_, None) => CursorState::Exhausted,
                (CursorState::Tie { at, .. }, Some(last)) => CursorState::Tie {
                    at: *at,
                    after_id: Some(last.id.clone()),
                    after: None,
                },
                (_, Some(last)) if last.updated_at > bound => {
                    debug!(
                        entity_kind = %self.kind,
                        since = %last.updated_at,
                        "offset cap reached, narrowing window"
                    );
                    CursorState::Watermark {
                        since: last.updated_at,
                        after: None,
                    }
                }
                (_, Some(last)) => {
                    warn!(
                        entity_kind = %self.kind,
                        at = %last.updated_at,
                        "offset cap reached within one instant, paging by object id"
                    );
                    CursorState::Tie {
                        at: last.updated_at,
                        after_id: None,
                        after: None,
                    }
                }
            };
            return;
        }

        let after = Some(offset);
        self.cursor = match &self.cursor {
            CursorState::Watermark { since, .. } => CursorState::Watermark {
                since: *since,
                after,
            },
            CursorState::Tie { at, after_id, .. } => CursorState::Tie {
                at: *at,
                after_id: after_id.clone(),
                after,
            },
            _ => CursorState::Offset(after),
        };
    }

    /// Narrowed cursor starting just past a fully paged instant.
    fn resume_after(&self, at: DateTime<Utc>) -> CursorState {
        let since = at + TimeDelta::milliseconds(1);
        if since > self.upper_bound {
            CursorState::Exhausted
        } else {
            CursorState::Watermark { since, after: None }
        }
    }
}

/// Per-page retry schedule: `base * 2^failed` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after `failed` failed attempts.
    pub fn backoff(&self, failed: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(failed))
    }
}

/// Lazy, finite sequence of record batches for one window.
pub struct PageFetcher<'a> {
    crm: &'a dyn CrmApi,
    credentials: &'a CredentialManager,
    descriptor: &'a EntityDescriptor,
    window: SyncWindow,
    page_size: u32,
    offset_cap: u64,
    retry: RetryPolicy,
}

impl<'a> PageFetcher<'a> {
    pub fn new(
        crm: &'a dyn CrmApi,
        credentials: &'a CredentialManager,
        descriptor: &'a EntityDescriptor,
        window: SyncWindow,
    ) -> Self {
        Self {
            crm,
            credentials,
            descriptor,
            window,
            page_size: DEFAULT_PAGE_SIZE,
            offset_cap: DEFAULT_OFFSET_CAP,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_offset_cap(mut self, offset_cap: u64) -> Self {
        self.offset_cap = offset_cap;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn window(&self) -> &SyncWindow {
        &self.window
    }

    /// Fetch the next page. `Ok(None)` once the window is exhausted.
    ///
    /// `credentials` may be refreshed in place between failed attempts.
    pub async fn next_batch(
        &mut self,
        credentials: &mut Credentials,
    ) -> Result<Option<Vec<RawRecord>>, SyncError> {
        if self.window.is_exhausted() {
            return Ok(None);
        }

        let request = self.window.request(self.descriptor, self.page_size);

        let page = self.fetch_page(&request, credentials).await?;
        counter!("crm_sync_pages_fetched_total", "entity_kind" => self.descriptor.kind.as_str())
            .increment(1);

        self.window
            .advance(page.next_after(), page.results.last(), self.offset_cap);

        Ok(Some(page.results))
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        credentials: &mut Credentials,
    ) -> Result<SearchPage, SyncError> {
        let kind = self.descriptor.kind;
        let mut failed = 0u32;

        loop {
            let result = self
                .crm
                .search(&credentials.access_token, kind.object_type(), request)
                .await;

            let err = match result {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            failed += 1;
            if failed >= self.retry.max_attempts {
                counter!("crm_sync_fetch_exhausted_total", "entity_kind" => kind.as_str())
                    .increment(1);
                return Err(SyncError::FetchExhausted {
                    kind,
                    attempts: failed,
                    last_error: err,
                });
            }

            counter!("crm_sync_fetch_retries_total", "entity_kind" => kind.as_str()).increment(1);
            warn!(
                entity_kind = %kind,
                operation = "search",
                attempt = failed,
                error = %err,
                "page fetch failed, retrying"
            );

            if CredentialManager::needs_refresh(credentials, Utc::now()) {
                match self.credentials.refresh(credentials).await {
                    Ok(_) => {}
                    Err(auth @ SyncError::Auth(_)) => return Err(auth),
                    Err(other) => warn!(
                        entity_kind = %kind,
                        operation = "refresh_access_token",
                        error = %other,
                        "credential refresh failed between attempts"
                    ),
                }
            }

            tokio::time::sleep(self.retry.backoff(failed)).await;
        }
    }
}
