//! Paging parameters shared by every list endpoint.

use serde::Deserialize;

/// Response header carrying the unpaged total.
pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// `?skip=&limit=` query parameters. Limit defaults to 100 and is clamped
/// to 1000; negative values clamp to zero.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct PageParams {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

impl PageParams {
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(0, MAX_LIMIT)
    }

    /// Slice an in-memory collection according to the page window.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.skip() as usize)
            .take(self.limit() as usize)
            .collect()
    }
}
