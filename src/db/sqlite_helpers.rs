//! SQLite query building helpers
//!
//! SQLite has no array binds, so `IN (...)` lists need one placeholder per value.
//! Pagination and `LIKE` search follow the same conventions in every repository.

/// Default page size for paginated listings
pub const DEFAULT_PER_PAGE: i64 = 50;

/// Upper bound on page size
pub const MAX_PER_PAGE: i64 = 500;

// ============================================================================
// Placeholders
// ============================================================================

/// Build `?, ?, ?` for `count` values
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// ============================================================================
// Search
// ============================================================================

/// Escape a user search string for `LIKE ? ESCAPE '\'` and wrap it in `%`.
/// Returns `None` for blank input so callers can skip the condition.
pub fn like_pattern(search: Option<&str>) -> Option<String> {
    let term = search?.trim();
    if term.is_empty() {
        return None;
    }
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    Some(escaped)
}

// ============================================================================
// Pagination
// ============================================================================

/// A normalized page request (1-based page)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub per_page: i64,
}

impl Page {
    /// Clamp raw query values into a valid page
    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(1);
        let per_page = per_page
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_PER_PAGE)
            .min(MAX_PER_PAGE);
        Self { page, per_page }
    }

    #[inline]
    pub fn limit(&self) -> i64 {
        self.per_page
    }

    #[inline]
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}
