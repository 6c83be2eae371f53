use crate::args::Args;

pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_LIMIT: usize = 10;

/// A countable source that can be narrowed to a window.
pub trait Cursor: Clone {
    fn count(&self) -> usize;
    fn limit(self, limit: usize) -> Self;
    fn offset(self, offset: usize) -> Self;
}

/// Pagination over a [`Cursor`], reading `page` and `per_page` from args.
///
/// Values that do not parse as a positive integer fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Pager<C> {
    source: C,
    limit: usize,
    page: usize,
}

impl<C: Cursor> Pager<C> {
    pub fn new(source: C, args: &Args) -> Self {
        Self::with_options(source, args, None, None)
    }

    /// Explicit `limit` and `page` take precedence over args.
    pub fn with_options(source: C, args: &Args, limit: Option<usize>, page: Option<usize>) -> Self {
        let limit = limit
            .filter(|v| *v > 0)
            .or_else(|| positive(args, "per_page"))
            .unwrap_or(DEFAULT_LIMIT);
        let page = page
            .filter(|v| *v > 0)
            .or_else(|| positive(args, "page"))
            .unwrap_or(DEFAULT_PAGE);
        Self {
            source,
            limit,
            page,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn total_count(&self) -> usize {
        self.source.count()
    }

    pub fn pages_count(&self) -> usize {
        self.total_count().div_ceil(self.limit)
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn cursor(&self) -> C {
        self.source.clone().limit(self.limit).offset(self.offset())
    }
}

fn positive(args: &Args, key: &str) -> Option<usize> {
    args.get_parsed::<usize>(key).filter(|v| *v > 0)
}

/// Cursor over a borrowed slice.
#[derive(Debug)]
pub struct SliceCursor<'a, T> {
    items: &'a [T],
    limit: Option<usize>,
    offset: usize,
}

impl<T> Clone for SliceCursor<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SliceCursor<'_, T> {}

impl<'a, T> SliceCursor<'a, T> {
    pub fn new(items: &'a [T]) -> Self {
        Self {
            items,
            limit: None,
            offset: 0,
        }
    }

    /// Items inside the current window.
    pub fn items(&self) -> &'a [T] {
        let start = self.offset.min(self.items.len());
        let end = match self.limit {
            Some(limit) => start.saturating_add(limit).min(self.items.len()),
            None => self.items.len(),
        };
        &self.items[start..end]
    }
}

impl<T> Cursor for SliceCursor<'_, T> {
    fn count(&self) -> usize {
        self.items.len()
    }

    fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}
