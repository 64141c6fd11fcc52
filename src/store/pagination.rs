//! Dashboard pagination over an execution group's ordered summaries.

use serde::{Deserialize, Serialize};

use super::errors::PaginationError;
use crate::constants::dashboard::{EXECUTION_GROUP_PARAMETER, PAGINATION_FROM, PAGINATION_TO};

/// Half-open index range `[from, to)`; `to: None` means until the end
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub from: usize,
    pub to: Option<usize>,
}

impl Page {
    pub fn new(from: usize, to: usize) -> Result<Self, PaginationError> {
        if from > to {
            return Err(PaginationError::InvertedRange { from, to });
        }
        Ok(Self { from, to: Some(to) })
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Parse `from`/`to` query parameters; a missing `to` spans `page_size` entries
    pub fn from_query<'a, I>(params: I, page_size: usize) -> Result<Self, PaginationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut from = None;
        let mut to = None;
        for (key, value) in params {
            match key {
                PAGINATION_FROM => from = Some(parse_index(PAGINATION_FROM, value)?),
                PAGINATION_TO => to = Some(parse_index(PAGINATION_TO, value)?),
                _ => {}
            }
        }

        let from = from.unwrap_or(0);
        let to = to.unwrap_or_else(|| from.saturating_add(page_size));
        Self::new(from, to)
    }

    /// Select the page from an ordered list, clamped to its length
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let end = self.to.unwrap_or(items.len()).min(items.len());
        if self.from >= end {
            return Vec::new();
        }
        items
            .into_iter()
            .skip(self.from)
            .take(end - self.from)
            .collect()
    }
}

fn parse_index(parameter: &'static str, value: &str) -> Result<usize, PaginationError> {
    value
        .trim()
        .parse()
        .map_err(|_| PaginationError::InvalidIndex {
            parameter,
            value: value.to_string(),
        })
}

/// A dashboard listing request for one execution group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardQuery {
    pub execution_group: String,
    pub page: Page,
}

impl DashboardQuery {
    /// Parse `runID`, `from` and `to` query parameters
    pub fn parse<'a, I>(params: I, page_size: usize) -> Result<Self, PaginationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
    {
        let execution_group = params
            .clone()
            .into_iter()
            .find(|(key, value)| *key == EXECUTION_GROUP_PARAMETER && !value.is_empty())
            .map(|(_, value)| value.to_string())
            .ok_or(PaginationError::MissingParameter(EXECUTION_GROUP_PARAMETER))?;

        Ok(Self {
            execution_group,
            page: Page::from_query(params, page_size)?,
        })
    }
}
