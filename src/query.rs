#![cfg(not(tarpaulin_include))]

//! Pagination and dynamic WHERE-clause helpers shared by the listing queries.
//!
//! Every helper appends `AND ...` fragments to a [`QueryBuilder`] whose base
//! query already ends in a `WHERE` clause, and every value is bound rather
//! than spliced into the SQL text.

use crate::error::{AppError, Result};
use crate::models::{ExecutionStatus, SessionUser, format_timestamp};
use chrono::{Duration, Months, NaiveDate, NaiveDateTime};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

/// A requested page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    /// Page numbers start at 1; anything lower is treated as the first page.
    pub fn new(page: Option<u32>, per_page: u32) -> Self {
        Pagination {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.max(1),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }

    pub fn info(&self, total_count: i64) -> PageInfo {
        let per_page = i64::from(self.per_page);
        let total_pages = if total_count > 0 {
            (total_count + per_page - 1) / per_page
        } else {
            1
        };
        PageInfo {
            total_count,
            total_pages,
            current_page: self.page,
            per_page: self.per_page,
        }
    }

    pub(crate) fn push_limit(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" LIMIT ");
        qb.push_bind(self.limit());
        qb.push(" OFFSET ");
        qb.push_bind(self.offset());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub total_count: i64,
    pub total_pages: i64,
    pub current_page: u32,
    pub per_page: u32,
}

/// One page of results together with its pagination block.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PageInfo,
}

/// Relative or explicit date window applied to `execution_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRange {
    Week,
    Month,
    Quarter,
    Year,
    /// Inclusive on both days.
    Custom { start: NaiveDate, end: NaiveDate },
}

impl DateRange {
    /// Parse the `date_range` query parameter.
    ///
    /// `custom` needs both `start_date` and `end_date` (`YYYY-MM-DD`).
    /// Unknown names and empty values yield `Ok(None)` so the filter is skipped.
    pub fn parse(
        range: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Option<DateRange>> {
        let range = match range.map(str::trim) {
            Some(r) if !r.is_empty() => r.to_lowercase(),
            _ => return Ok(None),
        };
        Ok(match range.as_str() {
            "week" => Some(DateRange::Week),
            "month" => Some(DateRange::Month),
            "quarter" => Some(DateRange::Quarter),
            "year" => Some(DateRange::Year),
            "custom" => match (start.and_then(non_blank), end.and_then(non_blank)) {
                (Some(start), Some(end)) => Some(DateRange::Custom {
                    start: parse_date(start)?,
                    end: parse_date(end)?,
                }),
                _ => None,
            },
            _ => None,
        })
    }

    /// Inclusive lower bound and exclusive upper bound relative to `now`.
    pub fn bounds(&self, now: NaiveDateTime) -> (NaiveDateTime, Option<NaiveDateTime>) {
        match self {
            DateRange::Week => (now - Duration::days(7), None),
            DateRange::Month => (months_before(now, 1), None),
            DateRange::Quarter => (months_before(now, 3), None),
            DateRange::Year => (months_before(now, 12), None),
            DateRange::Custom { start, end } => (
                start.and_hms_opt(0, 0, 0).unwrap_or_default(),
                end.succ_opt()
                    .and_then(|next| next.and_hms_opt(0, 0, 0)),
            ),
        }
    }
}

fn months_before(now: NaiveDateTime, months: u32) -> NaiveDateTime {
    now.checked_sub_months(Months::new(months))
        .unwrap_or(now - Duration::days(30 * i64::from(months)))
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Parse a `YYYY-MM-DD` query value.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::validation(format!("Invalid date '{}', expected YYYY-MM-DD", value)))
}

/// Value of an optional filter, unless it is blank or the catch-all `ALL`.
pub fn filter_value(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `AND column = ?` when a filter value is present.
pub fn push_eq(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, value: Option<&str>) {
    if let Some(value) = filter_value(value) {
        qb.push(format!(" AND {} = ", column));
        qb.push_bind(value);
    }
}

/// Case-insensitive `AND UPPER(column) = ?`.
pub fn push_eq_upper(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, value: Option<&str>) {
    if let Some(value) = filter_value(value) {
        qb.push(format!(" AND UPPER({}) = ", column));
        qb.push_bind(value.to_uppercase());
    }
}

/// `AND (c1 LIKE ? OR c2 LIKE ? ...)` for a free-text search term.
pub fn push_search(qb: &mut QueryBuilder<'_, Sqlite>, columns: &[&str], term: Option<&str>) {
    let Some(term) = term.and_then(non_blank) else {
        return;
    };
    let pattern = format!("%{}%", term);
    qb.push(" AND (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(format!("{} LIKE ", column));
        qb.push_bind(pattern.clone());
    }
    qb.push(")");
}

/// Status filter accepting one status or a comma separated list.
pub fn push_status(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, raw: Option<&str>) -> Result<()> {
    let Some(raw) = raw.and_then(non_blank) else {
        return Ok(());
    };
    let statuses = raw
        .split(',')
        .filter_map(non_blank)
        .map(|s| {
            ExecutionStatus::parse(s)
                .ok_or_else(|| AppError::validation(format!("Unknown status '{}'", s)))
        })
        .collect::<Result<Vec<_>>>()?;
    if statuses.is_empty() {
        return Ok(());
    }
    qb.push(format!(" AND {} IN (", column));
    let mut list = qb.separated(", ");
    for status in statuses {
        list.push_bind(status.as_str());
    }
    list.push_unseparated(")");
    Ok(())
}

/// Restrict `column` to the window described by `range`.
pub fn push_date_range(
    qb: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    range: Option<DateRange>,
    now: NaiveDateTime,
) {
    let Some(range) = range else {
        return;
    };
    let (since, until) = range.bounds(now);
    qb.push(format!(" AND {} >= ", column));
    qb.push_bind(format_timestamp(since));
    if let Some(until) = until {
        qb.push(format!(" AND {} < ", column));
        qb.push_bind(format_timestamp(until));
    }
}

/// Field agents only see rows in their own region, and their own state when
/// one is set on their account.
pub fn push_agent_scope(
    qb: &mut QueryBuilder<'_, Sqlite>,
    user: &SessionUser,
    region_column: &str,
    state_column: &str,
) {
    if !user.is_field_agent() {
        return;
    }
    push_eq(qb, region_column, user.region.as_deref());
    push_eq(qb, state_column, user.state.as_deref());
}
