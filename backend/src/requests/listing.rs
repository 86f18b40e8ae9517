//! Read-side filtering and ordering for request lists.

use std::cmp::Ordering;

use serde::Serialize;

use crate::error::AccessError;
use crate::requests::model::{ActionStatus, LearnerCreditRequest, RequestAction, RequestState};

/// A request joined with its most recent action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestRow {
    #[serde(flatten)]
    pub request: LearnerCreditRequest,
    pub latest_action: Option<RequestAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    /// requested < declined < cancelled < everything else
    State,
    Created,
    Updated,
    CoursePrice,
    LatestActionTime,
    LatestActionStatus,
    LatestActionType,
}

impl SortKey {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "state" => SortKey::State,
            "created" => SortKey::Created,
            "modified" | "updated" => SortKey::Updated,
            "course_price" => SortKey::CoursePrice,
            "latest_action_time" => SortKey::LatestActionTime,
            "latest_action_status" => SortKey::LatestActionStatus,
            "latest_action_type" => SortKey::LatestActionType,
            _ => return None,
        })
    }

    fn compare(&self, a: &RequestRow, b: &RequestRow) -> Ordering {
        fn latest(r: &RequestRow) -> Option<&RequestAction> {
            r.latest_action.as_ref()
        }
        match self {
            SortKey::State => a.request.state.sort_priority().cmp(&b.request.state.sort_priority()),
            SortKey::Created => a.request.created_at.cmp(&b.request.created_at),
            SortKey::Updated => a.request.updated_at.cmp(&b.request.updated_at),
            SortKey::CoursePrice => a.request.course_price.cmp(&b.request.course_price),
            SortKey::LatestActionTime => latest(a)
                .map(|x| x.created_at)
                .cmp(&latest(b).map(|x| x.created_at)),
            SortKey::LatestActionStatus => latest(a)
                .map(|x| x.status.as_str())
                .cmp(&latest(b).map(|x| x.status.as_str())),
            SortKey::LatestActionType => latest(a)
                .map(|x| x.recent_action.as_str())
                .cmp(&latest(b).map(|x| x.recent_action.as_str())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListQuery {
    pub states: Option<Vec<RequestState>>,
    pub latest_action_statuses: Option<Vec<ActionStatus>>,
    pub sort: SortKey,
    pub descending: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            states: None,
            latest_action_statuses: None,
            sort: SortKey::Created,
            descending: true,
        }
    }
}

fn parse_csv<T: std::str::FromStr<Err = String>>(raw: Option<&str>) -> Result<Option<Vec<T>>, AccessError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(AccessError::InvalidInput))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

impl ListQuery {
    /// `state` and `latest_action_status` are comma-delimited; `ordering`
    /// is a key with an optional `-` prefix for descending.
    pub fn parse(
        state: Option<&str>,
        latest_action_status: Option<&str>,
        ordering: Option<&str>,
    ) -> Result<Self, AccessError> {
        let mut query = ListQuery {
            states: parse_csv(state)?,
            latest_action_statuses: parse_csv(latest_action_status)?,
            ..Default::default()
        };

        if let Some(raw) = ordering.map(str::trim).filter(|s| !s.is_empty()) {
            let (descending, key) = match raw.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            query.sort = SortKey::parse(key)
                .ok_or_else(|| AccessError::InvalidInput(format!("unknown ordering: {key}")))?;
            query.descending = descending;
        }
        Ok(query)
    }

    pub fn matches(&self, row: &RequestRow) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&row.request.state) {
                return false;
            }
        }
        if let Some(statuses) = &self.latest_action_statuses {
            match &row.latest_action {
                Some(a) if statuses.contains(&a.status) => {}
                _ => return false,
            }
        }
        true
    }

    /// Filters, then sorts stably; ties fall back to newest first.
    pub fn apply(&self, rows: Vec<RequestRow>) -> Vec<RequestRow> {
        let mut rows: Vec<RequestRow> = rows.into_iter().filter(|r| self.matches(r)).collect();
        rows.sort_by(|a, b| {
            let primary = self.sort.compare(a, b);
            let primary = if self.descending { primary.reverse() } else { primary };
            primary.then_with(|| b.request.created_at.cmp(&a.request.created_at))
        });
        rows
    }
}
