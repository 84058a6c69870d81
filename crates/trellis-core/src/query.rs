// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query & paging engine.
//!
//! Pipeline: candidate selection by type and filters, `read` visibility,
//! hidden/deleted filtering, stable null-first sort, then windowing by page
//! number or `offsetId`. `raw_count` is the size of the list after the two
//! filters and before windowing.
use std::cmp::Ordering;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::{ObjectId, TypeName};
use crate::permission::PermissionResolver;
use crate::record::NodeRecord;
use crate::schema::Schema;
use crate::security::{AccessMode, Permission, SecurityContext};
use crate::value::{compare_nullable, Value};

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// How loose-text filters compare strings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatch {
    /// Whole value, case-sensitive.
    #[default]
    Exact,
    /// Case-insensitive substring.
    Substring,
}

/// A candidate filter.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Property equals the value (numbers compare across kinds).
    Equals {
        /// Property key.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// Property lies in the inclusive range; an open bound is `None`.
    Range {
        /// Property key.
        key: String,
        /// Lower bound.
        min: Option<Value>,
        /// Upper bound.
        max: Option<Value>,
    },
    /// Text match; `mode: None` uses the query's default.
    Text {
        /// Property key.
        key: String,
        /// Text to look for.
        needle: String,
        /// Explicit mode.
        mode: Option<TextMatch>,
    },
    /// Within `radius_km` of a point, using numeric latitude/longitude properties.
    GeoDistance {
        /// Latitude property key.
        lat_key: String,
        /// Longitude property key.
        lon_key: String,
        /// Centre latitude in degrees.
        lat: f64,
        /// Centre longitude in degrees.
        lon: f64,
        /// Radius in kilometres.
        radius_km: f64,
    },
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = p2 - p1;
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

impl Filter {
    fn matches(&self, node: &NodeRecord, default_text: TextMatch) -> bool {
        match self {
            Self::Equals { key, value } => node
                .value_of(key)
                .is_some_and(|v| v.compare(value) == Ordering::Equal),
            Self::Range { key, min, max } => node.value_of(key).is_some_and(|v| {
                min.as_ref().is_none_or(|m| v.compare(m) != Ordering::Less)
                    && max.as_ref().is_none_or(|m| v.compare(m) != Ordering::Greater)
            }),
            Self::Text { key, needle, mode } => {
                let Some(value) = node.value_of(key) else {
                    return false;
                };
                let Some(text) = value.as_str() else {
                    return false;
                };
                match mode.unwrap_or(default_text) {
                    TextMatch::Exact => text == needle,
                    TextMatch::Substring => text.to_lowercase().contains(&needle.to_lowercase()),
                }
            }
            Self::GeoDistance {
                lat_key,
                lon_key,
                lat,
                lon,
                radius_km,
            } => {
                let point = node
                    .property(lat_key)
                    .and_then(Value::as_f64)
                    .zip(node.property(lon_key).and_then(Value::as_f64));
                point.is_some_and(|(plat, plon)| haversine_km(*lat, *lon, plat, plon) <= *radius_km)
            }
        }
    }
}

/// A paged, sorted, filtered view over one node type.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    ty: TypeName,
    include_subtypes: bool,
    filters: Vec<Filter>,
    sort_key: Option<String>,
    descending: bool,
    page: i64,
    page_size: i64,
    offset_id: Option<ObjectId>,
    include_hidden: Option<bool>,
    include_deleted: bool,
    text_match: TextMatch,
}

impl Query {
    /// Query for `ty` (subtypes included), first page of 20, unsorted.
    pub fn new(ty: impl Into<TypeName>) -> Self {
        Self {
            ty: ty.into(),
            include_subtypes: true,
            filters: Vec::new(),
            sort_key: None,
            descending: false,
            page: 1,
            page_size: 20,
            offset_id: None,
            include_hidden: None,
            include_deleted: false,
            text_match: TextMatch::Exact,
        }
    }

    /// Whether subtypes of the queried type are candidates.
    #[must_use]
    pub fn include_subtypes(mut self, yes: bool) -> Self {
        self.include_subtypes = yes;
        self
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds an equality filter.
    #[must_use]
    pub fn eq(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Equals {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Adds an inclusive range filter.
    #[must_use]
    pub fn range(self, key: impl Into<String>, min: Option<Value>, max: Option<Value>) -> Self {
        self.filter(Filter::Range {
            key: key.into(),
            min,
            max,
        })
    }

    /// Adds a text filter using the query's default matching.
    #[must_use]
    pub fn text(self, key: impl Into<String>, needle: impl Into<String>) -> Self {
        self.filter(Filter::Text {
            key: key.into(),
            needle: needle.into(),
            mode: None,
        })
    }

    /// Adds a geo-distance filter.
    #[must_use]
    pub fn near(
        self,
        lat_key: impl Into<String>,
        lon_key: impl Into<String>,
        (lat, lon): (f64, f64),
        radius_km: f64,
    ) -> Self {
        self.filter(Filter::GeoDistance {
            lat_key: lat_key.into(),
            lon_key: lon_key.into(),
            lat,
            lon,
            radius_km,
        })
    }

    /// Sorts ascending by `key`.
    #[must_use]
    pub fn sort(mut self, key: impl Into<String>) -> Self {
        self.sort_key = Some(key.into());
        self.descending = false;
        self
    }

    /// Sorts descending by `key`.
    #[must_use]
    pub fn sort_desc(mut self, key: impl Into<String>) -> Self {
        self.sort_key = Some(key.into());
        self.descending = true;
        self
    }

    /// 1-based page; negative counts from the end, zero is empty.
    #[must_use]
    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    /// Page size; zero or negative yields empty pages.
    #[must_use]
    pub fn page_size(mut self, size: i64) -> Self {
        self.page_size = size;
        self
    }

    /// Starts the page at this object instead of at a page number.
    #[must_use]
    pub fn offset_id(mut self, id: ObjectId) -> Self {
        self.offset_id = Some(id);
        self
    }

    /// Overrides the mode-dependent default for hidden objects.
    #[must_use]
    pub fn include_hidden(mut self, yes: bool) -> Self {
        self.include_hidden = Some(yes);
        self
    }

    /// Keeps soft-deleted objects.
    #[must_use]
    pub fn include_deleted(mut self, yes: bool) -> Self {
        self.include_deleted = yes;
        self
    }

    /// Default matching of text filters.
    #[must_use]
    pub fn text_match(mut self, mode: TextMatch) -> Self {
        self.text_match = mode;
        self
    }

    /// Queried type.
    pub fn type_name(&self) -> &TypeName {
        &self.ty
    }
}

/// One page of results.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    /// The returned slice.
    pub items: Vec<NodeRecord>,
    /// Visible matches before paging.
    pub raw_count: usize,
    /// Requested page.
    pub page: i64,
    /// Requested page size.
    pub page_size: i64,
}

impl QueryResult {
    /// Number of pages of `page_size` needed for `raw_count`.
    pub fn page_count(&self) -> usize {
        match usize::try_from(self.page_size) {
            Ok(size) if size > 0 => self.raw_count.div_ceil(size),
            _ => 0,
        }
    }

    /// Ids of the returned items.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.items.iter().map(|n| n.id).collect()
    }
}

/// Slice bounds for a page over `len` sorted items.
pub fn window(len: usize, page: i64, size: i64) -> Range<usize> {
    if page == 0 || size <= 0 {
        return 0..0;
    }
    let n = len as i128;
    let (page, size) = (i128::from(page), i128::from(size));
    let (start, end) = if page > 0 {
        let start = (page - 1) * size;
        (start, start + size)
    } else {
        let start = n + page * size;
        if start < 0 {
            (0, size)
        } else {
            (start, n + (page + 1) * size)
        }
    };
    let clamp = |v: i128| v.clamp(0, n) as usize;
    clamp(start)..clamp(end)
}

/// Runs `query` against `store` on behalf of `ctx`.
///
/// # Errors
/// [`GraphError::NotFound`] when the `offsetId` is not among the visible
/// results.
pub fn execute(
    schema: &Schema,
    store: &GraphStore,
    ctx: &SecurityContext,
    query: &Query,
) -> Result<QueryResult, GraphError> {
    let types = if query.include_subtypes {
        let mut types = schema.subtypes_of(query.ty.as_str());
        if types.is_empty() {
            types.push(query.ty.clone());
        }
        types
    } else {
        vec![query.ty.clone()]
    };
    let mut candidates: Vec<&NodeRecord> = types
        .iter()
        .flat_map(|ty| store.nodes_of_type(ty))
        .filter(|n| query.filters.iter().all(|f| f.matches(n, query.text_match)))
        .collect();
    candidates.sort_by_key(|n| n.id);

    let resolver = PermissionResolver::new(ctx, store);
    let include_hidden = query
        .include_hidden
        .unwrap_or(ctx.mode() != AccessMode::Frontend);
    let mut visible: Vec<(Option<Value>, &NodeRecord)> = candidates
        .into_iter()
        .filter(|n| resolver.is_allowed(n.id, Permission::Read))
        .filter(|n| include_hidden || !n.is_hidden())
        .filter(|n| query.include_deleted || !n.is_deleted())
        .map(|n| (query.sort_key.as_ref().and_then(|k| n.value_of(k)), n))
        .collect();
    let raw_count = visible.len();

    if query.sort_key.is_some() {
        visible.sort_by(|(a, _), (b, _)| {
            let ord = compare_nullable(a.as_ref(), b.as_ref());
            if query.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    let range = if let Some(offset) = query.offset_id {
        let start = visible
            .iter()
            .position(|(_, n)| n.id == offset)
            .ok_or_else(|| GraphError::not_found(format!("offsetId {offset}")))?;
        let size = usize::try_from(query.page_size).unwrap_or(0);
        start..start.saturating_add(size).min(raw_count)
    } else {
        window(raw_count, query.page, query.page_size)
    };
    trace!(ty = %query.ty, raw_count, ?range, "query executed");
    Ok(QueryResult {
        items: visible[range].iter().map(|(_, n)| (*n).clone()).collect(),
        raw_count,
        page: query.page,
        page_size: query.page_size,
    })
}
