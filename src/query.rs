use crate::domain::{Establishment, GeoFilter};
use crate::error::HarvestError;

pub const MAX_PER_PAGE: u32 = 200;

pub const RESULT_WINDOW: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageCursor {
    page: u32,
}

impl PageCursor {
    pub fn first() -> Self {
        Self { page: 1 }
    }

    pub fn at(page: u32) -> Self {
        Self { page: page.max(1) }
    }

    pub fn page(self) -> u32 {
        self.page
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page.saturating_add(1),
        }
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    params: Vec<(&'static str, String)>,
    page: u32,
    per_page: u32,
}

impl ObservationQuery {
    pub fn params(&self) -> &[(&'static str, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    filter: GeoFilter,
    per_page: u32,
}

impl QueryBuilder {
    pub fn new(filter: GeoFilter, per_page: u32) -> Result<Self, HarvestError> {
        if per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(HarvestError::InvalidFilter(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}, got {per_page}"
            )));
        }
        Ok(Self { filter, per_page })
    }

    pub fn filter(&self) -> &GeoFilter {
        &self.filter
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn max_pages(&self) -> u32 {
        RESULT_WINDOW.div_ceil(self.per_page)
    }

    pub fn build(&self, cursor: PageCursor) -> ObservationQuery {
        let filter = &self.filter;
        let mut params: Vec<(&'static str, String)> = vec![
            ("lat", filter.center.latitude.to_string()),
            ("lng", filter.center.longitude.to_string()),
            ("radius", filter.radius_km.to_string()),
            ("has_photos", "true".to_string()),
            ("identified", "true".to_string()),
            ("order", "desc".to_string()),
            ("order_by", "created_at".to_string()),
        ];

        if let Some(grade) = filter.quality_grade {
            params.push(("quality_grade", grade.as_str().to_string()));
        }
        if let Some(taxon) = filter.iconic_taxon {
            params.push(("iconic_taxa", taxon.name().to_string()));
        }
        if let Some(since) = filter.observed_on.since {
            params.push(("d1", since.format("%Y-%m-%d").to_string()));
        }
        if let Some(before) = filter.observed_on.before {
            params.push(("d2", before.format("%Y-%m-%d").to_string()));
        }
        if let Some(captive) = filter.captive {
            params.push(("captive", captive.to_string()));
        }
        match filter.establishment {
            Some(Establishment::Introduced) => params.push(("introduced", "true".to_string())),
            Some(Establishment::Native) => params.push(("native", "true".to_string())),
            None => {}
        }
        if filter.threatened {
            params.push(("threatened", "true".to_string()));
        }
        if filter.endemic {
            params.push(("endemic", "true".to_string()));
        }

        params.push(("per_page", self.per_page.to_string()));
        params.push(("page", cursor.page().to_string()));

        ObservationQuery {
            params,
            page: cursor.page(),
            per_page: self.per_page,
        }
    }
}
