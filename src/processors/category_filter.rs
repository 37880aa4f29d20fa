use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use super::{Outcome, TransformUnit};
use crate::config::CategoryFilterConfig;
use crate::record::{str_at, EventRecord, Lookup};

/// Keeps or drops a record by one string field checked against an include
/// list and an exclude list.
///
/// A missing or non-string field always passes. When the include list is
/// non-empty it decides alone for values outside it.
pub struct CategoryFilter {
    field: String,
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl CategoryFilter {
    pub const NAME: &'static str = "category_filter";

    pub fn new(config: &CategoryFilterConfig) -> Self {
        Self {
            field: config.field.clone(),
            include: config.include.iter().cloned().collect(),
            exclude: config.exclude.iter().cloned().collect(),
        }
    }

    pub fn keeps(&self, value: &str) -> bool {
        if !self.include.is_empty() && !self.include.contains(value) {
            return false;
        }
        !self.exclude.contains(value)
    }
}

#[async_trait]
impl TransformUnit for CategoryFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, record: &mut EventRecord) -> Outcome {
        let body = match record.object(Self::NAME) {
            Ok(body) => body,
            Err(e) => return Outcome::Fail(e),
        };

        match str_at(body, &self.field) {
            Lookup::Found(value) if !self.keeps(value) => {
                debug!("Dropping record {}: {}={}", record.id, self.field, value);
                Outcome::Drop
            }
            _ => Outcome::Continue,
        }
    }
}
