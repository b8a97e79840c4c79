//! Script catalog: the immutable list of scripts and their categories.

use crate::api::ScriptApi;
use crate::error::ApiError;
use crate::model::{Script, ScriptCategory, ScriptId};
use std::collections::BTreeMap;

/// Fixed category buckets; anything unrecognised lands in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CategoryBucket {
    DataCollection,
    Monitoring,
    Reporting,
    Maintenance,
    Troubleshooting,
    Other,
}

impl CategoryBucket {
    pub const ALL: [CategoryBucket; 6] = [
        CategoryBucket::DataCollection,
        CategoryBucket::Monitoring,
        CategoryBucket::Reporting,
        CategoryBucket::Maintenance,
        CategoryBucket::Troubleshooting,
        CategoryBucket::Other,
    ];

    pub fn of(category: &str) -> Self {
        match slugify(category).as_str() {
            "data-collection" => CategoryBucket::DataCollection,
            "monitoring" => CategoryBucket::Monitoring,
            "reporting" => CategoryBucket::Reporting,
            "maintenance" => CategoryBucket::Maintenance,
            "troubleshooting" => CategoryBucket::Troubleshooting,
            _ => CategoryBucket::Other,
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.slug() == slug)
    }

    pub fn slug(self) -> &'static str {
        match self {
            CategoryBucket::DataCollection => "data-collection",
            CategoryBucket::Monitoring => "monitoring",
            CategoryBucket::Reporting => "reporting",
            CategoryBucket::Maintenance => "maintenance",
            CategoryBucket::Troubleshooting => "troubleshooting",
            CategoryBucket::Other => "other",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            CategoryBucket::DataCollection => "Data Collection Scripts",
            CategoryBucket::Monitoring => "Monitoring & Health Scripts",
            CategoryBucket::Reporting => "Reporting Scripts",
            CategoryBucket::Maintenance => "Maintenance Scripts",
            CategoryBucket::Troubleshooting => "Troubleshooting Scripts",
            CategoryBucket::Other => "Other Scripts",
        }
    }
}

/// Lower-case and collapse whitespace runs to `-`.
pub fn slugify(category: &str) -> String {
    category
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scripts: Vec<Script>,
    categories: Vec<ScriptCategory>,
}

impl Catalog {
    pub fn new(scripts: Vec<Script>, categories: Vec<ScriptCategory>) -> Self {
        Self {
            scripts,
            categories,
        }
    }

    /// Fetch scripts and categories. A failed category fetch falls back to deriving them.
    pub async fn load(api: &dyn ScriptApi) -> Result<Self, ApiError> {
        let scripts = api.list_scripts().await?;
        let categories = match api.list_categories().await {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => derive_categories(&scripts),
            Err(e) => {
                tracing::warn!(error = %e, "category fetch failed, deriving from scripts");
                derive_categories(&scripts)
            }
        };
        tracing::debug!(
            scripts = scripts.len(),
            categories = categories.len(),
            "catalog loaded"
        );
        Ok(Self::new(scripts, categories))
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn categories(&self) -> &[ScriptCategory] {
        &self.categories
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn ids(&self) -> Vec<ScriptId> {
        self.scripts.iter().map(|s| s.id).collect()
    }

    pub fn find(&self, id: ScriptId) -> Option<&Script> {
        self.scripts.iter().find(|s| s.id == id)
    }

    pub fn display_name(&self, id: ScriptId) -> Option<&str> {
        self.find(id).map(|s| s.name.as_str())
    }

    pub fn in_bucket(&self, bucket: CategoryBucket) -> Vec<&Script> {
        self.scripts
            .iter()
            .filter(|s| CategoryBucket::of(&s.category) == bucket)
            .collect()
    }

    /// Case-insensitive match on name, description, or file.
    pub fn search(&self, query: &str) -> Vec<&Script> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return self.scripts.iter().collect();
        }
        self.scripts
            .iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&q)
                    || s.description.to_lowercase().contains(&q)
                    || s.file.to_lowercase().contains(&q)
            })
            .collect()
    }
}

pub fn derive_categories(scripts: &[Script]) -> Vec<ScriptCategory> {
    let mut by_slug: BTreeMap<String, ScriptCategory> = BTreeMap::new();
    for s in scripts {
        let slug = slugify(&s.category);
        by_slug
            .entry(slug.clone())
            .or_insert_with(|| ScriptCategory {
                id: slug,
                name: s.category.clone(),
                description: format!("{} scripts", s.category),
                icon: "folder".into(),
                color: "gray".into(),
                script_count: 0,
            })
            .script_count += 1;
    }
    by_slug.into_values().collect()
}
