use serde::{Deserialize, Serialize};

/// Knobs shared by the planner and executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Upper bound on physical queries produced by one select.
    pub max_subqueries: usize,
    /// Worker threads used to fan out a multi-query.
    pub max_parallelism: usize,
    /// Whether unique lookups consult the entity cache first.
    pub use_unique_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_subqueries: 30,
            max_parallelism: 8,
            use_unique_cache: true,
        }
    }
}

impl QueryOptions {
    /// Parses options from TOML; omitted keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Sets [`QueryOptions::max_subqueries`].
    pub fn with_max_subqueries(mut self, max: usize) -> Self {
        self.max_subqueries = max;
        self
    }

    /// Sets [`QueryOptions::max_parallelism`]; zero is treated as one.
    pub fn with_max_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = workers.max(1);
        self
    }

    /// Sets [`QueryOptions::use_unique_cache`].
    pub fn with_unique_cache(mut self, enabled: bool) -> Self {
        self.use_unique_cache = enabled;
        self
    }
}
