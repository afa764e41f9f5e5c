use serde::{Deserialize, Serialize};

/// Numeric job priority. Lower values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i16);

// Claim order: (priority asc, run_at asc, job_id asc)

impl JobPriority {
    /// Priority used when an enqueue request leaves it unset
    pub const DEFAULT: Self = Self(100);

    /// Most urgent priority
    pub const HIGHEST: Self = Self(i16::MIN);

    /// Least urgent priority
    pub const LOWEST: Self = Self(i16::MAX);

    pub fn get(self) -> i16 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i16> for JobPriority {
    fn from(value: i16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i16>()
            .map(Self)
            .map_err(|_| format!("Invalid priority: {}", s))
    }
}
