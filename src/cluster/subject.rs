//! # Cluster subjects.
//!
//! A subject is `GAME_ID.REGION_ID.AREA_ID.KIND.INDEX`. The identity triple
//! comes from the environment; `INDEX = 0` is the broadcast subject for a
//! kind. No wildcards — only exact subjects and the broadcast index.

/// Process identity within the cluster address space.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub game_id: String,
    pub region_id: String,
    pub area_id: String,
}

impl Identity {
    /// Reads `GAME_ID`, `REGION_ID` and `AREA_ID`; each defaults to `"0"`.
    pub fn from_env() -> Self {
        Self {
            game_id: env_or("GAME_ID", "0"),
            region_id: env_or("REGION_ID", "0"),
            area_id: env_or("AREA_ID", "0"),
        }
    }

    /// Subject for a `(kind, index)` pair under this identity.
    pub fn subject(&self, kind: i64, index: i64) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.game_id, self.region_id, self.area_id, kind, index
        )
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_is_dot_separated() {
        let id = Identity {
            game_id: "7".to_string(),
            region_id: "3".to_string(),
            area_id: "1".to_string(),
        };
        assert_eq!(id.subject(5, 2), "7.3.1.5.2");
        assert_eq!(id.subject(5, 0), "7.3.1.5.0");
    }

    #[test]
    fn missing_env_defaults_to_zero() {
        assert_eq!(env_or("CHASSIS_TEST_UNSET_ENV_KEY", "0"), "0");
    }
}
