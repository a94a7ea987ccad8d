use serde::{Deserialize, Deserializer};

/// Deserializes a `Vec<String>` from either a real sequence or a single
/// comma-separated string. Env-var providers hand everything over as one
/// string, so `FLOWLINE_LOG_LEVEL="info,flowline=debug"` must parse the
/// same as the TOML list form.
pub fn deserialize_vec_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<String>),
        One(String),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}
