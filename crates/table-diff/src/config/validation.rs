//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::core::identifier::{validate_identifier, TablePath};
use crate::core::range::{KeyRange, TimeRange};
use crate::drivers::DialectImpl;
use crate::error::{DiffError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_side("source", &config.source)?;
    validate_side("target", &config.target)?;

    let diff = &config.diff;
    if diff.key_column.is_empty() {
        return Err(DiffError::Config("diff.key_column is required".into()));
    }
    validate_identifier(&diff.key_column)?;
    for column in diff.update_column.iter().chain(&diff.extra_columns) {
        validate_identifier(column)?;
        if *column == diff.key_column {
            return Err(DiffError::Config(format!(
                "diff.key_column \"{}\" cannot also be a compared column",
                column
            )));
        }
    }

    if diff.bisection_factor < 2 {
        return Err(DiffError::Config(format!(
            "diff.bisection_factor must be at least 2, got {}",
            diff.bisection_factor
        )));
    }
    if diff.bisection_threshold < 1 {
        return Err(DiffError::Config(
            "diff.bisection_threshold must be at least 1".into(),
        ));
    }
    if let Some(0) = diff.max_workers {
        return Err(DiffError::Config(
            "diff.max_workers must be at least 1".into(),
        ));
    }

    KeyRange::new(diff.start_key.clone(), diff.end_key.clone())
        .map_err(|e| DiffError::Config(format!("diff.start_key/end_key: {}", e)))?;
    TimeRange::new(diff.min_time, diff.max_time)
        .map_err(|e| DiffError::Config(format!("diff.min_time/max_time: {}", e)))?;
    if (diff.min_time.is_some() || diff.max_time.is_some()) && diff.update_column.is_none() {
        return Err(DiffError::Config(
            "diff.min_time/max_time require diff.update_column".into(),
        ));
    }

    Ok(())
}

fn validate_side(name: &str, side: &DatabaseConfig) -> Result<()> {
    if side.uri.is_empty() {
        return Err(DiffError::Config(format!("{}.uri is required", name)));
    }
    DialectImpl::from_uri(&side.uri)?;
    if side.table.is_empty() {
        return Err(DiffError::Config(format!("{}.table is required", name)));
    }
    TablePath::parse(&side.table)?;
    if let Some(0) = side.max_connections {
        return Err(DiffError::Config(format!(
            "{}.max_connections must be at least 1",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffSettings;
    use crate::core::value::DbKey;

    fn valid_config() -> Config {
        Config {
            source: DatabaseConfig {
                uri: "postgres://user:pw@localhost:5432/app".to_string(),
                table: "public.ratings".to_string(),
                max_connections: Some(4),
            },
            target: DatabaseConfig {
                uri: "mysql://user:pw@localhost:3306/app".to_string(),
                table: "ratings".to_string(),
                max_connections: None,
            },
            diff: DiffSettings {
                update_column: Some("updated_at".to_string()),
                extra_columns: vec!["rating".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_uri() {
        let mut config = valid_config();
        config.source.uri = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_scheme() {
        let mut config = valid_config();
        config.target.uri = "sqlserver://localhost/app".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_table() {
        let mut config = valid_config();
        config.target.table = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_connections() {
        let mut config = valid_config();
        config.source.max_connections = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_key_column() {
        let mut config = valid_config();
        config.diff.key_column = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_key_column_among_compared() {
        let mut config = valid_config();
        config.diff.extra_columns.push("id".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bisection_bounds() {
        let mut config = valid_config();
        config.diff.bisection_factor = 1;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.diff.bisection_threshold = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.diff.max_workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_inverted_key_range() {
        let mut config = valid_config();
        config.diff.start_key = Some(DbKey::Int(10));
        config.diff.end_key = Some(DbKey::Int(10));
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, DiffError::Config(_)));
    }

    #[test]
    fn test_inverted_time_range() {
        let mut config = valid_config();
        let day = chrono::NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        config.diff.min_time = day.and_hms_opt(1, 0, 0);
        config.diff.max_time = day.and_hms_opt(0, 0, 0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_time_range_without_update_column() {
        let mut config = valid_config();
        config.diff.update_column = None;
        config.diff.min_time = chrono::NaiveDate::from_ymd_opt(2022, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0);
        assert!(validate(&config).is_err());
    }
}
