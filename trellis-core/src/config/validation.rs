use std::collections::HashSet;

use crate::config::schema::{topics, Config, StorageBackendKind};
use crate::error::{Error, Result};

pub fn validate_config(config: &Config) -> Result<()> {
    if config.environment.trim().is_empty() {
        return Err(Error::Validation("environment cannot be empty".to_owned()));
    }

    let mut topic_names = HashSet::new();
    for key in topics::ALL {
        let Some(topic) = config.topics.get(key) else {
            return Err(Error::Validation(format!("topic '{key}' is not configured")));
        };
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(Error::Validation(format!("topic '{key}' cannot be empty")));
        }
        if !topic_names.insert(topic.to_owned()) {
            return Err(Error::Validation(format!(
                "topic name '{topic}' is used for more than one key"
            )));
        }
    }

    if config.storage.backend == StorageBackendKind::Sqlite {
        if config.storage.pool_size == 0 {
            return Err(Error::Validation(
                "storage.pool_size must be at least 1".to_owned(),
            ));
        }
        if config.storage.connection_string.trim().is_empty() {
            return Err(Error::Validation(
                "storage.connection_string cannot be empty".to_owned(),
            ));
        }
    }

    if config.backend.timeout_seconds == 0 {
        return Err(Error::Validation(
            "backend.timeout_seconds must be at least 1".to_owned(),
        ));
    }

    let mut trigger_names = HashSet::new();
    let names = config
        .rules
        .iter()
        .map(|rule| ("rule", rule.name.as_str()))
        .chain(config.launches.iter().map(|rule| ("launch", rule.name.as_str())))
        .chain(config.requeue.iter().map(|rule| ("requeue", rule.name.as_str())));
    for (kind, name) in names {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation(format!("{kind} name cannot be empty")));
        }
        if !trigger_names.insert(name.to_owned()) {
            return Err(Error::Validation(format!("duplicate trigger name '{name}'")));
        }
    }

    for rule in &config.rules {
        if !config.topics.contains_key(&rule.publish_to) {
            return Err(Error::Validation(format!(
                "rule '{}' publishes to unknown topic key '{}'",
                rule.name, rule.publish_to
            )));
        }
    }

    for rule in &config.requeue {
        if rule.header_labels.is_empty() {
            return Err(Error::Validation(format!(
                "requeue rule '{}' must name at least one header label",
                rule.name
            )));
        }
    }

    let mut task_names = HashSet::new();
    for task in &config.tasks {
        let name = task.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("task name cannot be empty".to_owned()));
        }
        if !task_names.insert(name.to_owned()) {
            return Err(Error::Validation(format!("duplicate task name '{name}'")));
        }
    }

    for rule in &config.launches {
        if rule.task.trim().is_empty() {
            return Err(Error::Validation(format!(
                "launch rule '{}' does not name a task",
                rule.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_config;
    use crate::config::schema::{topics, Config, StorageBackendKind};
    use crate::graph::labels::LabelSet;
    use crate::triggers::launch::LaunchRule;
    use crate::triggers::requeue::RequeueRule;
    use crate::triggers::rules::{RuleAction, RuleDefinition};
    use crate::triggers::template::PatternTemplate;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.rules.push(RuleDefinition::new(
            "match-fastqs",
            RuleAction::Match {
                pattern: PatternTemplate::labelled(&["Fastq"]),
            },
        ));
        config.requeue.push(RequeueRule::new("requeue-match", &["Match"]));
        config
    }

    #[test]
    fn accepts_minimal_valid_config() {
        assert!(validate_config(&Config::default()).is_ok());
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_missing_or_shared_topics() {
        let mut config = valid_config();
        config.topics.remove(topics::KILL);
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.topics.insert(topics::KILL.to_owned(), "db-query".to_owned());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_duplicate_trigger_names_across_tables() {
        let mut config = valid_config();
        config.launches.push(LaunchRule::on_node("match-fastqs", "fastqc"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_rule_with_unknown_publish_key() {
        let mut config = valid_config();
        config.rules[0].publish_to = "nowhere".to_owned();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_requeue_without_labels() {
        let mut config = valid_config();
        config.requeue[0].header_labels = LabelSet::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_pool_for_sqlite() {
        let mut config = valid_config();
        config.storage.backend = StorageBackendKind::Sqlite;
        config.storage.pool_size = 0;
        assert!(validate_config(&config).is_err());
    }
}
