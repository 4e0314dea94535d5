//! Label rewriting rules
//!
//! Rules follow the `relabel_config` shape used by Prometheus-compatible
//! tooling:
//!
//! ```yaml
//! - source_labels: [namespace]
//!   target_label: __meta_ext_labels
//!   replacement: tenant
//! - action: labeldrop
//!   regex: pod_template_hash
//! ```
//!
//! Supported actions: `replace`, `keep`, `drop`, `hashmod`, `labelmap`,
//! `labeldrop`, `labelkeep`, `lowercase`, `uppercase`.

use crate::{Labels, Result, SplitError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rewrites a label set and decides whether the owner is kept
pub trait Relabeler: Send + Sync {
    /// Returns the rewritten labels and `false` if the owner must be dropped
    fn process(&self, labels: &Labels) -> (Labels, bool);
}

/// Relabel action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Replace,
    Keep,
    Drop,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
    Lowercase,
    Uppercase,
}

/// One rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub target_label: String,
    pub regex: String,
    pub modulus: u64,
    pub replacement: String,
    pub action: Action,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            target_label: String::new(),
            regex: "(.*)".to_string(),
            modulus: 0,
            replacement: "$1".to_string(),
            action: Action::Replace,
        }
    }
}

struct Rule {
    config: RelabelConfig,
    regex: Regex,
}

/// Validated, compiled rule list. An empty list keeps everything unchanged.
#[derive(Default)]
pub struct RelabelRules {
    rules: Vec<Rule>,
}

impl RelabelRules {
    /// Compile and validate rules
    pub fn new(configs: Vec<RelabelConfig>) -> Result<Self> {
        let rules = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| compile(config).map_err(|e| rule_error(i, e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Parse a YAML rule list; empty content means no rules
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let configs: Option<Vec<RelabelConfig>> = serde_yaml::from_str(content)
            .map_err(|e| SplitError::Config(format!("parse relabel configuration: {}", e)))?;
        Self::new(configs.unwrap_or_default())
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if there are no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the rules to a plain label map, as carried in block metadata.
    ///
    /// Returns `None` if the rules drop it.
    pub fn process_map(&self, labels: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
        match self.process(&Labels::from_map(labels)) {
            (labels, true) => Some(labels.to_map()),
            (_, false) => None,
        }
    }
}

impl Relabeler for RelabelRules {
    fn process(&self, labels: &Labels) -> (Labels, bool) {
        if self.rules.is_empty() {
            return (labels.clone(), true);
        }

        let mut map = labels.to_map();
        for rule in &self.rules {
            if !rule.apply(&mut map) {
                return (Labels::new(), false);
            }
        }
        map.retain(|_, v| !v.is_empty());
        (Labels::from_map(&map), true)
    }
}

impl Rule {
    fn source_value(&self, map: &BTreeMap<String, String>) -> String {
        self.config
            .source_labels
            .iter()
            .map(|n| map.get(n).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.config.separator)
    }

    /// Returns false when the labels are dropped
    fn apply(&self, map: &mut BTreeMap<String, String>) -> bool {
        let cfg = &self.config;
        match cfg.action {
            Action::Keep => self.regex.is_match(&self.source_value(map)),
            Action::Drop => !self.regex.is_match(&self.source_value(map)),
            Action::Replace => {
                let value = self.source_value(map);
                let Some(caps) = self.regex.captures(&value) else {
                    return true;
                };
                let mut target = String::new();
                caps.expand(&cfg.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }
                let mut result = String::new();
                caps.expand(&cfg.replacement, &mut result);
                if result.is_empty() {
                    map.remove(&target);
                } else {
                    map.insert(target, result);
                }
                true
            }
            Action::Lowercase => {
                let value = self.source_value(map).to_lowercase();
                map.insert(cfg.target_label.clone(), value);
                true
            }
            Action::Uppercase => {
                let value = self.source_value(map).to_uppercase();
                map.insert(cfg.target_label.clone(), value);
                true
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = map
                    .iter()
                    .filter(|(name, _)| self.regex.is_match(name))
                    .map(|(name, value)| {
                        let name = self.regex.replace(name, cfg.replacement.as_str()).into_owned();
                        (name, value.clone())
                    })
                    .collect();
                map.extend(mapped);
                true
            }
            Action::LabelDrop => {
                map.retain(|name, _| !self.regex.is_match(name));
                true
            }
            Action::LabelKeep => {
                map.retain(|name, _| self.regex.is_match(name));
                true
            }
            Action::HashMod => {
                let value = hash_mod(&self.source_value(map), cfg.modulus);
                map.insert(cfg.target_label.clone(), value.to_string());
                true
            }
        }
    }
}

fn compile(config: RelabelConfig) -> Result<Rule> {
    let regex = Regex::new(&format!("^(?:{})$", config.regex))
        .map_err(|e| SplitError::Config(format!("invalid regex {:?}: {}", config.regex, e)))?;

    match config.action {
        Action::Replace | Action::Lowercase | Action::Uppercase if config.target_label.is_empty() => {
            return Err(SplitError::Config(format!(
                "relabel action {:?} requires target_label",
                config.action
            )));
        }
        Action::Lowercase | Action::Uppercase if !is_valid_label_name(&config.target_label) => {
            return Err(SplitError::Config(format!(
                "invalid target_label {:?}",
                config.target_label
            )));
        }
        Action::LabelDrop | Action::LabelKeep
            if !config.source_labels.is_empty() || !config.target_label.is_empty() =>
        {
            return Err(SplitError::Config(format!(
                "relabel action {:?} takes neither source_labels nor target_label",
                config.action
            )));
        }
        Action::HashMod if !is_valid_label_name(&config.target_label) => {
            return Err(SplitError::Config(format!(
                "hashmod requires a valid target_label, got {:?}",
                config.target_label
            )));
        }
        Action::HashMod if config.modulus == 0 => {
            return Err(SplitError::Config("hashmod requires a positive modulus".into()));
        }
        _ => {}
    }

    Ok(Rule { config, regex })
}

/// Lower 64 bits of the MD5 digest, big endian, modulo `modulus`
fn hash_mod(value: &str, modulus: u64) -> u64 {
    let digest = md5::compute(value.as_bytes()).0;
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[8..]);
    u64::from_be_bytes(low) % modulus
}

fn rule_error(index: usize, err: SplitError) -> SplitError {
    match err {
        SplitError::Config(msg) => SplitError::Config(format!("relabel rule {}: {}", index, msg)),
        other => other,
    }
}

/// Check `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(yaml: &str) -> RelabelRules {
        RelabelRules::from_yaml(yaml).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_empty_rules_keep_everything() {
        let input = labels(&[("__name__", "up"), ("job", "api")]);
        for yaml in ["", "[]", "~"] {
            assert_eq!(rules(yaml).process(&input), (input.clone(), true));
        }
    }

    #[test]
    fn test_replace_sets_ext_labels() {
        let r = rules(
            r#"
- source_labels: [namespace]
  regex: "team-(.+)"
  target_label: tenant
- target_label: __meta_ext_labels
  replacement: tenant
"#,
        );
        let (out, keep) = r.process(&labels(&[("__name__", "cpu"), ("namespace", "team-a")]));
        assert!(keep);
        assert_eq!(out.get("tenant"), Some("a"));
        assert_eq!(out.get("__meta_ext_labels"), Some("tenant"));

        // Regex does not match: the rule is a no-op
        let (out, _) = r.process(&labels(&[("__name__", "cpu"), ("namespace", "infra")]));
        assert_eq!(out.get("tenant"), None);
    }

    #[test]
    fn test_replace_with_empty_result_removes_label() {
        let r = rules("- source_labels: [missing]\n  target_label: job\n");
        let (out, keep) = r.process(&labels(&[("job", "api"), ("x", "1")]));
        assert!(keep);
        assert_eq!(out, labels(&[("x", "1")]));
    }

    #[test]
    fn test_keep_and_drop() {
        let keep = rules("- source_labels: [env]\n  regex: prod\n  action: keep\n");
        assert!(keep.process(&labels(&[("env", "prod")])).1);
        assert!(!keep.process(&labels(&[("env", "production")])).1);

        let drop = rules("- source_labels: [__name__, env]\n  regex: 'up;dev'\n  action: drop\n");
        assert!(!drop.process(&labels(&[("__name__", "up"), ("env", "dev")])).1);
        assert!(drop.process(&labels(&[("__name__", "up"), ("env", "prod")])).1);
    }

    #[test]
    fn test_label_actions() {
        let r = rules(
            r#"
- action: labelmap
  regex: "__meta_k8s_(.+)"
- action: labeldrop
  regex: "__meta_.*"
- source_labels: [pod]
  target_label: pod_upper
  action: uppercase
"#,
        );
        let (out, _) = r.process(&labels(&[
            ("__meta_k8s_pod", "web-1"),
            ("__name__", "up"),
        ]));
        assert_eq!(out, labels(&[("__name__", "up"), ("pod", "web-1"), ("pod_upper", "WEB-1")]));

        let keep = rules("- action: labelkeep\n  regex: '__name__|job'\n");
        let (out, _) = keep.process(&labels(&[("__name__", "up"), ("job", "a"), ("x", "y")]));
        assert_eq!(out, labels(&[("__name__", "up"), ("job", "a")]));
    }

    #[test]
    fn test_hashmod_shards_by_digest() {
        // md5("a") ends in 0x61, md5("") ends in 0x7e
        let r = rules("- source_labels: [pod]\n  target_label: shard\n  modulus: 256\n  action: hashmod\n");
        let (out, _) = r.process(&labels(&[("pod", "a")]));
        assert_eq!(out.get("shard"), Some("97"));
        let (out, _) = r.process(&labels(&[("job", "x")]));
        assert_eq!(out.get("shard"), Some("126"));

        let r = rules("- source_labels: [pod]\n  target_label: shard\n  modulus: 3\n  action: hashmod\n");
        for pod in ["web-0", "web-1", "db-0"] {
            let input = labels(&[("pod", pod)]);
            let shard: u64 = r.process(&input).0.get("shard").unwrap().parse().unwrap();
            assert!(shard < 3);
            assert_eq!(r.process(&input), r.process(&input));
        }
    }

    #[test]
    fn test_invalid_configs() {
        for yaml in [
            "- action: hashmod\n  source_labels: [a]\n  target_label: x\n",
            "- action: hashmod\n  source_labels: [a]\n  modulus: 4\n",
            "- action: replace\n",
            "- action: lowercase\n  target_label: '1bad'\n",
            "- action: labeldrop\n  source_labels: [a]\n",
            "- regex: '('\n  target_label: x\n",
            "- action: explode\n",
            "- unknown_field: 1\n",
            "not a list",
        ] {
            let err = RelabelRules::from_yaml(yaml).err().unwrap();
            assert!(err.is_config(), "{}: {}", yaml, err);
        }
    }

    #[test]
    fn test_process_map_for_meta_labels() {
        let r = rules("- source_labels: [replica]\n  regex: '.+'\n  action: drop\n");
        let meta = BTreeMap::from([("cluster".to_string(), "c1".to_string())]);
        assert_eq!(r.process_map(&meta), Some(meta.clone()));

        let mut replica = meta.clone();
        replica.insert("replica".into(), "1".into());
        assert_eq!(r.process_map(&replica), None);
    }

    #[test]
    fn test_valid_label_names() {
        assert!(is_valid_label_name("_a1"));
        assert!(is_valid_label_name("__name__"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("1a"));
        assert!(!is_valid_label_name("a-b"));
    }
}
