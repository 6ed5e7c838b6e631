//! Bypass rule files: `<pattern> <mode>[,tag=<tag>][,resolver=<name>][,resolve_strategy=<s>]`.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::{BypassConfig, Mode};
use crate::matcher::{Matcher, RuleVerdict};

static BUILTIN_RULES: &[u8] = include_bytes!("../assets/bypass_default.conf.gz");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: String,
    pub verdict: RuleVerdict,
}

pub fn parse_line(line: &str) -> Option<Rule> {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
    .trim();
    let (pattern, args) = line.split_once(char::is_whitespace)?;
    let args = args.trim();
    if pattern.is_empty() || args.is_empty() {
        return None;
    }

    let mut parts = args.split(',').map(str::trim);
    let mode = match parts.next()?.parse::<Mode>() {
        Ok(mode) => mode,
        Err(err) => {
            debug!(target = "bypass", pattern = %pattern, error = %err, "skip rule");
            return None;
        }
    };

    let mut verdict = RuleVerdict::new(mode);
    for kv in parts {
        let Some((key, value)) = kv.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "tag" => verdict.tag = Some(Arc::from(value)),
            "resolver" => verdict.resolver = Some(Arc::from(value.to_ascii_lowercase())),
            "resolve_strategy" => match value.parse() {
                Ok(s) => verdict.resolve_strategy = s,
                Err(err) => debug!(target = "bypass", pattern = %pattern, error = %err, "ignore option"),
            },
            _ => {}
        }
    }

    Some(Rule {
        pattern: pattern.to_ascii_lowercase(),
        verdict,
    })
}

pub fn parse_rules<R: BufRead>(reader: R) -> Vec<Rule> {
    reader
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| parse_line(&line))
        .collect()
}

pub fn builtin_rules() -> anyhow::Result<Vec<Rule>> {
    let mut raw = String::new();
    GzDecoder::new(BUILTIN_RULES)
        .read_to_string(&mut raw)
        .context("decompress builtin bypass rules")?;
    Ok(parse_rules(raw.as_bytes()))
}

/// Reads `path`, falling back to the built-in snapshot when it can't be opened.
pub fn load_rules(path: Option<&Path>) -> anyhow::Result<Vec<Rule>> {
    if let Some(path) = path {
        match File::open(path) {
            Ok(file) => return Ok(parse_rules(BufReader::new(file))),
            Err(err) => {
                warn!(target = "bypass", path = %path.display(), error = %err,
                    "open bypass file failed, fallback to builtin rules");
            }
        }
    }
    builtin_rules()
}

/// Compiled rules: custom rules are consulted before the bypass file.
pub struct RuleSet {
    custom: Matcher,
    file: Matcher,
}

impl RuleSet {
    pub fn build(cfg: &BypassConfig) -> anyhow::Result<Self> {
        let mut file = Matcher::new();
        for rule in load_rules(cfg.bypass_file.as_deref())? {
            if let Err(err) = file.insert(&rule.pattern, rule.verdict) {
                warn!(target = "bypass", error = %err, "skip invalid rule");
            }
        }

        let mut custom = Matcher::new();
        for rule in &cfg.custom_rules {
            let verdict = RuleVerdict {
                mode: rule.mode,
                tag: rule.tag.as_deref().map(Arc::from),
                resolve_strategy: rule.resolve_strategy,
                resolver: rule.resolver.as_deref().map(|r| Arc::from(r.to_ascii_lowercase())),
            };
            for host in &rule.hostnames {
                custom
                    .insert(&host.to_ascii_lowercase(), verdict.clone())
                    .with_context(|| format!("custom rule {host}"))?;
            }
        }

        info!(target = "bypass", file_rules = file.len(), custom_rules = custom.len(), "rules compiled");
        Ok(Self { custom, file })
    }

    pub fn search(&self, addr: &Address) -> Option<RuleVerdict> {
        self.custom.search(addr).or_else(|| self.file.search(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomRule, ResolveStrategy};
    use std::io::Write;

    #[test]
    fn parses_mode_and_options() {
        let rule = parse_line("Example.COM PROXY,tag=Work,resolver=Remote,resolve_strategy=prefer_ipv6 # c")
            .expect("rule");
        assert_eq!(rule.pattern, "example.com");
        assert_eq!(rule.verdict.mode, Mode::Proxy);
        assert_eq!(rule.verdict.tag.as_deref(), Some("Work"));
        assert_eq!(rule.verdict.resolver.as_deref(), Some("remote"));
        assert_eq!(rule.verdict.resolve_strategy, ResolveStrategy::PreferV6);
    }

    #[test]
    fn skips_comments_short_lines_and_unknown_modes() {
        assert!(parse_line("# only a comment").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("lonely.example").is_none());
        assert!(parse_line("a.example tunnel").is_none());
        assert!(parse_line("a.example\tdirect").is_some());
    }

    #[test]
    fn builtin_snapshot_contains_lan_rules() {
        let rules = builtin_rules().expect("builtin");
        let lan = rules
            .iter()
            .find(|r| r.pattern == "192.168.0.0/16")
            .expect("lan rule");
        assert_eq!(lan.verdict.mode, Mode::Direct);
        assert_eq!(lan.verdict.tag.as_deref(), Some("LAN"));
        assert!(rules.iter().any(|r| r.pattern == "localhost"));
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let rules = load_rules(Some(Path::new("/nonexistent/kixroute/bypass.conf"))).unwrap();
        assert!(!rules.is_empty());
    }

    #[test]
    fn custom_rules_shadow_file_rules() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "lan.internal direct").unwrap();
        writeln!(file, "ads.example block").unwrap();

        let cfg = BypassConfig {
            bypass_file: Some(file.path().to_path_buf()),
            custom_rules: vec![CustomRule {
                hostnames: vec!["ads.example".into()],
                mode: Mode::Proxy,
                tag: None,
                resolver: None,
                resolve_strategy: ResolveStrategy::Default,
            }],
            ..Default::default()
        };
        let set = RuleSet::build(&cfg).expect("rules");
        assert_eq!(
            set.search(&Address::new("lan.internal", 80)).unwrap().mode,
            Mode::Direct
        );
        assert_eq!(
            set.search(&Address::new("ads.example", 80)).unwrap().mode,
            Mode::Proxy
        );
        assert!(set.search(&Address::new("unknown.example", 80)).is_none());
    }
}
