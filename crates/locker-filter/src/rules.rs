//! Filter rule and phrase parsing (AdBlock-style syntax).
//!
//! Supports:
//! - Domain rules: `||example.com^`
//! - URL prefixes: `|https://ads.`
//! - Path/wildcard patterns: `/banner/*/ad.`
//! - Plain substrings: `adserver`
//! - Exceptions: `@@` prefix on any of the above
//! - Comments `!` and headers `[...]`, ignored

use serde::{Deserialize, Serialize};

/// Shortest pattern accepted for substring-style rules
const MIN_PATTERN_LEN: usize = 3;

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Block,
    /// Exception rule
    Allow,
}

/// How a rule's pattern is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    /// Host equals the pattern or is a subdomain of it
    Domain,
    /// URL starts with the pattern
    UrlPrefix,
    /// Pattern segments separated by `*` appear in order
    Wildcard,
    /// URL contains the pattern
    Substring,
}

/// One parsed filter rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub kind: RuleKind,
    pub action: RuleAction,
    /// Lowercased pattern with anchors and options removed
    pub pattern: String,
    /// Archive entry the rule came from
    pub category: String,
}

impl Rule {
    /// Match against a lowercased URL and host.
    pub fn matches(&self, url: &str, host: &str) -> bool {
        match self.kind {
            RuleKind::Domain => domain_matches(host, &self.pattern),
            RuleKind::UrlPrefix => url.starts_with(&self.pattern),
            RuleKind::Substring => url.contains(&self.pattern),
            RuleKind::Wildcard => wildcard_matches(url, &self.pattern),
        }
    }
}

/// `host` is `domain` or one of its subdomains.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn wildcard_matches(url: &str, pattern: &str) -> bool {
    let mut rest = url;
    for segment in pattern.split('*').filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    true
}

/// Outcome of parsing one rule line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Rule(Rule),
    /// Blank, comment, header or cosmetic rule
    Ignored,
    /// Not understood
    Invalid,
}

/// Parse one line of a `.rules` file.
pub fn parse_rule_line(line: &str, category: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
        return ParsedLine::Ignored;
    }
    // Element hiding rules only make sense inside a page renderer
    if trimmed.contains("##") || trimmed.contains("#@#") {
        return ParsedLine::Ignored;
    }

    let (action, body) = match trimmed.strip_prefix("@@") {
        Some(rest) => (RuleAction::Allow, rest),
        None => (RuleAction::Block, trimmed),
    };

    // Options ($third-party, $script, ...) are not evaluated
    let body = body.split('$').next().unwrap_or("");

    match parse_pattern(body) {
        Some((kind, pattern)) => ParsedLine::Rule(Rule {
            kind,
            action,
            pattern,
            category: category.to_string(),
        }),
        None => ParsedLine::Invalid,
    }
}

fn parse_pattern(body: &str) -> Option<(RuleKind, String)> {
    if let Some(rest) = body.strip_prefix("||") {
        let domain = rest
            .split(['^', '/', '*', '|'])
            .next()?
            .trim_end_matches('.')
            .to_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return None;
        }
        return Some((RuleKind::Domain, domain));
    }

    if let Some(rest) = body.strip_prefix('|') {
        let prefix = rest.trim_end_matches(['^', '|']).to_lowercase();
        if prefix.len() < MIN_PATTERN_LEN {
            return None;
        }
        return Some((RuleKind::UrlPrefix, prefix));
    }

    let cleaned = body.trim_matches('^').trim_end_matches('|').to_lowercase();
    if cleaned.replace('*', "").len() < MIN_PATTERN_LEN {
        return None;
    }

    if cleaned.contains('*') {
        Some((RuleKind::Wildcard, cleaned))
    } else {
        Some((RuleKind::Substring, cleaned))
    }
}

/// A forbidden phrase from a `.triggers` file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Phrase {
    /// Lowercased phrase text
    pub text: String,
    pub category: String,
}

/// Parse one line of a `.triggers` file. Blank and `#` lines yield nothing.
pub fn parse_phrase_line(line: &str, category: &str) -> Option<Phrase> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(Phrase {
        text: trimmed.to_lowercase(),
        category: category.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(line: &str) -> Rule {
        match parse_rule_line(line, "test.rules") {
            ParsedLine::Rule(rule) => rule,
            other => panic!("expected a rule for {:?}, got {:?}", line, other),
        }
    }

    #[test]
    fn test_parse_domain_rule() {
        let r = rule("||Ads.Example.com^$third-party");
        assert_eq!(r.kind, RuleKind::Domain);
        assert_eq!(r.action, RuleAction::Block);
        assert_eq!(r.pattern, "ads.example.com");
        assert_eq!(r.category, "test.rules");
    }

    #[test]
    fn test_parse_exception() {
        let r = rule("@@||cdn.example.com^");
        assert_eq!(r.action, RuleAction::Allow);
        assert_eq!(r.kind, RuleKind::Domain);
    }

    #[test]
    fn test_parse_other_kinds() {
        assert_eq!(rule("|https://track.").kind, RuleKind::UrlPrefix);
        assert_eq!(rule("/banner/*/ad.").kind, RuleKind::Wildcard);
        assert_eq!(rule("adserver").kind, RuleKind::Substring);
    }

    #[test]
    fn test_ignored_and_invalid() {
        assert_eq!(parse_rule_line("", "c"), ParsedLine::Ignored);
        assert_eq!(parse_rule_line("! comment", "c"), ParsedLine::Ignored);
        assert_eq!(parse_rule_line("[Adblock Plus 2.0]", "c"), ParsedLine::Ignored);
        assert_eq!(parse_rule_line("example.com##.banner", "c"), ParsedLine::Ignored);
        assert_eq!(parse_rule_line("||^", "c"), ParsedLine::Invalid);
        assert_eq!(parse_rule_line("ab", "c"), ParsedLine::Invalid);
    }

    #[test]
    fn test_domain_matching() {
        let r = rule("||tracker.net^");
        assert!(r.matches("https://tracker.net/x", "tracker.net"));
        assert!(r.matches("https://a.b.tracker.net/x", "a.b.tracker.net"));
        assert!(!r.matches("https://nottracker.net/x", "nottracker.net"));
    }

    #[test]
    fn test_wildcard_matching() {
        let r = rule("/banner/*/ad.");
        assert!(r.matches("https://site.com/banner/300x250/ad.png", "site.com"));
        assert!(!r.matches("https://site.com/ad./banner/", "site.com"));
    }

    #[test]
    fn test_phrase_parsing() {
        let p = parse_phrase_line("  Casino Bonus ", "gambling.triggers").unwrap();
        assert_eq!(p.text, "casino bonus");
        assert!(parse_phrase_line("# note", "x").is_none());
        assert!(parse_phrase_line("   ", "x").is_none());
    }
}
