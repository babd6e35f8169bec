use regex::Regex;
use std::sync::{Arc, RwLock};

use crate::domain::{Result, TokenOpsError};

/// Uncompiled pattern definition. `compile` validates every regex; a
/// malformed expression is an error at load time, not at match time.
#[derive(Debug, Clone, Default)]
pub struct PatternSpec {
    pub name: String,
    /// Any-match gates; at least one must match before extraction runs.
    pub gates: Vec<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub total: Option<String>,
    pub cost: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub operation: Option<String>,
    pub agent: Option<String>,
    pub timestamp: Option<String>,
    pub confidence: f64,
}

impl PatternSpec {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
            ..Default::default()
        }
    }

    pub fn gate(mut self, re: impl Into<String>) -> Self {
        self.gates.push(re.into());
        self
    }

    pub fn tokens(
        mut self,
        input: Option<&str>,
        output: Option<&str>,
        total: Option<&str>,
    ) -> Self {
        self.input = input.map(String::from);
        self.output = output.map(String::from);
        self.total = total.map(String::from);
        self
    }

    pub fn cost(mut self, re: impl Into<String>) -> Self {
        self.cost = Some(re.into());
        self
    }

    pub fn metadata(
        mut self,
        model: Option<&str>,
        provider: Option<&str>,
        operation: Option<&str>,
        agent: Option<&str>,
    ) -> Self {
        self.model = model.map(String::from);
        self.provider = provider.map(String::from);
        self.operation = operation.map(String::from);
        self.agent = agent.map(String::from);
        self
    }

    pub fn compile(self) -> Result<DetectionPattern> {
        if self.gates.is_empty() {
            return Err(TokenOpsError::InvalidPattern {
                name: self.name,
                reason: "at least one gate regex is required".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TokenOpsError::InvalidPattern {
                name: self.name,
                reason: format!("confidence {} outside [0,1]", self.confidence),
            });
        }

        let compile_one = |field: &str, re: &str| {
            Regex::new(re).map_err(|e| TokenOpsError::InvalidPattern {
                name: self.name.clone(),
                reason: format!("{}: {}", field, e),
            })
        };

        let mut gates = Vec::with_capacity(self.gates.len());
        for g in &self.gates {
            gates.push(compile_one("gate", g)?);
        }

        let opt = |field: &str, re: &Option<String>| -> Result<Option<Regex>> {
            re.as_deref().map(|r| compile_one(field, r)).transpose()
        };

        Ok(DetectionPattern {
            name: self.name.clone(),
            gates,
            input: opt("input", &self.input)?,
            output: opt("output", &self.output)?,
            total: opt("total", &self.total)?,
            cost: opt("cost", &self.cost)?,
            model: opt("model", &self.model)?,
            provider: opt("provider", &self.provider)?,
            operation: opt("operation", &self.operation)?,
            agent: opt("agent", &self.agent)?,
            timestamp: opt("timestamp", &self.timestamp)?,
            confidence: self.confidence,
        })
    }
}

/// A compiled pattern bundle. Immutable once added to the registry.
#[derive(Debug)]
pub struct DetectionPattern {
    pub name: String,
    gates: Vec<Regex>,
    pub input: Option<Regex>,
    pub output: Option<Regex>,
    pub total: Option<Regex>,
    pub cost: Option<Regex>,
    pub model: Option<Regex>,
    pub provider: Option<Regex>,
    pub operation: Option<Regex>,
    pub agent: Option<Regex>,
    pub timestamp: Option<Regex>,
    pub confidence: f64,
}

impl DetectionPattern {
    pub fn matches(&self, line: &str) -> bool {
        self.gates.iter().any(|g| g.is_match(line))
    }
}

/// First non-empty capture group of `re` in `line`, parsed as u64.
pub(crate) fn capture_u64(re: &Regex, line: &str) -> Option<u64> {
    let caps = re.captures(line)?;
    caps.iter()
        .skip(1)
        .flatten()
        .find_map(|m| m.as_str().replace(',', "").parse::<u64>().ok())
}

/// First non-empty capture group of `re` in `line`, as a trimmed string.
pub(crate) fn capture_str(re: &Regex, line: &str) -> Option<String> {
    let caps = re.captures(line)?;
    caps.iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_str().trim().to_string())
        .find(|s| !s.is_empty())
}

/// Ordered pattern store. Read-mostly: readers snapshot the list at line
/// arrival so writers never block the per-line hot path.
pub struct PatternRegistry {
    patterns: RwLock<Vec<Arc<DetectionPattern>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Registry pre-loaded with the built-in CLI/log shapes.
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new();
        for spec in builtin_patterns() {
            registry.add(spec.compile()?);
        }
        Ok(registry)
    }

    pub fn add(&self, pattern: DetectionPattern) {
        self.patterns.write().unwrap().push(Arc::new(pattern));
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut patterns = self.patterns.write().unwrap();
        let before = patterns.len();
        patterns.retain(|p| p.name != name);
        patterns.len() != before
    }

    /// Ordered view of the current patterns. Taken per line by the
    /// detector, so registry writes never stall readers.
    pub fn snapshot(&self) -> Vec<Arc<DetectionPattern>> {
        self.patterns.read().unwrap().clone()
    }

    pub fn list(&self) -> Vec<Arc<DetectionPattern>> {
        self.snapshot()
    }

    pub fn len(&self) -> usize {
        self.patterns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in detection patterns, ordered most-specific first.
pub fn builtin_patterns() -> Vec<PatternSpec> {
    vec![
        PatternSpec::new("anthropic-usage", 0.9)
            .gate(r"(?i)\b(anthropic|claude)\b")
            .tokens(
                Some(r"(?i)input[:=\s]+([\d,]+)"),
                Some(r"(?i)output[:=\s]+([\d,]+)"),
                Some(r"(?i)\btokens?[:=\s]+([\d,]+)"),
            )
            .metadata(
                Some(r"(?i)model[:=\s]+([\w.\-]+)"),
                Some(r"(?i)\b(anthropic|claude)\b"),
                Some(r"(?i)operation[:=\s]+([\w\-]+)"),
                Some(r"(?i)agent[:=\s]+([\w\-]+)"),
            ),
        PatternSpec::new("openai-usage", 0.85)
            .gate(r"(?i)\b(openai|gpt-\d|o1)\b|prompt_tokens")
            .tokens(
                Some(r#"(?i)prompt_tokens["':=\s]+([\d,]+)"#),
                Some(r#"(?i)completion_tokens["':=\s]+([\d,]+)"#),
                Some(r#"(?i)total_tokens["':=\s]+([\d,]+)"#),
            )
            .metadata(
                Some(r#"(?i)model["':=\s]+([\w.\-]+)"#),
                Some(r"(?i)\b(openai|gpt)\b"),
                None,
                Some(r"(?i)agent[:=\s]+([\w\-]+)"),
            ),
        PatternSpec::new("gemini-usage", 0.85)
            .gate(r"(?i)\b(gemini|vertex)\b")
            .tokens(
                Some(r"(?i)input[_\s]?tokens?[:=\s]+([\d,]+)"),
                Some(r"(?i)output[_\s]?tokens?[:=\s]+([\d,]+)"),
                Some(r"(?i)total[_\s]?tokens?[:=\s]+([\d,]+)"),
            )
            .metadata(
                Some(r"(?i)model[:=\s]+([\w.\-]+)"),
                Some(r"(?i)\b(gemini|vertex)\b"),
                None,
                Some(r"(?i)agent[:=\s]+([\w\-]+)"),
            ),
        PatternSpec::new("generic-token-count", 0.5)
            .gate(r"(?i)\btokens?\s+(used|consumed)\b|token\s+usage")
            .tokens(
                None,
                None,
                Some(r"(?i)([\d,]+)\s+tokens?\s+(?:used|consumed)|tokens?\s+(?:used|consumed)[:=\s]+([\d,]+)"),
            )
            .metadata(
                Some(r"(?i)model[:=\s]+([\w.\-]+)"),
                None,
                None,
                Some(r"(?i)agent[:=\s]+([\w\-]+)"),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_builtin_patterns_compile() {
        let registry = PatternRegistry::with_defaults().unwrap();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_malformed_regex_rejected() {
        let spec = PatternSpec::new("broken", 0.5).gate(r"(unclosed");
        assert_matches!(
            spec.compile(),
            Err(TokenOpsError::InvalidPattern { .. })
        );
    }

    #[test]
    fn test_confidence_bounds() {
        let spec = PatternSpec::new("too-confident", 1.5).gate(r"x");
        assert!(spec.compile().is_err());
    }

    #[test]
    fn test_first_pattern_wins_ordering() {
        let registry = PatternRegistry::with_defaults().unwrap();
        let line = "anthropic usage: tokens: 1500 input: 1000 output: 500";
        let hit = registry.snapshot().into_iter().find(|p| p.matches(line));
        assert_eq!(hit.unwrap().name, "anthropic-usage");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = PatternRegistry::with_defaults().unwrap();
        assert!(registry.remove("generic-token-count"));
        assert!(!registry.remove("generic-token-count"));
    }

    #[test]
    fn test_capture_u64_multi_group() {
        let re = Regex::new(r"(?i)([\d,]+)\s+tokens\s+used|tokens\s+used[:=\s]+([\d,]+)").unwrap();
        assert_eq!(capture_u64(&re, "1,234 tokens used"), Some(1234));
        assert_eq!(capture_u64(&re, "tokens used: 987"), Some(987));
        assert_eq!(capture_u64(&re, "no numbers here"), None);
    }
}
