//! Five-level significance scoring: a base level per node kind plus signed
//! factor offsets, clamped into a configured window. Every invocation also
//! returns the factor-by-factor explanation for auditing.

use astdb_core::{NodeKind, NodeMetadata, Significance};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct SignificanceConfig {
    pub enable_complexity_factor: bool,
    pub minimum: Significance,
    pub maximum: Significance,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            enable_complexity_factor: true,
            minimum: Significance::Minimal,
            maximum: Significance::Critical,
        }
    }
}

/// Inputs to one scoring decision, gathered by the coordinator during the
/// walk.
#[derive(Debug, Clone, Default)]
pub struct NodeFacts {
    pub child_count: usize,
    pub source_len: usize,
    pub parameter_count: usize,
    pub member_count: usize,
    pub cyclomatic_complexity: u32,
    pub scope_depth: usize,
    pub is_test_file: bool,
    pub is_main_file: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactorContribution {
    pub factor: &'static str,
    pub offset: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignificanceExplanation {
    pub base: Significance,
    pub factors: Vec<FactorContribution>,
    pub final_level: Significance,
}

pub struct SignificanceCalculator {
    config: SignificanceConfig,
}

impl SignificanceCalculator {
    pub fn new(config: SignificanceConfig) -> Self {
        Self { config }
    }

    pub fn base_for(kind: NodeKind) -> Significance {
        match kind {
            NodeKind::File | NodeKind::Module | NodeKind::Class | NodeKind::Interface => {
                Significance::Critical
            }
            NodeKind::Function | NodeKind::Method | NodeKind::Constructor => Significance::High,
            NodeKind::Enum | NodeKind::TypeAlias | NodeKind::Import => Significance::Medium,
            NodeKind::Variable | NodeKind::Property | NodeKind::IfStatement => Significance::Low,
            NodeKind::Parameter | NodeKind::Comment | NodeKind::StringLiteral => {
                Significance::Minimal
            }
            NodeKind::Other => Significance::Low,
        }
    }

    pub fn calculate(
        &self,
        kind: NodeKind,
        name: Option<&str>,
        metadata: &NodeMetadata,
        facts: &NodeFacts,
    ) -> (Significance, SignificanceExplanation) {
        let base = Self::base_for(kind);
        let mut factors = Vec::new();

        if self.config.enable_complexity_factor {
            factors.push(self.complexity_factor(facts));
        }
        factors.push(self.scope_factor(facts));
        factors.push(self.size_factor(facts));
        factors.push(self.context_factor(metadata, facts));
        factors.push(self.usage_factor(name));

        let total: i32 = factors.iter().map(|f| f.offset).sum();
        let final_level =
            base.offset_clamped(total, self.config.minimum, self.config.maximum);

        let explanation = SignificanceExplanation {
            base,
            factors,
            final_level,
        };
        (final_level, explanation)
    }

    fn complexity_factor(&self, facts: &NodeFacts) -> FactorContribution {
        let mut points = 0u32;
        if facts.child_count > 10 {
            points += 1;
        }
        if facts.source_len > 500 {
            points += 1;
        }
        if facts.parameter_count > 4 {
            points += 1;
        }
        if facts.cyclomatic_complexity > 10 {
            points += 2;
        } else if facts.cyclomatic_complexity > 5 {
            points += 1;
        }
        if facts.member_count > 8 {
            points += 1;
        }
        let offset = (points / 2).min(2) as i32;
        FactorContribution {
            factor: "complexity",
            offset,
            reason: format!(
                "children={} len={} params={} cyclomatic={} members={}",
                facts.child_count,
                facts.source_len,
                facts.parameter_count,
                facts.cyclomatic_complexity,
                facts.member_count
            ),
        }
    }

    fn scope_factor(&self, facts: &NodeFacts) -> FactorContribution {
        let (offset, reason) = if facts.scope_depth <= 1 {
            (1, "top level".to_string())
        } else if facts.scope_depth > 3 {
            (-1, format!("deeply nested (depth {})", facts.scope_depth))
        } else {
            (0, format!("depth {}", facts.scope_depth))
        };
        FactorContribution {
            factor: "scope",
            offset,
            reason,
        }
    }

    fn size_factor(&self, facts: &NodeFacts) -> FactorContribution {
        let (offset, reason) = if facts.source_len > 1000 {
            (1, format!("large node ({} chars)", facts.source_len))
        } else if facts.source_len < 40 {
            (-1, format!("small node ({} chars)", facts.source_len))
        } else {
            (0, format!("{} chars", facts.source_len))
        };
        FactorContribution {
            factor: "size",
            offset,
            reason,
        }
    }

    fn context_factor(&self, metadata: &NodeMetadata, facts: &NodeFacts) -> FactorContribution {
        let mut offset = 0;
        let mut reasons = Vec::new();
        if facts.is_test_file {
            offset -= 1;
            reasons.push("test file");
        }
        if facts.is_main_file {
            offset += 1;
            reasons.push("main file");
        }
        if !metadata.exports.is_empty() {
            offset += 1;
            reasons.push("exported");
        }
        if metadata.docstring.is_some() {
            offset += 1;
            reasons.push("documented");
        }
        if metadata.modifiers.len() >= 2 {
            offset += 1;
            reasons.push("multiple modifiers");
        }
        FactorContribution {
            factor: "context",
            offset: offset.clamp(-1, 2),
            reason: if reasons.is_empty() {
                "no signals".to_string()
            } else {
                reasons.join(", ")
            },
        }
    }

    /// Conventional entry-point names raise significance; this factor is
    /// floored at zero and never penalizes.
    fn usage_factor(&self, name: Option<&str>) -> FactorContribution {
        let offset = match name {
            Some(name) => {
                let lowered = name.to_lowercase();
                if lowered == "main"
                    || lowered.starts_with("index")
                    || lowered.starts_with("init")
                    || lowered.starts_with("api")
                    || lowered.starts_with("public")
                {
                    1
                } else {
                    0
                }
            }
            None => 0,
        };
        FactorContribution {
            factor: "usage",
            offset,
            reason: match name {
                Some(name) if offset > 0 => format!("entry-point name {}", name),
                Some(_) => "no entry-point hint".to_string(),
                None => "anonymous".to_string(),
            },
        }
    }
}

/// Path heuristics feeding the context factor.
pub fn is_test_path(path: &str) -> bool {
    let lowered = path.to_lowercase();
    lowered.contains("/test")
        || lowered.contains("/tests/")
        || lowered.contains("_test.")
        || lowered.contains(".test.")
        || lowered.contains(".spec.")
        || lowered.starts_with("test_")
        || lowered
            .rsplit('/')
            .next()
            .is_some_and(|f| f.starts_with("test_"))
}

pub fn is_main_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    file.starts_with("main.")
        || file.starts_with("index.")
        || file.starts_with("lib.")
        || file.starts_with("mod.")
        || file.starts_with("app.")
        || file.starts_with("__init__.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> SignificanceCalculator {
        SignificanceCalculator::new(SignificanceConfig::default())
    }

    #[test]
    fn class_base_is_critical() {
        let (level, explanation) = calc().calculate(
            NodeKind::Class,
            Some("Widget"),
            &NodeMetadata::default(),
            &NodeFacts {
                scope_depth: 2,
                source_len: 200,
                ..Default::default()
            },
        );
        assert_eq!(explanation.base, Significance::Critical);
        assert_eq!(level, Significance::Critical);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let facts = NodeFacts {
            child_count: 12,
            source_len: 800,
            parameter_count: 5,
            cyclomatic_complexity: 7,
            scope_depth: 2,
            ..Default::default()
        };
        let a = calc().calculate(NodeKind::Function, Some("run"), &NodeMetadata::default(), &facts);
        let b = calc().calculate(NodeKind::Function, Some("run"), &NodeMetadata::default(), &facts);
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_file_context_penalty() {
        let plain = calc().calculate(
            NodeKind::Function,
            Some("helper"),
            &NodeMetadata::default(),
            &NodeFacts {
                scope_depth: 2,
                source_len: 100,
                ..Default::default()
            },
        );
        let in_test = calc().calculate(
            NodeKind::Function,
            Some("helper"),
            &NodeMetadata::default(),
            &NodeFacts {
                scope_depth: 2,
                source_len: 100,
                is_test_file: true,
                ..Default::default()
            },
        );
        assert!(in_test.0 < plain.0);
    }

    #[test]
    fn entry_point_bonus_never_negative() {
        let calc = calc();
        let factor = calc.usage_factor(Some("obscure_helper"));
        assert_eq!(factor.offset, 0);
        let factor = calc.usage_factor(Some("main"));
        assert_eq!(factor.offset, 1);
        let factor = calc.usage_factor(Some("api_list_users"));
        assert_eq!(factor.offset, 1);
    }

    #[test]
    fn clamped_to_configured_window() {
        let calc = SignificanceCalculator::new(SignificanceConfig {
            enable_complexity_factor: true,
            minimum: Significance::Low,
            maximum: Significance::High,
        });
        let (level, _) = calc.calculate(
            NodeKind::Class,
            Some("Big"),
            &NodeMetadata::default(),
            &NodeFacts {
                scope_depth: 1,
                source_len: 5000,
                member_count: 20,
                child_count: 30,
                ..Default::default()
            },
        );
        assert_eq!(level, Significance::High);

        let (level, _) = calc.calculate(
            NodeKind::Comment,
            None,
            &NodeMetadata::default(),
            &NodeFacts {
                scope_depth: 6,
                source_len: 5,
                is_test_file: true,
                ..Default::default()
            },
        );
        assert_eq!(level, Significance::Low);
    }

    #[test]
    fn explanation_lists_all_factors() {
        let (_, explanation) = calc().calculate(
            NodeKind::Method,
            Some("save"),
            &NodeMetadata::default(),
            &NodeFacts::default(),
        );
        let names: Vec<&str> = explanation.factors.iter().map(|f| f.factor).collect();
        assert_eq!(names, vec!["complexity", "scope", "size", "context", "usage"]);
    }

    #[test]
    fn path_heuristics() {
        assert!(is_test_path("src/tests/parser_test.rs"));
        assert!(is_test_path("web/app.spec.ts"));
        assert!(!is_test_path("src/engine.rs"));
        assert!(is_main_path("src/main.rs"));
        assert!(is_main_path("pkg/__init__.py"));
        assert!(!is_main_path("src/util.rs"));
    }
}
