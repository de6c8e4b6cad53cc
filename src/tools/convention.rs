//! How the entry script hands arguments to a tool's `main` function.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Calling convention for a tool's entry function.
///
/// Decided once from tool metadata (explicitly set, or read off the
/// script's `def main(...)` line when the definition is loaded) and baked
/// into the generated entry script. Nothing inspects the function at
/// execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CallingConvention {
    /// `main()`
    NoArgs,
    /// `main(args)` with the whole argument map as one positional value.
    MapArg,
    /// `main(**args)`. With `positional_fallback`, a `TypeError` retries as
    /// `main(args)`.
    KeywordArgs { positional_fallback: bool },
}

impl Default for CallingConvention {
    fn default() -> Self {
        Self::KeywordArgs {
            positional_fallback: true,
        }
    }
}

impl CallingConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoArgs => "no_args",
            Self::MapArg => "map_arg",
            Self::KeywordArgs {
                positional_fallback: false,
            } => "keyword_args",
            Self::KeywordArgs {
                positional_fallback: true,
            } => "keyword_args_or_map",
        }
    }

    /// Read the convention off a script's top-level `def main(...)`.
    ///
    /// Returns `None` when the script has no recognisable `main`.
    pub fn infer_from_source(script: &str) -> Option<Self> {
        static MAIN_SIG: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?m)^(?:async\s+)?def\s+main\s*\(([^)]*)\)").expect("valid regex")
        });

        let caps = MAIN_SIG.captures(script)?;
        let params = parse_params(caps.get(1).map_or("", |m| m.as_str()));

        Some(match params.as_slice() {
            [] => Self::NoArgs,
            [single] => match single {
                Param::VarKeyword => Self::KeywordArgs {
                    positional_fallback: false,
                },
                Param::Named(name) if name == "args" => Self::MapArg,
                _ => Self::KeywordArgs {
                    positional_fallback: true,
                },
            },
            _ => Self::KeywordArgs {
                positional_fallback: false,
            },
        })
    }
}

impl std::fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CallingConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_args" => Ok(Self::NoArgs),
            "map_arg" => Ok(Self::MapArg),
            "keyword_args" => Ok(Self::KeywordArgs {
                positional_fallback: false,
            }),
            "keyword_args_or_map" => Ok(Self::KeywordArgs {
                positional_fallback: true,
            }),
            other => Err(format!("unknown calling convention '{}'", other)),
        }
    }
}

impl From<CallingConvention> for String {
    fn from(c: CallingConvention) -> Self {
        c.as_str().to_string()
    }
}

impl TryFrom<String> for CallingConvention {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, PartialEq)]
enum Param {
    Named(String),
    VarPositional(String),
    VarKeyword,
}

/// Split a Python parameter list at top-level commas.
fn parse_params(raw: &str) -> Vec<Param> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in raw.chars() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    parts
        .into_iter()
        .filter_map(|p| {
            let p = p.trim();
            // Bare `*` and `/` are separators, not parameters.
            if p.is_empty() || p == "*" || p == "/" {
                return None;
            }
            let name = p
                .split([':', '='])
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(if name.starts_with("**") {
                Param::VarKeyword
            } else if let Some(rest) = name.strip_prefix('*') {
                Param::VarPositional(rest.to_string())
            } else {
                Param::Named(name)
            })
        })
        .map(|p| match p {
            // `*args` behaves like a parameter literally named `args`.
            Param::VarPositional(name) if name == "args" => Param::Named(name),
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer(src: &str) -> Option<CallingConvention> {
        CallingConvention::infer_from_source(src)
    }

    #[test]
    fn zero_params_calls_with_nothing() {
        assert_eq!(infer("def main():\n    return 1\n"), Some(CallingConvention::NoArgs));
    }

    #[test]
    fn args_named_param_gets_the_map() {
        assert_eq!(
            infer("import json\n\ndef main(args):\n    pass\n"),
            Some(CallingConvention::MapArg)
        );
        assert_eq!(
            infer("def main(args: dict) -> dict:\n    pass\n"),
            Some(CallingConvention::MapArg)
        );
    }

    #[test]
    fn var_keyword_param_expands() {
        assert_eq!(
            infer("def main(**kwargs):\n    pass\n"),
            Some(CallingConvention::KeywordArgs {
                positional_fallback: false
            })
        );
    }

    #[test]
    fn other_single_param_expands_with_fallback() {
        assert_eq!(
            infer("def main(params):\n    pass\n"),
            Some(CallingConvention::KeywordArgs {
                positional_fallback: true
            })
        );
    }

    #[test]
    fn many_params_expand_as_keywords() {
        assert_eq!(
            infer("def main(target, ports=\"1-1000\", opts: dict = {}):\n    pass\n"),
            Some(CallingConvention::KeywordArgs {
                positional_fallback: false
            })
        );
    }

    #[test]
    fn multiline_signature_and_separators() {
        let src = "def main(\n    target: str,\n    *,\n    timeout: int = 30,\n):\n    pass\n";
        assert_eq!(
            infer(src),
            Some(CallingConvention::KeywordArgs {
                positional_fallback: false
            })
        );
    }

    #[test]
    fn nested_main_is_ignored() {
        assert_eq!(infer("class X:\n    def main(self):\n        pass\n"), None);
        assert_eq!(infer("print('no entry')"), None);
    }

    #[test]
    fn string_form_is_stable() {
        for c in [
            CallingConvention::NoArgs,
            CallingConvention::MapArg,
            CallingConvention::KeywordArgs {
                positional_fallback: false,
            },
            CallingConvention::default(),
        ] {
            assert_eq!(c.as_str().parse::<CallingConvention>().unwrap(), c);
        }
        assert_eq!(
            serde_json::to_string(&CallingConvention::MapArg).unwrap(),
            "\"map_arg\""
        );
    }
}
