// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: recipe  —  shell-template expansion and execution
//
//  A recipe is a property whose value is a command-line template, e.g.
//
//    recipe.c.o.pattern="{compiler.path}{compiler.c.cmd}" {compiler.c.flags}
//                       -mmcu={build.mcu} {includes} "{source_file}"
//                       -o "{object_file}"
//
//  The pattern is expanded through the property map (with per-call overrides
//  layered on top), split into argv with POSIX-style quoting, and executed
//  with captured stdout/stderr.  An absent or empty pattern is a successful
//  no-op unless the caller declared the recipe required.
// ─────────────────────────────────────────────────────────────────────────────

use std::process::{Command, Stdio};

use crate::cancel::CancelToken;
use crate::error::{BuildError, Result};
use crate::logger::BuildLogger;
use crate::props::PropertyMap;

#[derive(Debug, Clone)]
pub struct RecipeOutcome {
    pub argv:   Vec<String>,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RecipeOutcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Argv splitting
// ─────────────────────────────────────────────────────────────────────────────

/// Split an expanded pattern into argv with POSIX-style quoting rules.
///
/// Outside quotes, backslash escapes the next character.  Single quotes are
/// fully literal.  Inside double quotes, backslash escapes `"` and `\` —
/// except on Windows, where toolchain paths like "C:\avr\bin" make the
/// backslash a plain character inside double-quoted strings.
pub fn split_argv(key: &str, s: &str) -> Result<Vec<String>> {
    split_argv_rules(key, s, cfg!(windows))
}

fn split_argv_rules(key: &str, s: &str, windows: bool) -> Result<Vec<String>> {
    let mut argv: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut has_token = false;

    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                if has_token {
                    argv.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '\'' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(BuildError::MalformedRecipe {
                                key:    key.to_owned(),
                                detail: "unterminated single quote".into(),
                            })
                        }
                    }
                }
            }
            '"' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') if !windows => match chars.next() {
                            Some(e @ ('"' | '\\')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(BuildError::MalformedRecipe {
                                    key:    key.to_owned(),
                                    detail: "trailing backslash inside double quote".into(),
                                })
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(BuildError::MalformedRecipe {
                                key:    key.to_owned(),
                                detail: "unterminated double quote".into(),
                            })
                        }
                    }
                }
            }
            '\\' if !windows => {
                has_token = true;
                match chars.next() {
                    Some(e) => current.push(e),
                    None => {
                        return Err(BuildError::MalformedRecipe {
                            key:    key.to_owned(),
                            detail: "trailing backslash".into(),
                        })
                    }
                }
            }
            _ => {
                has_token = true;
                current.push(c);
            }
        }
    }
    if has_token {
        argv.push(current);
    }
    Ok(argv)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Runner
// ─────────────────────────────────────────────────────────────────────────────

pub struct RecipeRunner<'a> {
    pub props:  &'a PropertyMap,
    pub logger: BuildLogger,
    pub cancel: CancelToken,
}

impl<'a> RecipeRunner<'a> {
    pub fn new(props: &'a PropertyMap, logger: BuildLogger, cancel: CancelToken) -> Self {
        RecipeRunner { props, logger, cancel }
    }

    /// Expand a recipe into argv without running it.
    /// `None` means the pattern is absent/empty and the recipe was optional.
    pub fn argv_for(
        &self,
        key: &str,
        overrides: Option<&PropertyMap>,
        required: bool,
    ) -> Result<Option<Vec<String>>> {
        let pattern = match self.props.get(key) {
            Some(p) if !p.trim().is_empty() => p.to_owned(),
            _ => {
                if required {
                    return Err(BuildError::RecipeNotFound(key.to_owned()));
                }
                return Ok(None);
            }
        };

        let expanded = match overrides {
            Some(extra) => {
                let mut layered = self.props.clone();
                layered.merge(extra);
                layered.expand(&pattern)
            }
            None => self.props.expand(&pattern),
        };

        let argv = split_argv(key, &expanded)?;
        if argv.is_empty() {
            if required {
                return Err(BuildError::RecipeNotFound(key.to_owned()));
            }
            return Ok(None);
        }
        Ok(Some(argv))
    }

    /// Expand and execute a recipe, capturing both output streams.
    pub fn run(
        &self,
        key: &str,
        overrides: Option<&PropertyMap>,
        required: bool,
    ) -> Result<Option<RecipeOutcome>> {
        let argv = match self.argv_for(key, overrides, required)? {
            Some(argv) => argv,
            None => return Ok(None),
        };
        self.exec(argv).map(Some)
    }

    /// Execute prepared argv.  The subprocess is registered with the cancel
    /// token for the duration of the wait.
    pub fn exec(&self, argv: Vec<String>) -> Result<RecipeOutcome> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        self.logger.command(&argv);

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::ToolSpawnFailed {
                tool:   argv[0].clone(),
                detail: e.to_string(),
            })?;

        let pid = child.id();
        self.cancel.register(pid);
        let out = child.wait_with_output();
        self.cancel.unregister(pid);
        let out = out?;

        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        Ok(RecipeOutcome {
            argv,
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn split(s: &str) -> Vec<String> {
        split_argv_rules("test.pattern", s, false).unwrap()
    }

    #[test]
    fn splits_on_whitespace_runs() {
        assert_eq!(split("gcc  -c   main.c"), vec!["gcc", "-c", "main.c"]);
    }

    #[test]
    fn double_quotes_keep_spaces() {
        assert_eq!(
            split("\"/opt/my tools/gcc\" -o \"a b.o\""),
            vec!["/opt/my tools/gcc", "-o", "a b.o"]
        );
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(split("echo 'a \"b\" \\n'"), vec!["echo", "a \"b\" \\n"]);
    }

    #[test]
    fn backslash_escapes_in_double_quotes_on_posix() {
        assert_eq!(split("\"say \\\"hi\\\"\""), vec!["say \"hi\""]);
    }

    #[test]
    fn backslash_is_plain_in_double_quotes_on_windows() {
        let argv = split_argv_rules("test.pattern", "\"C:\\avr\\bin\\gcc.exe\" -c", true).unwrap();
        assert_eq!(argv, vec!["C:\\avr\\bin\\gcc.exe", "-c"]);
    }

    #[test]
    fn adjacent_quoted_pieces_join() {
        assert_eq!(split("\"{a}\"'{b}'"), vec!["{a}{b}"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(split_argv_rules("k", "gcc \"oops", false).is_err());
    }

    #[test]
    fn empty_pattern_is_optional_noop() {
        let mut props = PropertyMap::new();
        props.set("recipe.hooks.prebuild.pattern", "");
        let runner = RecipeRunner::new(&props, BuildLogger::default(), CancelToken::new());
        assert!(runner
            .argv_for("recipe.hooks.prebuild.pattern", None, false)
            .unwrap()
            .is_none());
        assert!(matches!(
            runner.argv_for("recipe.hooks.prebuild.pattern", None, true),
            Err(BuildError::RecipeNotFound(_))
        ));
    }

    #[test]
    fn overrides_win_over_base_properties() {
        let mut props = PropertyMap::new();
        props.set("recipe.c.o.pattern", "gcc -c {source_file} -o {object_file}");
        props.set("source_file", "stale.c");
        let runner = RecipeRunner::new(&props, BuildLogger::default(), CancelToken::new());

        let mut extra = PropertyMap::new();
        extra.set("source_file", "fresh.c");
        extra.set("object_file", "fresh.o");

        let argv = runner
            .argv_for("recipe.c.o.pattern", Some(&extra), true)
            .unwrap()
            .unwrap();
        assert_eq!(argv, vec!["gcc", "-c", "fresh.c", "-o", "fresh.o"]);
    }
}
