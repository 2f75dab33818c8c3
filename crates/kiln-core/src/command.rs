//! Command builder
//!
//! A command line such as `${CC} ${CFLAGS} -c ${SRC} -o ${TGT[0]}` is compiled
//! once into words made of literal and reference pieces, then evaluated per task
//! against its configuration and files.

use std::path::PathBuf;

use crate::config::ConfigSet;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ref {
    /// Configuration variable
    Var(String),
    /// All inputs
    Src,
    /// All outputs
    Tgt,
    SrcAt(usize),
    TgtAt(usize),
    /// Temporary copy of a modify target
    Dep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Lit(String),
    Ref(Ref),
}

/// What a compiled command needs from the task at execution time
pub struct CommandInput<'a> {
    pub env: &'a ConfigSet,
    pub inputs: &'a [PathBuf],
    pub outputs: &'a [PathBuf],
    pub dep: Option<&'a PathBuf>,
}

/// Evaluated command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct CommandTemplate {
    source: String,
    words: Vec<Vec<Piece>>,
    shell: bool,
    vars: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let shell = ["<", ">", "|", "&&"].iter().any(|op| source.contains(op));
        let mut words: Vec<Vec<Piece>> = Vec::new();
        let mut vars: Vec<String> = Vec::new();
        let mut word: Vec<Piece> = Vec::new();
        let mut lit = String::new();
        let mut chars = source.chars().peekable();

        fn flush_lit(lit: &mut String, word: &mut Vec<Piece>) {
            if !lit.is_empty() {
                word.push(Piece::Lit(std::mem::take(lit)));
            }
        }

        while let Some(c) = chars.next() {
            match c {
                '$' if chars.peek() == Some(&'$') => {
                    chars.next();
                    lit.push('$');
                }
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(EngineError::Configuration(format!(
                                    "unterminated reference in command '{}'",
                                    source
                                )))
                            }
                        }
                    }
                    flush_lit(&mut lit, &mut word);
                    let r = parse_ref(&name, source)?;
                    if let Ref::Var(var) = &r {
                        if !vars.contains(var) {
                            vars.push(var.clone());
                        }
                    }
                    word.push(Piece::Ref(r));
                }
                c if c.is_whitespace() => {
                    flush_lit(&mut lit, &mut word);
                    if !word.is_empty() {
                        words.push(std::mem::take(&mut word));
                    }
                }
                c => lit.push(c),
            }
        }
        flush_lit(&mut lit, &mut word);
        if !word.is_empty() {
            words.push(word);
        }

        if words.is_empty() {
            return Err(EngineError::Configuration("empty command".into()));
        }

        Ok(Self {
            source: source.to_string(),
            words,
            shell,
            vars,
        })
    }

    /// Configuration keys the command reads
    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_shell(&self) -> bool {
        self.shell
    }

    pub fn evaluate(&self, input: &CommandInput<'_>) -> Result<CommandLine> {
        let mut argv = Vec::new();
        for word in &self.words {
            argv.extend(expand_word(word, input, &self.source, self.shell)?);
        }
        if self.shell {
            Ok(CommandLine::Shell(argv.join(" ")))
        } else {
            Ok(CommandLine::Argv(argv))
        }
    }
}

fn parse_ref(name: &str, source: &str) -> Result<Ref> {
    let indexed = |prefix: &str| -> Option<Result<usize>> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('[')?;
        let idx = rest.strip_suffix(']')?;
        Some(idx.parse::<usize>().map_err(|_| {
            EngineError::Configuration(format!("bad index '{}' in command '{}'", name, source))
        }))
    };

    match name {
        "SRC" => return Ok(Ref::Src),
        "TGT" => return Ok(Ref::Tgt),
        "DEP" => return Ok(Ref::Dep),
        _ => {}
    }
    if let Some(idx) = indexed("SRC") {
        return Ok(Ref::SrcAt(idx?));
    }
    if let Some(idx) = indexed("TGT") {
        return Ok(Ref::TgtAt(idx?));
    }
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(EngineError::Configuration(format!(
            "bad reference '${{{}}}' in command '{}'",
            name, source
        )));
    }
    Ok(Ref::Var(name.to_string()))
}

fn paths(list: &[PathBuf]) -> Vec<String> {
    list.iter().map(|p| p.to_string_lossy().into_owned()).collect()
}

fn resolve(r: &Ref, input: &CommandInput<'_>, source: &str) -> Result<Vec<String>> {
    let at = |list: &[PathBuf], idx: usize, what: &str| -> Result<Vec<String>> {
        list.get(idx)
            .map(|p| vec![p.to_string_lossy().into_owned()])
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "{}[{}] out of range in command '{}'",
                    what, idx, source
                ))
            })
    };

    match r {
        Ref::Var(name) => Ok(input.env.get_list(name)),
        Ref::Src => Ok(paths(input.inputs)),
        Ref::Tgt => Ok(paths(input.outputs)),
        Ref::SrcAt(idx) => at(input.inputs, *idx, "SRC"),
        Ref::TgtAt(idx) => at(input.outputs, *idx, "TGT"),
        Ref::Dep => input
            .dep
            .map(|p| vec![p.to_string_lossy().into_owned()])
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "${{DEP}} used outside a modify step in '{}'",
                    source
                ))
            }),
    }
}

/// Single-quote `value` for `sh -c` unless it is made of plain characters only
fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Expand one word; literal pieces glue onto every value of an adjacent reference.
/// Under a shell, expanded values are quoted and literal pieces are left as written.
fn expand_word(
    word: &[Piece],
    input: &CommandInput<'_>,
    source: &str,
    shell: bool,
) -> Result<Vec<String>> {
    let mut acc = vec![String::new()];
    for piece in word {
        match piece {
            Piece::Lit(text) => acc.iter_mut().for_each(|s| s.push_str(text)),
            Piece::Ref(r) => {
                let mut values = resolve(r, input, source)?;
                if values.is_empty() {
                    return Ok(Vec::new());
                }
                if shell {
                    values = values.iter().map(|v| shell_quote(v)).collect();
                }
                acc = acc
                    .iter()
                    .flat_map(|prefix| values.iter().map(move |v| format!("{}{}", prefix, v)))
                    .collect();
            }
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(env: &'a ConfigSet, ins: &'a [PathBuf], outs: &'a [PathBuf]) -> CommandInput<'a> {
        CommandInput {
            env,
            inputs: ins,
            outputs: outs,
            dep: None,
        }
    }

    #[test]
    fn test_vars_are_collected_once() {
        let t = CommandTemplate::parse("${CC} ${CFLAGS} -c ${SRC} -o ${TGT} ${CC}").unwrap();
        assert_eq!(t.vars(), &["CC".to_string(), "CFLAGS".to_string()]);
        assert!(!t.is_shell());
    }

    #[test]
    fn test_argv_expansion() {
        let env = ConfigSet::new()
            .with("CC", "gcc")
            .with("CFLAGS", vec!["-O2".to_string(), "-Wall".to_string()])
            .with("INCLUDES", vec!["a".to_string(), "b".to_string()]);
        let ins = [PathBuf::from("x.c")];
        let outs = [PathBuf::from("x.o")];
        let t = CommandTemplate::parse("${CC} ${CFLAGS} -I${INCLUDES} -c ${SRC[0]} -o ${TGT}")
            .unwrap();

        let line = t.evaluate(&input(&env, &ins, &outs)).unwrap();
        assert_eq!(
            line,
            CommandLine::Argv(
                ["gcc", "-O2", "-Wall", "-Ia", "-Ib", "-c", "x.c", "-o", "x.o"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            )
        );
    }

    #[test]
    fn test_undefined_variable_drops_the_word() {
        let env = ConfigSet::new().with("CC", "cc");
        let t = CommandTemplate::parse("${CC} -D${DEFINES} ok").unwrap();
        let line = t.evaluate(&input(&env, &[], &[])).unwrap();
        assert_eq!(line, CommandLine::Argv(vec!["cc".into(), "ok".into()]));
    }

    #[test]
    fn test_shell_mode_and_dollar_escape() {
        let env = ConfigSet::new();
        let ins = [PathBuf::from("in.txt")];
        let outs = [PathBuf::from("out.txt")];
        let t = CommandTemplate::parse("cat ${SRC} | tr a-z A-Z > ${TGT} && echo $$HOME").unwrap();
        assert!(t.is_shell());
        let line = t.evaluate(&input(&env, &ins, &outs)).unwrap();
        assert_eq!(
            line,
            CommandLine::Shell("cat in.txt | tr a-z A-Z > out.txt && echo $HOME".into())
        );
    }

    #[test]
    fn test_shell_values_are_quoted() {
        let env = ConfigSet::new().with("MSG", "it's; rm -rf x");
        let ins = [PathBuf::from("my file.txt")];
        let outs = [PathBuf::from("out dir/o.txt")];
        let t = CommandTemplate::parse("echo ${MSG} > ${TGT} && cat ${SRC} >> ${TGT}").unwrap();
        let line = t.evaluate(&input(&env, &ins, &outs)).unwrap();
        assert_eq!(
            line,
            CommandLine::Shell(
                r"echo 'it'\''s; rm -rf x' > 'out dir/o.txt' && cat 'my file.txt' >> 'out dir/o.txt'"
                    .into()
            )
        );

        // argv mode passes values through untouched
        let t = CommandTemplate::parse("cat ${SRC}").unwrap();
        let line = t.evaluate(&input(&env, &ins, &outs)).unwrap();
        assert_eq!(line, CommandLine::Argv(vec!["cat".into(), "my file.txt".into()]));
    }

    #[test]
    fn test_errors() {
        assert!(CommandTemplate::parse("   ").is_err());
        assert!(CommandTemplate::parse("echo ${UNCLOSED").is_err());
        assert!(CommandTemplate::parse("echo ${SRC[x]}").is_err());

        let env = ConfigSet::new();
        let t = CommandTemplate::parse("cp ${SRC[1]} ${TGT}").unwrap();
        let ins = [PathBuf::from("only.txt")];
        assert!(t.evaluate(&input(&env, &ins, &[])).is_err());

        let t = CommandTemplate::parse("patch ${DEP} ${TGT}").unwrap();
        assert!(t.evaluate(&input(&env, &[], &[])).is_err());
    }
}
